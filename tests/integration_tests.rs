//! Integration tests for Options Pilot
//!
//! Drives the registry and its agents against the paper broker and the
//! in-memory store. Most tests run ticks by hand with the agent timers set
//! far enough out that they never fire; the timer tests run on paused time.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use mockall::mock;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use options_pilot::agent::expiry::eastern_date;
use options_pilot::agent::{AgentDeps, ArbitrationContext, EntryRequest, PositionPhase};
use options_pilot::agentic::{AdvisorError, AiAdvisor, HoldAdvisor, TradeEvaluationInput, TradeEvaluator};
use options_pilot::config::{AgentConfig, GateConfig, MarketConfig, SizingConfig};
use options_pilot::events::{EventBus, PositionEvent};
use options_pilot::execution::paper::{PaperBroker, PaperConfig};
use options_pilot::execution::{Broker, BrokerError, BrokerOrder};
use options_pilot::position::{
    AiAction, OrderKind, Position, PositionRegistry, PositionStatus, RegistryError,
};
use options_pilot::risk::sizing::{ConvictionTier, SizingResult};
use options_pilot::risk::{screen_entry, AccountState, GateId};
use options_pilot::store::{MemoryStore, PositionStore};
use options_pilot::telemetry::{Alert, Notifier};
use options_pilot::utils::types::{
    DecisionAction, Direction, OptionCandidate, OptionSide, OrderStatus, TradeDecision, Urgency,
};

mock! {
    pub Advisor {}

    #[async_trait]
    impl AiAdvisor for Advisor {
        async fn recommend(&self, context: &ArbitrationContext) -> Result<String, AdvisorError>;
    }
}

/// Replays canned responses in order, then holds
#[derive(Default)]
struct ScriptedAdvisor {
    responses: Mutex<VecDeque<String>>,
    calls: AtomicUsize,
}

impl ScriptedAdvisor {
    fn new(responses: &[&str]) -> Self {
        Self {
            responses: Mutex::new(responses.iter().map(|r| r.to_string()).collect()),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl AiAdvisor for ScriptedAdvisor {
    async fn recommend(&self, _context: &ArbitrationContext) -> Result<String, AdvisorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .responses
            .lock()
            .pop_front()
            .unwrap_or_else(|| r#"{"action":"HOLD"}"#.to_string()))
    }
}

#[derive(Default)]
struct RecordingNotifier {
    alerts: Mutex<Vec<Alert>>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, alert: Alert) {
        self.alerts.lock().push(alert);
    }
}

#[derive(Default)]
struct RecordingEvaluator {
    trades: Mutex<Vec<TradeEvaluationInput>>,
}

#[async_trait]
impl TradeEvaluator for RecordingEvaluator {
    async fn evaluate(&self, trade: &TradeEvaluationInput) -> anyhow::Result<()> {
        self.trades.lock().push(trade.clone());
        Ok(())
    }
}

struct Harness {
    broker: Arc<PaperBroker>,
    store: Arc<MemoryStore>,
    notifier: Arc<RecordingNotifier>,
    evaluator: Arc<RecordingEvaluator>,
    events: EventBus,
    registry: PositionRegistry,
}

fn test_agent_config() -> AgentConfig {
    AgentConfig {
        tick_interval_secs: 3600,
        ai_review_every_ticks: 1,
        fill_poll_attempts: 2,
        fill_poll_interval_ms: 1,
        recent_ticks_in_context: 5,
        recent_outcomes_in_context: 5,
        close_write_retries: 3,
    }
}

fn harness_with(
    advisor: Arc<dyn AiAdvisor>,
    paper: PaperConfig,
    broker: Option<Arc<PaperBroker>>,
    store: Option<Arc<MemoryStore>>,
) -> Harness {
    let broker = broker.unwrap_or_else(|| Arc::new(PaperBroker::new(paper)));
    build_harness(
        advisor,
        broker.clone(),
        broker,
        store,
        test_agent_config(),
        MarketConfig::default(),
    )
}

/// `venue` is what the agents trade through; `broker` is the paper book
/// behind it that the test inspects
fn build_harness(
    advisor: Arc<dyn AiAdvisor>,
    broker: Arc<PaperBroker>,
    venue: Arc<dyn Broker>,
    store: Option<Arc<MemoryStore>>,
    agent: AgentConfig,
    market: MarketConfig,
) -> Harness {
    let store = store.unwrap_or_else(|| Arc::new(MemoryStore::new()));
    let notifier = Arc::new(RecordingNotifier::default());
    let evaluator = Arc::new(RecordingEvaluator::default());
    let events = EventBus::new(256);

    let deps = AgentDeps {
        broker: venue,
        store: store.clone(),
        advisor,
        notifier: notifier.clone(),
        evaluator: evaluator.clone(),
        events: events.clone(),
        agent,
        market,
    };

    Harness {
        broker,
        store,
        notifier,
        evaluator,
        events,
        registry: PositionRegistry::new(deps, 2),
    }
}

/// Paper broker whose limit buys take `delay` to come back
struct SlowEntryBroker {
    inner: Arc<PaperBroker>,
    delay: StdDuration,
}

#[async_trait]
impl Broker for SlowEntryBroker {
    async fn submit_limit_buy(
        &self,
        symbol: &str,
        quantity: u32,
        limit_price: f64,
    ) -> Result<BrokerOrder, BrokerError> {
        tokio::time::sleep(self.delay).await;
        self.inner.submit_limit_buy(symbol, quantity, limit_price).await
    }

    async fn submit_market_sell(&self, symbol: &str, quantity: u32) -> Result<BrokerOrder, BrokerError> {
        self.inner.submit_market_sell(symbol, quantity).await
    }

    async fn cancel_open_orders(&self, symbol: Option<&str>) -> Result<usize, BrokerError> {
        self.inner.cancel_open_orders(symbol).await
    }

    async fn get_order(&self, order_id: &str) -> Result<BrokerOrder, BrokerError> {
        self.inner.get_order(order_id).await
    }

    async fn get_position_prices(&self) -> Result<HashMap<String, f64>, BrokerError> {
        self.inner.get_position_prices().await
    }
}

fn harness() -> Harness {
    harness_with(Arc::new(HoldAdvisor), PaperConfig::default(), None, None)
}

fn entry(ticker: &str, side: OptionSide, quantity: u32, limit: f64, stop: f64) -> EntryRequest {
    let symbol = format!(
        "{}{}{}",
        ticker,
        uuid::Uuid::new_v4().simple(),
        if side == OptionSide::Call { "C" } else { "P" }
    );
    EntryRequest {
        decision: TradeDecision {
            id: uuid::Uuid::new_v4().to_string(),
            ticker: ticker.to_string(),
            action: DecisionAction::Open,
            direction: if side == OptionSide::Call {
                Direction::Bullish
            } else {
                Direction::Bearish
            },
            confidence: 0.8,
            reasoning: "breakout".to_string(),
            session_id: Some("session-1".to_string()),
            created_at: Utc::now(),
        },
        candidate: OptionCandidate {
            symbol,
            side,
            strike: 550.0,
            expiration: Utc::now().date_naive() + Duration::days(30),
            bid: limit - 0.02,
            ask: limit,
            spread_pct: 1.0,
            stop_price: stop,
            take_profit_price: limit * 2.0,
            risk_reward: 2.0,
            passed: true,
        },
        sizing: SizingResult {
            quantity,
            conviction_score: 8.0,
            tier: ConvictionTier::MaxConviction,
            base_risk: 250.0,
            effective_risk: 500.0,
            risk_per_contract: (limit - stop) * 100.0,
            limit_price: limit,
        },
        session_id: Some("session-1".to_string()),
        entry_confidence: 0.8,
        entry_alignment: "ALIGNED".to_string(),
        entry_direction: if side == OptionSide::Call { "BULLISH" } else { "BEARISH" }.to_string(),
    }
}

fn call_entry(ticker: &str) -> EntryRequest {
    entry(ticker, OptionSide::Call, 2, 2.0, 1.0)
}

fn open_row(ticker: &str, realized_pnl: f64) -> Position {
    let now = Utc::now();
    Position {
        id: uuid::Uuid::new_v4().to_string(),
        decision_id: "orphan-decision".to_string(),
        session_id: None,
        ticker: ticker.to_string(),
        option_symbol: format!("{}-ORPHAN", ticker),
        side: OptionSide::Call,
        strike: 100.0,
        expiration: now.date_naive() + Duration::days(7),
        quantity: 1,
        entry_price: 1.0,
        limit_price: 1.0,
        stop_price: 0.5,
        take_profit_price: 2.0,
        conviction_score: 4.0,
        conviction_tier: ConvictionTier::Regular,
        status: PositionStatus::Open,
        entry_order_id: None,
        entry_confidence: 0.7,
        entry_alignment: "ALIGNED".to_string(),
        entry_direction: "BULLISH".to_string(),
        opened_at: now,
        closed_at: None,
        close_reason: None,
        exit_price: None,
        realized_pnl,
        updated_at: now,
    }
}

async fn row(h: &Harness, id: &str) -> Position {
    h.store.get_position(id).await.unwrap().unwrap()
}

async fn exit_orders(h: &Harness, id: &str) -> usize {
    h.store
        .orders_for(id)
        .await
        .unwrap()
        .iter()
        .filter(|o| o.kind == OrderKind::Exit)
        .count()
}

#[tokio::test]
async fn test_immediate_fill_moves_to_monitoring() {
    let h = harness();
    let mut events = h.events.subscribe();

    let id = h.registry.create_and_start(call_entry("SPY")).await.unwrap();
    let agent = h.registry.get(&id).unwrap();

    assert_eq!(agent.phase(), PositionPhase::Monitoring);
    let pos = row(&h, &id).await;
    assert!(pos.is_open());
    assert_eq!(pos.entry_price, 2.0);
    assert!(pos.entry_order_id.is_some());
    assert_eq!(h.store.orders_for(&id).await.unwrap()[0].kind, OrderKind::Entry);

    assert!(matches!(events.try_recv().unwrap(), PositionEvent::Opened { .. }));
    assert!(matches!(
        events.try_recv().unwrap(),
        PositionEvent::Filled { fill_price: Some(_), quantity: 2, .. }
    ));
}

#[tokio::test]
async fn test_third_entry_on_capped_ticker_is_rejected_before_broker() {
    let h = harness();
    h.registry.create_and_start(call_entry("QQQ")).await.unwrap();
    h.registry.create_and_start(call_entry("QQQ")).await.unwrap();

    let third = h.registry.create_and_start(call_entry("QQQ")).await;
    assert_eq!(
        third,
        Err(RegistryError::TickerCapReached {
            ticker: "QQQ".to_string(),
            open: 2,
            cap: 2
        })
    );
    assert_eq!(h.broker.buy_orders().len(), 2);
    assert_eq!(h.store.position_count(), 2);
    assert_eq!(h.registry.active_count(), 2);

    // Other tickers are unaffected
    assert!(h.registry.create_and_start(call_entry("IWM")).await.is_ok());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_entries_never_exceed_cap() {
    let h = harness();
    let registry = Arc::new(h.registry);

    let handles: Vec<_> = (0..6)
        .map(|_| {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.create_and_start(call_entry("TSLA")).await })
        })
        .collect();

    let mut accepted = 0;
    for handle in handles {
        if handle.await.unwrap().is_ok() {
            accepted += 1;
        }
    }

    assert_eq!(accepted, 2);
    assert_eq!(registry.agents_for_ticker("TSLA").len(), 2);
    assert_eq!(h.broker.buy_orders().len(), 2);
}

#[tokio::test]
async fn test_broker_rejection_fails_entry_and_frees_slot() {
    let h = harness();
    h.broker
        .fail_next_submit(BrokerError::Rejected("insufficient buying power".to_string()));

    let err = h.registry.create_and_start(call_entry("AAPL")).await.unwrap_err();
    match err {
        RegistryError::EntryFailed { ticker, reason } => {
            assert_eq!(ticker, "AAPL");
            assert!(reason.contains("ENTRY_SUBMIT_FAILED"));
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(h.registry.active_count(), 0);

    let voided = h.store.list_open_positions(Some("AAPL")).await.unwrap();
    assert!(voided.is_empty());

    h.registry.create_and_start(call_entry("AAPL")).await.unwrap();
    h.registry.create_and_start(call_entry("AAPL")).await.unwrap();
}

#[tokio::test]
async fn test_zero_quantity_is_invalid() {
    let h = harness();
    let mut request = call_entry("SPY");
    request.sizing.quantity = 0;

    assert!(matches!(
        h.registry.create_and_start(request).await,
        Err(RegistryError::InvalidRequest(_))
    ));
    assert!(h.broker.orders().is_empty());
}

#[tokio::test]
async fn test_deferred_fill_confirmed_on_tick() {
    let h = harness_with(
        Arc::new(HoldAdvisor),
        PaperConfig {
            fill_entries_immediately: false,
            ..Default::default()
        },
        None,
        None,
    );
    let id = h.registry.create_and_start(call_entry("SPY")).await.unwrap();
    let agent = h.registry.get(&id).unwrap();
    assert_eq!(agent.phase(), PositionPhase::AwaitingFill);

    agent.run_tick().await;
    assert_eq!(agent.phase(), PositionPhase::AwaitingFill);

    let order_id = h.broker.buy_orders()[0].order_id.clone();
    h.broker.set_order_fill(&order_id, OrderStatus::Filled, Some(1.95));
    agent.run_tick().await;

    assert_eq!(agent.phase(), PositionPhase::Monitoring);
    assert_eq!(row(&h, &id).await.entry_price, 1.95);
}

#[tokio::test]
async fn test_dead_entry_order_fails_and_voids() {
    let h = harness_with(
        Arc::new(HoldAdvisor),
        PaperConfig {
            fill_entries_immediately: false,
            ..Default::default()
        },
        None,
        None,
    );
    let id = h.registry.create_and_start(call_entry("SPY")).await.unwrap();
    let agent = h.registry.get(&id).unwrap();

    let order_id = h.broker.buy_orders()[0].order_id.clone();
    h.broker.set_order_fill(&order_id, OrderStatus::Expired, None);
    agent.run_tick().await;

    assert_eq!(agent.phase(), PositionPhase::Failed);
    assert!(h.registry.get(&id).is_none());
    let pos = row(&h, &id).await;
    assert_eq!(pos.status, PositionStatus::Closed);
    assert_eq!(pos.exit_price, None);
    assert_eq!(pos.close_reason.as_deref(), Some("ENTRY_EXPIRED"));
}

#[tokio::test]
async fn test_stop_hit_closes_with_one_sell() {
    let h = harness();
    let mut events = h.events.subscribe();
    let request = call_entry("SPY");
    let symbol = request.candidate.symbol.clone();

    let id = h.registry.create_and_start(request).await.unwrap();
    let agent = h.registry.get(&id).unwrap();

    h.broker.set_mark(&symbol, 0.99);
    agent.run_tick().await;

    assert_eq!(agent.phase(), PositionPhase::Closed);
    assert!(h.registry.get(&id).is_none());

    let pos = row(&h, &id).await;
    assert_eq!(pos.status, PositionStatus::Closed);
    assert!(pos.close_reason.as_deref().unwrap().contains("STOP_HIT"));
    assert_eq!(pos.exit_price, Some(0.99));
    assert!((pos.realized_pnl - (0.99 - 2.0) * 2.0 * 100.0).abs() < 1e-9);

    assert_eq!(h.broker.sell_orders(&symbol).len(), 1);
    assert_eq!(exit_orders(&h, &id).await, 1);
    assert_eq!(h.evaluator.trades.lock().len(), 1);
    assert!(h
        .notifier
        .alerts
        .lock()
        .iter()
        .any(|a| a.title == "Position closed"));

    let mut saw_closed = false;
    while let Ok(event) = events.try_recv() {
        if let PositionEvent::Closed { reason, .. } = event {
            assert!(reason.starts_with("STOP_HIT"));
            saw_closed = true;
        }
    }
    assert!(saw_closed);
}

#[tokio::test]
async fn test_take_profit_hit() {
    let h = harness();
    let request = call_entry("SPY");
    let symbol = request.candidate.symbol.clone();
    let id = h.registry.create_and_start(request).await.unwrap();

    h.broker.set_mark(&symbol, 4.2);
    h.registry.get(&id).unwrap().run_tick().await;

    let pos = row(&h, &id).await;
    assert!(pos.close_reason.as_deref().unwrap().starts_with("TP_HIT"));
    assert!((pos.realized_pnl - 440.0).abs() < 1e-9);
}

#[tokio::test]
async fn test_expired_contract_is_force_closed() {
    let h = harness();
    let mut request = call_entry("SPY");
    request.candidate.expiration = Utc::now().date_naive() - Duration::days(2);

    let id = h.registry.create_and_start(request).await.unwrap();
    h.registry.get(&id).unwrap().run_tick().await;

    let pos = row(&h, &id).await;
    assert_eq!(pos.status, PositionStatus::Closed);
    assert!(pos
        .close_reason
        .as_deref()
        .unwrap()
        .starts_with("EXPIRY_FORCE_CLOSE"));
}

#[tokio::test]
async fn test_position_closed_elsewhere_stops_agent() {
    let h = harness();
    let id = h.registry.create_and_start(call_entry("SPY")).await.unwrap();
    let agent = h.registry.get(&id).unwrap();

    h.store
        .update_position(
            &id,
            &options_pilot::position::PositionUpdate::close("MANUAL", Some(2.0), 0.0),
        )
        .await
        .unwrap();
    agent.run_tick().await;

    assert_eq!(agent.phase(), PositionPhase::Closed);
    assert!(h.registry.get(&id).is_none());
    assert!(h.broker.sell_orders(agent.option_symbol()).is_empty());
}

#[tokio::test]
async fn test_double_exit_sells_once() {
    let h = harness();
    let request = call_entry("NVDA");
    let symbol = request.candidate.symbol.clone();
    let id = h.registry.create_and_start(request).await.unwrap();
    let agent = h.registry.get(&id).unwrap();

    let exit = options_pilot::utils::types::OrchestratorSuggestion::exit("risk off", Urgency::Immediate);
    tokio::join!(
        agent.process_orchestrator_decision(&exit),
        agent.process_orchestrator_decision(&exit),
        h.registry.notify_exit("NVDA", "risk off", Urgency::Immediate),
    );

    assert_eq!(agent.phase(), PositionPhase::Closed);
    assert_eq!(h.broker.sell_orders(&symbol).len(), 1);
    assert_eq!(exit_orders(&h, &id).await, 1);
    assert_eq!(h.evaluator.trades.lock().len(), 1);
}

#[tokio::test]
async fn test_failed_exit_stays_closing_and_retries() {
    let h = harness();
    let mut events = h.events.subscribe();
    let request = call_entry("SPY");
    let symbol = request.candidate.symbol.clone();
    let id = h.registry.create_and_start(request).await.unwrap();
    let agent = h.registry.get(&id).unwrap();

    h.broker.set_mark(&symbol, 0.9);
    h.broker
        .fail_next_submit(BrokerError::Unavailable("gateway timeout".to_string()));
    agent.run_tick().await;

    assert_eq!(agent.phase(), PositionPhase::Closing);
    assert!(row(&h, &id).await.is_open());
    assert!(agent.status().pending_exit.unwrap().starts_with("STOP_HIT"));
    assert!(h.registry.get(&id).is_some());

    let mut saw_failure = false;
    while let Ok(event) = events.try_recv() {
        saw_failure |= matches!(event, PositionEvent::ExitFailed { .. });
    }
    assert!(saw_failure);

    agent.run_tick().await;
    assert_eq!(agent.phase(), PositionPhase::Closed);
    assert_eq!(h.broker.sell_orders(&symbol).len(), 1);
    assert!(row(&h, &id)
        .await
        .close_reason
        .unwrap()
        .starts_with("STOP_HIT"));
}

#[tokio::test]
async fn test_close_write_is_retried() {
    let h = harness();
    let request = call_entry("SPY");
    let symbol = request.candidate.symbol.clone();
    let id = h.registry.create_and_start(request).await.unwrap();

    h.broker.set_mark(&symbol, 0.5);
    h.store.fail_next_updates(2);
    h.registry.get(&id).unwrap().run_tick().await;

    let pos = row(&h, &id).await;
    assert_eq!(pos.status, PositionStatus::Closed);
    assert_eq!(pos.exit_price, Some(0.5));
}

#[tokio::test]
async fn test_immediate_exit_before_fill_voids_position() {
    let h = harness_with(
        Arc::new(HoldAdvisor),
        PaperConfig {
            fill_entries_immediately: false,
            ..Default::default()
        },
        None,
        None,
    );
    let mut events = h.events.subscribe();
    let request = call_entry("AMD");
    let symbol = request.candidate.symbol.clone();
    let id = h.registry.create_and_start(request).await.unwrap();

    let outcome = h
        .registry
        .notify_exit("AMD", "earnings gap", Urgency::Immediate)
        .await;
    assert_eq!(outcome.delivered, 1);

    let pos = row(&h, &id).await;
    assert_eq!(pos.status, PositionStatus::Closed);
    assert_eq!(pos.exit_price, None);
    assert!(pos.close_reason.unwrap().contains("entry unfilled"));
    assert_eq!(h.broker.buy_orders()[0].status, OrderStatus::Canceled);
    assert!(h.broker.sell_orders(&symbol).is_empty());
    assert!(h.registry.get(&id).is_none());
    assert!(h.evaluator.trades.lock().is_empty());

    let mut saw_void = false;
    while let Ok(event) = events.try_recv() {
        saw_void |= matches!(event, PositionEvent::Voided { .. });
    }
    assert!(saw_void);
}

#[tokio::test]
async fn test_immediate_exit_after_partial_fill_sells_filled_part() {
    let h = harness_with(
        Arc::new(HoldAdvisor),
        PaperConfig {
            fill_entries_immediately: false,
            ..Default::default()
        },
        None,
        None,
    );
    let request = entry("AMD", OptionSide::Call, 3, 2.0, 1.0);
    let symbol = request.candidate.symbol.clone();
    let id = h.registry.create_and_start(request).await.unwrap();

    let order_id = h.broker.buy_orders()[0].order_id.clone();
    h.broker.set_filled_quantity(&order_id, 1);
    h.broker.set_mark(&symbol, 2.3);

    h.registry
        .notify_exit("AMD", "earnings gap", Urgency::Immediate)
        .await;

    let sells = h.broker.sell_orders(&symbol);
    assert_eq!(sells.len(), 1);
    assert_eq!(sells[0].quantity, 1);
    let pos = row(&h, &id).await;
    assert_eq!(pos.status, PositionStatus::Closed);
    assert_eq!(pos.quantity, 1);
    assert_eq!(pos.exit_price, Some(2.3));
}

#[tokio::test]
async fn test_standard_exit_with_failing_advisor_keeps_monitoring() {
    let mut advisor = MockAdvisor::new();
    advisor
        .expect_recommend()
        .times(1)
        .returning(|_| Err(AdvisorError::Timeout));

    let h = harness_with(Arc::new(advisor), PaperConfig::default(), None, None);
    let request = call_entry("META");
    let symbol = request.candidate.symbol.clone();
    let id = h.registry.create_and_start(request).await.unwrap();

    let outcome = h
        .registry
        .notify_exit("META", "sector rotation", Urgency::Standard)
        .await;

    assert_eq!(outcome.delivered, 1);
    let agent = h.registry.get(&id).unwrap();
    assert_eq!(agent.phase(), PositionPhase::Monitoring);
    assert!(h.store.ticks_for(&id).is_empty());
    assert!(h.broker.sell_orders(&symbol).is_empty());
}

#[tokio::test]
async fn test_advisor_sees_suggestion_and_can_exit() {
    let mut advisor = MockAdvisor::new();
    advisor
        .expect_recommend()
        .withf(|ctx: &ArbitrationContext| {
            ctx.suggestion.as_ref().map(|s| s.reason.as_str()) == Some("trend flip")
                && ctx.position.current_price == 2.0
        })
        .times(1)
        .returning(|_| Ok(r#"{"action":"EXIT","reasoning":"agree with orchestrator"}"#.to_string()));

    let h = harness_with(Arc::new(advisor), PaperConfig::default(), None, None);
    let id = h.registry.create_and_start(call_entry("META")).await.unwrap();

    h.registry
        .notify_exit("META", "trend flip", Urgency::Standard)
        .await;

    let ticks = h.store.ticks_for(&id);
    assert_eq!(ticks.len(), 1);
    assert_eq!(ticks[0].action, AiAction::Exit);
    assert_eq!(ticks[0].suggestion.as_deref(), Some("trend flip"));

    let pos = row(&h, &id).await;
    assert!(pos.close_reason.unwrap().starts_with("AI_EXIT"));
}

#[tokio::test]
async fn test_adjust_stop_only_tightens() {
    let advisor = Arc::new(ScriptedAdvisor::new(&[
        r#"{"action":"ADJUST_STOP","new_stop":1.6,"reasoning":"trail"}"#,
        r#"{"action":"ADJUST_STOP","new_stop":1.2,"reasoning":"give room"}"#,
        r#"{"action":"ADJUST_STOP","new_stop":2.5,"reasoning":"lock it all"}"#,
    ]));
    let h = harness_with(advisor.clone(), PaperConfig::default(), None, None);
    let request = entry("SPY", OptionSide::Call, 2, 2.0, 1.5);
    let symbol = request.candidate.symbol.clone();
    let id = h.registry.create_and_start(request).await.unwrap();
    let agent = h.registry.get(&id).unwrap();

    h.broker.set_mark(&symbol, 2.2);
    agent.run_tick().await;
    assert_eq!(row(&h, &id).await.stop_price, 1.6);

    agent.run_tick().await;
    assert_eq!(row(&h, &id).await.stop_price, 1.6);

    // Above the live price would fire immediately
    agent.run_tick().await;
    assert_eq!(row(&h, &id).await.stop_price, 1.6);

    assert_eq!(advisor.calls.load(Ordering::SeqCst), 3);
    let ticks = h.store.ticks_for(&id);
    assert_eq!(ticks.len(), 3);
    assert_eq!(ticks[0].new_stop, Some(1.6));
    assert_eq!(ticks[1].new_stop, None);
    assert_eq!(ticks[2].new_stop, None);
    assert_eq!(agent.phase(), PositionPhase::Monitoring);
}

#[tokio::test]
async fn test_ai_reduce_halves_then_single_contract_exits() {
    let advisor = Arc::new(ScriptedAdvisor::new(&[
        r#"{"action":"REDUCE","reasoning":"take some off"}"#,
        r#"{"action":"REDUCE","reasoning":"take the rest"}"#,
    ]));
    let h = harness_with(advisor, PaperConfig::default(), None, None);
    let request = call_entry("SPY");
    let symbol = request.candidate.symbol.clone();
    let id = h.registry.create_and_start(request).await.unwrap();
    let agent = h.registry.get(&id).unwrap();

    h.broker.set_mark(&symbol, 2.5);
    agent.run_tick().await;
    let pos = row(&h, &id).await;
    assert_eq!(pos.quantity, 1);
    assert!((pos.realized_pnl - 50.0).abs() < 1e-9);

    agent.run_tick().await;
    let pos = row(&h, &id).await;
    assert_eq!(pos.status, PositionStatus::Closed);
    assert!(pos.close_reason.unwrap().starts_with("REDUCED_TO_ZERO"));
    assert!((pos.realized_pnl - 100.0).abs() < 1e-9);
}

#[tokio::test]
async fn test_manual_reduce_accumulates_realized_pnl() {
    let h = harness();
    let request = entry("SPY", OptionSide::Call, 4, 2.0, 1.0);
    let symbol = request.candidate.symbol.clone();
    let id = h.registry.create_and_start(request).await.unwrap();
    let agent = h.registry.get(&id).unwrap();

    h.broker.set_mark(&symbol, 2.5);
    agent.handle_reduce(0).await;

    let pos = row(&h, &id).await;
    assert_eq!(pos.quantity, 2);
    assert!((pos.realized_pnl - 100.0).abs() < 1e-9);
    assert_eq!(agent.phase(), PositionPhase::Monitoring);

    agent.handle_reduce(5).await;
    let pos = row(&h, &id).await;
    assert_eq!(pos.status, PositionStatus::Closed);
    assert!((pos.realized_pnl - 200.0).abs() < 1e-9);

    let sells = h.broker.sell_orders(&symbol);
    assert_eq!(sells.iter().map(|o| o.quantity).collect::<Vec<_>>(), vec![2, 2]);
    let trades = h.evaluator.trades.lock();
    assert_eq!(trades.len(), 1);
    assert!((trades[0].realized_pnl - 200.0).abs() < 1e-9);
}

#[tokio::test]
async fn test_immediate_reduce_suggestion() {
    let h = harness();
    let request = entry("SPY", OptionSide::Put, 3, 2.0, 1.0);
    let symbol = request.candidate.symbol.clone();
    let id = h.registry.create_and_start(request).await.unwrap();

    let outcome = h
        .registry
        .notify_reduce("SPY", "exposure limit", Urgency::Immediate)
        .await;
    assert_eq!(outcome.delivered, 1);
    assert_eq!(row(&h, &id).await.quantity, 2);
    assert_eq!(h.broker.sell_orders(&symbol)[0].quantity, 1);
}

#[tokio::test]
async fn test_remove_is_idempotent() {
    let h = harness();
    let id = h.registry.create_and_start(call_entry("SPY")).await.unwrap();

    assert!(h.registry.remove(&id));
    assert!(!h.registry.remove(&id));
    assert!(!h.registry.remove("never-registered"));
    assert_eq!(h.registry.active_count(), 0);
}

#[tokio::test]
async fn test_notify_without_agents_closes_rows_directly() {
    let h = harness();
    let orphan = open_row("GME", 35.0);
    h.store.insert_position(&orphan).await.unwrap();

    let outcome = h
        .registry
        .notify_exit("GME", "halted", Urgency::Standard)
        .await;
    assert_eq!(outcome.delivered, 0);
    assert_eq!(outcome.fallback_closed, 1);

    let pos = row(&h, &orphan.id).await;
    assert_eq!(pos.status, PositionStatus::Closed);
    assert_eq!(pos.exit_price, None);
    assert_eq!(pos.realized_pnl, 35.0);
    assert_eq!(pos.close_reason.as_deref(), Some("FALLBACK_CLOSE: halted"));
}

#[tokio::test]
async fn test_close_all_positions() {
    let h = harness();
    let spy = h.registry.create_and_start(call_entry("SPY")).await.unwrap();
    let qqq = h.registry.create_and_start(call_entry("QQQ")).await.unwrap();
    let orphan = open_row("IWM", 0.0);
    h.store.insert_position(&orphan).await.unwrap();

    let report = h.registry.close_all_positions("MANUAL_CLOSE_ALL", None).await;

    assert_eq!(report.notified, 2);
    assert_eq!(report.fallback_closed, 1);
    assert!(report.errors.is_empty());
    assert_eq!(h.registry.active_count(), 0);
    for id in [&spy, &qqq, &orphan.id] {
        assert_eq!(row(&h, id).await.status, PositionStatus::Closed);
    }
    assert!(h.store.list_open_positions(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_close_all_scoped_to_ticker_cancels_its_orders() {
    let h = harness_with(
        Arc::new(HoldAdvisor),
        PaperConfig {
            fill_entries_immediately: false,
            ..Default::default()
        },
        None,
        None,
    );
    let spy = h.registry.create_and_start(call_entry("SPY")).await.unwrap();
    let qqq = h.registry.create_and_start(call_entry("QQQ")).await.unwrap();

    let report = h.registry.close_all_positions("RISK_OFF", Some("SPY")).await;

    assert_eq!(report.notified, 1);
    assert_eq!(row(&h, &spy).await.status, PositionStatus::Closed);
    assert!(row(&h, &qqq).await.is_open());
    assert!(h.registry.get(&qqq).is_some());

    let statuses: Vec<_> = h.broker.buy_orders().iter().map(|o| o.status).collect();
    assert_eq!(statuses, vec![OrderStatus::Canceled, OrderStatus::Accepted]);
}

#[tokio::test]
async fn test_shutdown_all_leaves_rows_open() {
    let h = harness();
    let id = h.registry.create_and_start(call_entry("SPY")).await.unwrap();
    let agent = h.registry.get(&id).unwrap();

    h.registry.shutdown_all();

    assert_eq!(h.registry.active_count(), 0);
    assert_eq!(agent.phase(), PositionPhase::Closed);
    assert!(row(&h, &id).await.is_open());
}

#[tokio::test]
async fn test_restore_then_exit_matches_fresh_close() {
    let path = std::env::temp_dir().join(format!("options-pilot-restore-{}.json", uuid::Uuid::new_v4()));
    let broker = Arc::new(PaperBroker::new(PaperConfig::default()));

    let request = call_entry("SPY");
    let symbol = request.candidate.symbol.clone();
    let id = {
        let store = Arc::new(MemoryStore::open(&path).await.unwrap());
        let h = harness_with(Arc::new(HoldAdvisor), PaperConfig::default(), Some(broker.clone()), Some(store));
        let id = h.registry.create_and_start(request).await.unwrap();
        h.registry.shutdown_all();
        id
    };

    let store = Arc::new(MemoryStore::open(&path).await.unwrap());
    let h = harness_with(Arc::new(HoldAdvisor), PaperConfig::default(), Some(broker.clone()), Some(store));

    let report = h.registry.restore_from_db().await;
    assert_eq!(report.restored, 1);
    assert!(report.errors.is_empty());

    let agent = h.registry.get(&id).unwrap();
    assert_eq!(agent.phase(), PositionPhase::Monitoring);
    assert_eq!(agent.status().initial_quantity, 2);

    // Already running agents are not restored twice
    let again = h.registry.restore_from_db().await;
    assert_eq!(again.restored, 0);
    assert_eq!(again.skipped, 1);

    broker.set_mark(&symbol, 2.4);
    h.registry
        .notify_exit("SPY", "end of day", Urgency::Immediate)
        .await;

    let pos = row(&h, &id).await;
    assert_eq!(pos.status, PositionStatus::Closed);
    assert_eq!(pos.exit_price, Some(2.4));
    assert!(pos.closed_at.is_some());
    assert!((pos.realized_pnl - 80.0).abs() < 1e-9);
    assert!(pos
        .close_reason
        .unwrap()
        .starts_with("ORCHESTRATOR_EXIT: end of day"));

    let trades = h.evaluator.trades.lock();
    assert_eq!(trades.len(), 1);
    assert_eq!(trades[0].conviction_tier, ConvictionTier::MaxConviction);
    assert_eq!(trades[0].entry_alignment, "ALIGNED");

    let _ = std::fs::remove_file(&path);
}

#[tokio::test]
async fn test_rejected_exit_sell_stays_closing_and_retries() {
    let h = harness();
    let mut events = h.events.subscribe();
    let request = call_entry("SPY");
    let symbol = request.candidate.symbol.clone();
    let id = h.registry.create_and_start(request).await.unwrap();
    let agent = h.registry.get(&id).unwrap();

    h.broker.set_mark(&symbol, 0.9);
    h.broker.end_next_sell(OrderStatus::Rejected, 0);
    agent.run_tick().await;

    assert_eq!(agent.phase(), PositionPhase::Closing);
    let pos = row(&h, &id).await;
    assert!(pos.is_open());
    assert_eq!(pos.exit_price, None);
    assert!(agent.status().pending_exit.unwrap().starts_with("STOP_HIT"));
    assert!(h.registry.get(&id).is_some());
    assert!(h.evaluator.trades.lock().is_empty());

    let mut saw_failure = false;
    while let Ok(event) = events.try_recv() {
        saw_failure |= matches!(event, PositionEvent::ExitFailed { .. });
        assert!(!matches!(event, PositionEvent::Closed { .. }));
    }
    assert!(saw_failure);

    agent.run_tick().await;
    assert_eq!(agent.phase(), PositionPhase::Closed);
    let sells = h.broker.sell_orders(&symbol);
    assert_eq!(sells.len(), 2);
    assert_eq!(sells[1].status, OrderStatus::Filled);
    let pos = row(&h, &id).await;
    assert_eq!(pos.status, PositionStatus::Closed);
    assert_eq!(pos.exit_price, Some(0.9));
    assert!(h.registry.get(&id).is_none());
}

#[tokio::test]
async fn test_exit_sell_canceled_midway_books_filled_part() {
    let h = harness();
    let request = entry("SPY", OptionSide::Call, 2, 2.0, 1.0);
    let symbol = request.candidate.symbol.clone();
    let id = h.registry.create_and_start(request).await.unwrap();
    let agent = h.registry.get(&id).unwrap();

    h.broker.set_mark(&symbol, 0.9);
    h.broker.end_next_sell(OrderStatus::Canceled, 1);
    agent.run_tick().await;

    assert_eq!(agent.phase(), PositionPhase::Closing);
    let pos = row(&h, &id).await;
    assert!(pos.is_open());
    assert_eq!(pos.quantity, 1);
    assert!((pos.realized_pnl + 110.0).abs() < 1e-9);

    agent.run_tick().await;
    let sells = h.broker.sell_orders(&symbol);
    assert_eq!(sells.iter().map(|o| o.quantity).collect::<Vec<_>>(), vec![2, 1]);
    let pos = row(&h, &id).await;
    assert_eq!(pos.status, PositionStatus::Closed);
    assert!((pos.realized_pnl + 220.0).abs() < 1e-9);
}

#[tokio::test]
async fn test_exit_suggestion_during_entry_submission_reaches_agent() {
    let paper = Arc::new(PaperBroker::new(PaperConfig::default()));
    let venue = Arc::new(SlowEntryBroker {
        inner: paper.clone(),
        delay: StdDuration::from_millis(200),
    });
    let h = build_harness(
        Arc::new(HoldAdvisor),
        paper,
        venue,
        None,
        test_agent_config(),
        MarketConfig::default(),
    );
    let request = call_entry("SPY");
    let symbol = request.candidate.symbol.clone();

    let (created, outcome) = tokio::join!(h.registry.create_and_start(request), async {
        tokio::time::sleep(StdDuration::from_millis(50)).await;
        h.registry
            .notify_exit("SPY", "flatten", Urgency::Immediate)
            .await
    });
    let id = created.unwrap();

    assert_eq!(outcome.delivered, 1);
    assert_eq!(outcome.fallback_closed, 0);
    assert_eq!(h.broker.buy_orders().len(), 1);
    assert_eq!(h.broker.sell_orders(&symbol).len(), 1);

    let pos = row(&h, &id).await;
    assert_eq!(pos.status, PositionStatus::Closed);
    assert!(pos.close_reason.unwrap().starts_with("ORCHESTRATOR_"));
    assert!(pos.exit_price.is_some());
    assert!(h.registry.get(&id).is_none());
}

#[tokio::test]
async fn test_close_all_during_entry_submission_sells_through_agent() {
    let paper = Arc::new(PaperBroker::new(PaperConfig::default()));
    let venue = Arc::new(SlowEntryBroker {
        inner: paper.clone(),
        delay: StdDuration::from_millis(200),
    });
    let h = build_harness(
        Arc::new(HoldAdvisor),
        paper,
        venue,
        None,
        test_agent_config(),
        MarketConfig::default(),
    );
    let request = call_entry("QQQ");
    let symbol = request.candidate.symbol.clone();

    let (created, report) = tokio::join!(h.registry.create_and_start(request), async {
        tokio::time::sleep(StdDuration::from_millis(50)).await;
        h.registry.close_all_positions("RISK_OFF", None).await
    });
    let id = created.unwrap();

    assert_eq!(report.notified, 1);
    assert_eq!(report.fallback_closed, 0);
    assert_eq!(h.broker.sell_orders(&symbol).len(), 1);
    assert_eq!(row(&h, &id).await.status, PositionStatus::Closed);
}

#[tokio::test]
async fn test_partial_entry_fill_cancels_remainder() {
    let h = harness_with(
        Arc::new(HoldAdvisor),
        PaperConfig {
            fill_entries_immediately: false,
            ..Default::default()
        },
        None,
        None,
    );
    let request = entry("SPY", OptionSide::Call, 4, 2.0, 1.0);
    let symbol = request.candidate.symbol.clone();
    let id = h.registry.create_and_start(request).await.unwrap();
    let agent = h.registry.get(&id).unwrap();

    let order_id = h.broker.buy_orders()[0].order_id.clone();
    h.broker
        .set_order_fill(&order_id, OrderStatus::PartiallyFilled, Some(1.98));
    h.broker.set_filled_quantity(&order_id, 1);
    agent.run_tick().await;

    assert_eq!(agent.phase(), PositionPhase::Monitoring);
    let entry_order = h.broker.buy_orders().remove(0);
    assert_eq!(entry_order.status, OrderStatus::Canceled);
    assert_eq!(entry_order.filled_quantity, 1);
    let pos = row(&h, &id).await;
    assert_eq!(pos.quantity, 1);
    assert_eq!(pos.entry_price, 1.98);

    // The exit sells exactly what was bought
    h.broker.set_mark(&symbol, 0.9);
    agent.run_tick().await;
    let sells = h.broker.sell_orders(&symbol);
    assert_eq!(sells.len(), 1);
    assert_eq!(sells[0].quantity, 1);
}

#[tokio::test]
async fn test_canceled_entry_with_partial_fill_is_kept() {
    let h = harness_with(
        Arc::new(HoldAdvisor),
        PaperConfig {
            fill_entries_immediately: false,
            ..Default::default()
        },
        None,
        None,
    );
    let id = h
        .registry
        .create_and_start(entry("SPY", OptionSide::Call, 3, 2.0, 1.0))
        .await
        .unwrap();
    let agent = h.registry.get(&id).unwrap();

    let order_id = h.broker.buy_orders()[0].order_id.clone();
    h.broker.set_order_fill(&order_id, OrderStatus::Canceled, Some(2.0));
    h.broker.set_filled_quantity(&order_id, 2);
    agent.run_tick().await;

    assert_eq!(agent.phase(), PositionPhase::Monitoring);
    let pos = row(&h, &id).await;
    assert!(pos.is_open());
    assert_eq!(pos.quantity, 2);
}

#[tokio::test]
async fn test_expiry_warning_fires_once_then_force_close() {
    let broker = Arc::new(PaperBroker::new(PaperConfig::default()));
    // Whole Eastern day inside the warning window, force close never due
    let market = MarketConfig {
        expiry_warning_minutes: 2_000,
        expiry_force_close_minutes: -2_000,
        ..Default::default()
    };
    let h = build_harness(
        Arc::new(HoldAdvisor),
        broker.clone(),
        broker,
        None,
        test_agent_config(),
        market,
    );
    let mut events = h.events.subscribe();
    let mut request = call_entry("SPY");
    request.candidate.expiration = eastern_date(Utc::now());
    let symbol = request.candidate.symbol.clone();
    let id = h.registry.create_and_start(request).await.unwrap();
    let agent = h.registry.get(&id).unwrap();

    agent.run_tick().await;
    agent.run_tick().await;

    assert_eq!(agent.phase(), PositionPhase::Monitoring);
    assert!(agent.status().expiry_warning_sent);
    let warnings = h
        .notifier
        .alerts
        .lock()
        .iter()
        .filter(|a| a.title == "Expiry warning")
        .count();
    assert_eq!(warnings, 1);
    let mut warning_events = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, PositionEvent::ExpiryWarning { .. }) {
            warning_events += 1;
        }
    }
    assert_eq!(warning_events, 1);

    // Contract rolls past its expiration
    let mut pos = row(&h, &id).await;
    pos.expiration = eastern_date(Utc::now()) - Duration::days(1);
    h.store.put_position(pos);
    agent.run_tick().await;

    assert_eq!(agent.phase(), PositionPhase::Closed);
    assert_eq!(h.broker.sell_orders(&symbol).len(), 1);
    assert!(row(&h, &id)
        .await
        .close_reason
        .unwrap()
        .starts_with("EXPIRY_FORCE_CLOSE"));
}

#[tokio::test]
async fn test_ai_review_counts_only_monitoring_ticks() {
    let advisor = Arc::new(ScriptedAdvisor::default());
    let broker = Arc::new(PaperBroker::new(PaperConfig {
        fill_entries_immediately: false,
        ..Default::default()
    }));
    let h = build_harness(
        advisor.clone(),
        broker.clone(),
        broker,
        None,
        AgentConfig {
            ai_review_every_ticks: 3,
            ..test_agent_config()
        },
        MarketConfig::default(),
    );
    let id = h.registry.create_and_start(call_entry("SPY")).await.unwrap();
    let agent = h.registry.get(&id).unwrap();

    agent.run_tick().await;
    let order_id = h.broker.buy_orders()[0].order_id.clone();
    h.broker.set_order_fill(&order_id, OrderStatus::Filled, Some(2.0));
    agent.run_tick().await;
    assert_eq!(agent.phase(), PositionPhase::Monitoring);

    // Overall ticks 3 and 4 are the first two spent monitoring
    agent.run_tick().await;
    agent.run_tick().await;
    assert_eq!(advisor.calls.load(Ordering::SeqCst), 0);
    agent.run_tick().await;
    assert_eq!(advisor.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_timer_ticks_until_shutdown() {
    let broker = Arc::new(PaperBroker::new(PaperConfig::default()));
    let h = build_harness(
        Arc::new(HoldAdvisor),
        broker.clone(),
        broker,
        None,
        AgentConfig {
            tick_interval_secs: 30,
            ai_review_every_ticks: 1_000,
            ..test_agent_config()
        },
        MarketConfig::default(),
    );
    let id = h.registry.create_and_start(call_entry("SPY")).await.unwrap();
    let agent = h.registry.get(&id).unwrap();
    assert_eq!(agent.status().tick_count, 0);

    tokio::time::sleep(StdDuration::from_secs(95)).await;
    assert_eq!(agent.status().tick_count, 3);

    h.registry.shutdown_all();
    tokio::time::sleep(StdDuration::from_secs(300)).await;
    assert_eq!(agent.status().tick_count, 3);
    assert_eq!(agent.phase(), PositionPhase::Closed);
    assert!(row(&h, &id).await.is_open());
}

#[tokio::test(start_paused = true)]
async fn test_timer_exits_on_stop_and_stops_itself() {
    let broker = Arc::new(PaperBroker::new(PaperConfig::default()));
    let h = build_harness(
        Arc::new(HoldAdvisor),
        broker.clone(),
        broker,
        None,
        AgentConfig {
            tick_interval_secs: 30,
            ai_review_every_ticks: 1_000,
            ..test_agent_config()
        },
        MarketConfig::default(),
    );
    let request = call_entry("SPY");
    let symbol = request.candidate.symbol.clone();
    let id = h.registry.create_and_start(request).await.unwrap();
    let agent = h.registry.get(&id).unwrap();

    h.broker.set_mark(&symbol, 0.8);
    tokio::time::sleep(StdDuration::from_secs(31)).await;

    assert_eq!(agent.phase(), PositionPhase::Closed);
    assert!(h.registry.get(&id).is_none());
    assert_eq!(h.broker.sell_orders(&symbol).len(), 1);

    let ticks = agent.status().tick_count;
    tokio::time::sleep(StdDuration::from_secs(120)).await;
    assert_eq!(agent.status().tick_count, ticks);
}

#[tokio::test]
async fn test_daily_loss_gate_reads_realized_pnl() {
    let h = harness();
    let request = call_entry("SPY");
    let symbol = request.candidate.symbol.clone();
    let candidate = request.candidate.clone();
    let id = h.registry.create_and_start(request).await.unwrap();

    h.broker.set_mark(&symbol, 0.5);
    h.registry.get(&id).unwrap().run_tick().await;
    assert_eq!(row(&h, &id).await.status, PositionStatus::Closed);

    let account = AccountState::load(h.store.as_ref(), 10_000.0, 10_000.0, Utc::now())
        .await
        .unwrap();
    assert!((account.realized_pnl_today + 300.0).abs() < 1e-9);

    let result = screen_entry(
        &SizingConfig::default(),
        &GateConfig::default(),
        true,
        0.8,
        Direction::Bullish,
        5.0,
        Some(&candidate),
        account,
    );
    assert!(result.unwrap_err().failed_gates().contains(&GateId::DailyLoss));
}
