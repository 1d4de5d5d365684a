//! Position Agent
//!
//! Owns one position from entry submission to close. A private tokio task
//! drives ticks; every public entry point (tick, orchestrator suggestion,
//! manual reduce) runs under a per-agent operation lock so at most one body
//! executes at a time. Exits are idempotent through the CLOSING guard.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::arbitration::{
    ratchet_stop, AiRecommendation, ArbitrationContext, ClosedOutcome, LivePositionState,
};
use super::expiry::{minutes_to_expiry, ExpiryAction, ExpiryGuard};
use super::state_machine::{PhaseMachine, PositionPhase};
use super::{AgentDeps, Deregister, EntryRequest};
use crate::agentic::TradeEvaluationInput;
use crate::events::PositionEvent;
use crate::execution::{resolve_fill, BrokerOrder, FillResolution};
use crate::position::{
    leg_pnl, AgentTick, AiAction, OrderKind, OrderRecord, Position, PositionStatus, PositionUpdate,
};
use crate::risk::sizing::ConvictionTier;
use crate::telemetry::{metrics, Alert};
use crate::utils::helpers::{format_usd, generate_id, retry_with_backoff};
use crate::utils::types::{OptionSide, OrchestratorSuggestion, OrderStatus, SuggestionKind, Urgency};

/// Initial delay of the close-write retry backoff
const CLOSE_WRITE_BACKOFF_MS: u64 = 100;

struct AgentState {
    phase: PhaseMachine,
    entry_order_id: Option<String>,
    opened_at: DateTime<Utc>,
    fill_price: Option<f64>,
    last_price: Option<f64>,
    tick_count: u64,
    /// Ticks spent in MONITORING; paces the periodic AI review
    monitor_ticks: u64,
    expiry_warning_sent: bool,
    /// Exit reason while CLOSING; retried on the next tick until confirmed
    pending_exit: Option<String>,
}

/// Snapshot for display
#[derive(Debug, Clone, Serialize)]
pub struct AgentStatus {
    pub position_id: String,
    pub ticker: String,
    pub option_symbol: String,
    pub side: OptionSide,
    pub phase: PositionPhase,
    pub seconds_in_phase: u64,
    pub tick_count: u64,
    pub entry_order_id: Option<String>,
    pub fill_price: Option<f64>,
    pub last_price: Option<f64>,
    pub opened_at: DateTime<Utc>,
    pub expiry_warning_sent: bool,
    pub pending_exit: Option<String>,
    pub conviction_tier: ConvictionTier,
    pub initial_quantity: u32,
    pub limit_price: f64,
}

pub struct PositionAgent {
    position_id: String,
    request: EntryRequest,
    deps: AgentDeps,
    deregister: Deregister,
    expiry: ExpiryGuard,
    state: Mutex<AgentState>,
    op_lock: AsyncMutex<()>,
    stop_tx: watch::Sender<bool>,
}

impl PositionAgent {
    /// Agent for a new entry; nothing happens until `start`
    pub fn new(request: EntryRequest, deps: AgentDeps, deregister: Deregister) -> Arc<Self> {
        Self::build(generate_id(), None, Utc::now(), request, deps, deregister)
    }

    /// Agent for a persisted OPEN row; resumes with `start_restored`
    pub fn restored(
        position: &Position,
        request: EntryRequest,
        deps: AgentDeps,
        deregister: Deregister,
    ) -> Arc<Self> {
        Self::build(
            position.id.clone(),
            position.entry_order_id.clone(),
            position.opened_at,
            request,
            deps,
            deregister,
        )
    }

    fn build(
        position_id: String,
        entry_order_id: Option<String>,
        opened_at: DateTime<Utc>,
        request: EntryRequest,
        deps: AgentDeps,
        deregister: Deregister,
    ) -> Arc<Self> {
        let (stop_tx, _) = watch::channel(false);
        Arc::new(Self {
            position_id,
            expiry: ExpiryGuard::new(deps.market.clone()),
            request,
            deps,
            deregister,
            state: Mutex::new(AgentState {
                phase: PhaseMachine::new(),
                entry_order_id,
                opened_at,
                fill_price: None,
                last_price: None,
                tick_count: 0,
                monitor_ticks: 0,
                expiry_warning_sent: false,
                pending_exit: None,
            }),
            op_lock: AsyncMutex::new(()),
            stop_tx,
        })
    }

    pub fn position_id(&self) -> &str {
        &self.position_id
    }

    pub fn ticker(&self) -> &str {
        self.request.ticker()
    }

    pub fn option_symbol(&self) -> &str {
        &self.request.candidate.symbol
    }

    pub fn phase(&self) -> PositionPhase {
        self.state.lock().phase.current()
    }

    /// Reason recorded with the most recent phase change
    pub fn last_transition_reason(&self) -> Option<String> {
        self.state
            .lock()
            .phase
            .history()
            .last()
            .and_then(|t| t.reason.clone())
    }

    pub fn status(&self) -> AgentStatus {
        let st = self.state.lock();
        AgentStatus {
            position_id: self.position_id.clone(),
            ticker: self.ticker().to_string(),
            option_symbol: self.option_symbol().to_string(),
            side: self.request.candidate.side,
            phase: st.phase.current(),
            seconds_in_phase: st.phase.time_in_phase().as_secs(),
            tick_count: st.tick_count,
            entry_order_id: st.entry_order_id.clone(),
            fill_price: st.fill_price,
            last_price: st.last_price,
            opened_at: st.opened_at,
            expiry_warning_sent: st.expiry_warning_sent,
            pending_exit: st.pending_exit.clone(),
            conviction_tier: self.request.sizing.tier,
            initial_quantity: self.request.sizing.quantity,
            limit_price: self.request.sizing.limit_price,
        }
    }

    /// Persist the position, submit the entry order and start ticking.
    ///
    /// Returns the phase reached; `Failed` means no timer was started.
    pub async fn start(self: &Arc<Self>) -> PositionPhase {
        let _op = self.op_lock.lock().await;
        if self.phase().is_terminal() {
            return self.phase();
        }
        let store = &self.deps.store;
        let sizing = &self.request.sizing;

        if let Err(e) = store.insert_decision(&self.request.decision).await {
            warn!("Decision {} not persisted: {}", self.request.decision.id, e);
        }

        let position = self.initial_position();
        if let Err(e) = store.insert_position(&position).await {
            error!("Position {} could not be persisted: {}", self.position_id, e);
            self.set_phase(PositionPhase::Failed, "position insert failed");
            self.deps.events.publish(PositionEvent::Failed {
                position_id: self.position_id.clone(),
                ticker: self.ticker().to_string(),
                reason: e.to_string(),
            });
            self.deps
                .notifier
                .notify(Alert::error(
                    "Entry aborted",
                    format!("{} {}: {}", self.ticker(), self.option_symbol(), e),
                ))
                .await;
            return PositionPhase::Failed;
        }

        let order = match self
            .deps
            .broker
            .submit_limit_buy(self.option_symbol(), sizing.quantity, sizing.limit_price)
            .await
        {
            Ok(order) => order,
            Err(e) => {
                self.fail_entry(&format!("ENTRY_SUBMIT_FAILED: {}", e)).await;
                return PositionPhase::Failed;
            }
        };

        self.state.lock().entry_order_id = Some(order.order_id.clone());
        self.record_order(
            OrderKind::Entry,
            &order,
            sizing.quantity,
            Some(sizing.limit_price),
            order.filled_avg_price,
        )
        .await;
        let link = PositionUpdate {
            entry_order_id: Some(order.order_id.clone()),
            ..Default::default()
        };
        if let Err(e) = store.update_position(&self.position_id, &link).await {
            warn!("Entry order id for {} not persisted: {}", self.position_id, e);
        }

        info!(
            "Entry submitted: {} {} x{} @ ${:.2} ({}, order {})",
            self.ticker(),
            self.option_symbol(),
            sizing.quantity,
            sizing.limit_price,
            sizing.tier,
            order.order_id
        );
        self.deps.events.publish(PositionEvent::Opened {
            position_id: self.position_id.clone(),
            ticker: self.ticker().to_string(),
            option_symbol: self.option_symbol().to_string(),
            quantity: sizing.quantity,
            limit_price: sizing.limit_price,
        });

        if order.filled_quantity > 0 && order.filled_avg_price.is_some() {
            self.settle_entry(order).await;
        } else if order.status.is_dead() && order.filled_quantity == 0 {
            self.fail_entry(&format!("ENTRY_{}", order.status.to_string().to_uppercase()))
                .await;
            return PositionPhase::Failed;
        }

        self.spawn_timer();
        self.phase()
    }

    /// Resume a persisted position after a restart: no order submission,
    /// straight to the fill check.
    pub async fn start_restored(self: &Arc<Self>) -> PositionPhase {
        {
            let _op = self.op_lock.lock().await;
            info!(
                "Restoring agent for {} {} ({})",
                self.ticker(),
                self.option_symbol(),
                self.position_id
            );
            self.check_entry_fill().await;
        }

        let phase = self.phase();
        if !phase.is_terminal() {
            self.spawn_timer();
        }
        phase
    }

    /// Hard stop for a full reset: stops the timer and marks CLOSED in
    /// memory. Touches neither the broker nor the store.
    pub fn shutdown(&self) {
        self.stop_timer();
        let mut st = self.state.lock();
        if !st.phase.current().is_terminal() {
            st.phase
                .transition_to(PositionPhase::Closed, Some("shutdown"));
        }
    }

    fn spawn_timer(self: &Arc<Self>) {
        let agent = Arc::clone(self);
        let mut stop_rx = self.stop_tx.subscribe();
        let period = self.deps.agent.tick_interval();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                if *stop_rx.borrow() {
                    break;
                }
                tokio::select! {
                    _ = interval.tick() => agent.run_tick().await,
                    changed = stop_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
            debug!("Tick loop for {} stopped", agent.position_id);
        });
    }

    fn stop_timer(&self) {
        self.stop_tx.send_replace(true);
    }

    /// One tick of the monitoring loop
    pub async fn run_tick(&self) {
        let _op = self.op_lock.lock().await;
        let (phase, monitor_tick, pending) = {
            let mut st = self.state.lock();
            st.tick_count += 1;
            if st.phase.current() == PositionPhase::Monitoring {
                st.monitor_ticks += 1;
            }
            (st.phase.current(), st.monitor_ticks, st.pending_exit.clone())
        };

        match phase {
            PositionPhase::AwaitingFill => self.check_entry_fill().await,
            PositionPhase::Monitoring => self.monitor(monitor_tick).await,
            PositionPhase::Closing => {
                if let Some(reason) = pending {
                    info!("Retrying exit of {}: {}", self.position_id, reason);
                    self.execute_exit(&reason).await;
                }
            }
            PositionPhase::Closed | PositionPhase::Failed => self.stop_timer(),
        }
    }

    /// The single way the orchestrator influences a running agent
    pub async fn process_orchestrator_decision(&self, suggestion: &OrchestratorSuggestion) {
        let _op = self.op_lock.lock().await;
        let reason = format!("ORCHESTRATOR_{}: {}", suggestion.kind, suggestion.reason);

        match (self.phase(), suggestion.urgency) {
            (PositionPhase::AwaitingFill, Urgency::Immediate) => {
                self.exit_unfilled(reason).await;
            }
            (PositionPhase::AwaitingFill, urgency) => {
                debug!(
                    "Dropping {} suggestion for unfilled {}: {}",
                    urgency, self.position_id, suggestion.reason
                );
            }
            (PositionPhase::Monitoring, Urgency::Immediate) => match suggestion.kind {
                SuggestionKind::Exit => self.exit_position(reason).await,
                SuggestionKind::ReduceExposure => self.reduce(0, &reason).await,
            },
            (PositionPhase::Monitoring, _) => {
                if let Some((position, price)) = self.live_state().await {
                    self.arbitrate(&position, price, Some(suggestion)).await;
                }
            }
            (phase, _) => {
                debug!("Ignoring suggestion for {} in {}", self.position_id, phase);
            }
        }
    }

    /// Partial close; `0` sells half of the current quantity (at least one)
    pub async fn handle_reduce(&self, quantity: u32) {
        let _op = self.op_lock.lock().await;
        self.reduce(quantity, "MANUAL_REDUCE").await;
    }

    async fn check_entry_fill(&self) {
        let order_id = self.state.lock().entry_order_id.clone();
        let Some(order_id) = order_id else {
            self.confirm_fill(None, None).await;
            return;
        };

        match self.deps.broker.get_order(&order_id).await {
            Ok(order) if order.status.is_filled() || order.filled_quantity > 0 => {
                self.settle_entry(order).await;
            }
            Ok(order) if order.status.is_dead() => {
                self.fail_entry(&format!("ENTRY_{}", order.status.to_string().to_uppercase()))
                    .await;
            }
            Ok(order) => debug!("Entry {} for {} still {}", order_id, self.position_id, order.status),
            Err(e) => warn!("Entry poll for {} failed, retrying: {}", self.position_id, e),
        }
    }

    async fn monitor(&self, monitor_tick: u64) {
        let position = match self.deps.store.get_position(&self.position_id).await {
            Ok(Some(p)) if p.is_open() => p,
            Ok(_) => {
                info!("Position {} closed outside its agent, stopping", self.position_id);
                self.finish(PositionPhase::Closed, "closed externally");
                return;
            }
            Err(e) => {
                warn!("Position read for {} failed: {}", self.position_id, e);
                return;
            }
        };

        let price = self.live_price().await;

        if let Some(price) = price {
            if price <= position.stop_price {
                self.exit_position(format!(
                    "STOP_HIT: {:.2} <= stop {:.2}",
                    price, position.stop_price
                ))
                .await;
                return;
            }
            if position.take_profit_price > 0.0 && price >= position.take_profit_price {
                self.exit_position(format!(
                    "TP_HIT: {:.2} >= target {:.2}",
                    price, position.take_profit_price
                ))
                .await;
                return;
            }
        }

        let now = Utc::now();
        match self.expiry.check(position.expiration, now) {
            ExpiryAction::ForceClose => {
                self.exit_position(format!(
                    "EXPIRY_FORCE_CLOSE: {} expires {}",
                    position.option_symbol, position.expiration
                ))
                .await;
                return;
            }
            ExpiryAction::Warn => self.warn_expiry(&position, now).await,
            ExpiryAction::None => {}
        }

        let Some(price) = price else {
            return;
        };
        if monitor_tick % self.deps.agent.ai_review_every_ticks.max(1) == 0 {
            self.arbitrate(&position, price, None).await;
        }
    }

    async fn warn_expiry(&self, position: &Position, now: DateTime<Utc>) {
        {
            let mut st = self.state.lock();
            if st.expiry_warning_sent {
                return;
            }
            st.expiry_warning_sent = true;
        }

        let minutes = minutes_to_expiry(position.expiration, now, &self.deps.market);
        warn!(
            "{} expires today, {} min to close (force close at {} min)",
            position.option_symbol, minutes, self.deps.market.expiry_force_close_minutes
        );
        self.deps.events.publish(PositionEvent::ExpiryWarning {
            position_id: self.position_id.clone(),
            minutes_to_close: minutes,
        });
        self.deps
            .notifier
            .notify(Alert::warning(
                "Expiry warning",
                format!(
                    "{} x{} expires today; {} min to close, force close {} min before",
                    position.option_symbol,
                    position.quantity,
                    minutes,
                    self.deps.market.expiry_force_close_minutes
                ),
            ))
            .await;
    }

    async fn arbitrate(
        &self,
        position: &Position,
        price: f64,
        suggestion: Option<&OrchestratorSuggestion>,
    ) {
        let now = Utc::now();
        let context = self.build_context(position, price, suggestion, now).await;

        let raw = match self.deps.advisor.recommend(&context).await {
            Ok(raw) => raw,
            Err(e) => {
                metrics::record_ai_call(false);
                warn!("AI arbitration skipped for {}: {}", self.position_id, e);
                return;
            }
        };
        let recommendation = match AiRecommendation::decode(&raw) {
            Ok(r) => r,
            Err(e) => {
                metrics::record_ai_call(false);
                warn!("AI arbitration skipped for {}: {}", self.position_id, e);
                return;
            }
        };
        metrics::record_ai_call(true);

        let accepted_stop = match recommendation.action {
            AiAction::AdjustStop => recommendation
                .new_stop
                .and_then(|s| ratchet_stop(position.side, position.stop_price, s, price)),
            _ => None,
        };

        let tick = AgentTick {
            position_id: self.position_id.clone(),
            tick_number: self.state.lock().tick_count,
            action: recommendation.action,
            new_stop: accepted_stop,
            pnl_pct: position.unrealized_pnl_pct(price),
            price,
            overrode_orchestrator: recommendation.overriding_orchestrator,
            suggestion: suggestion.map(|s| s.reason.clone()),
            reasoning: recommendation.reasoning.clone(),
            created_at: now,
        };
        if let Err(e) = self.deps.store.insert_agent_tick(&tick).await {
            warn!("Agent tick for {} not persisted: {}", self.position_id, e);
        }

        match recommendation.action {
            AiAction::Hold => {
                debug!("AI holds {}: {}", self.position_id, recommendation.reasoning);
            }
            AiAction::Exit => {
                self.exit_position(format!("AI_EXIT: {}", recommendation.reasoning))
                    .await;
            }
            AiAction::Reduce => {
                self.reduce(0, &format!("AI_REDUCE: {}", recommendation.reasoning))
                    .await;
            }
            AiAction::AdjustStop => match accepted_stop {
                Some(stop) => self.adjust_stop(position.stop_price, stop).await,
                None => info!(
                    "Rejected stop {:?} for {} (stop {:.2}, price {:.2})",
                    recommendation.new_stop, self.position_id, position.stop_price, price
                ),
            },
        }
    }

    async fn build_context(
        &self,
        position: &Position,
        price: f64,
        suggestion: Option<&OrchestratorSuggestion>,
        now: DateTime<Utc>,
    ) -> ArbitrationContext {
        let cfg = &self.deps.agent;
        let recent_ticks = self
            .deps
            .store
            .recent_ticks(&self.position_id, cfg.recent_ticks_in_context)
            .await
            .unwrap_or_else(|e| {
                warn!("Tick history for {} unavailable: {}", self.position_id, e);
                Vec::new()
            });
        let recent_outcomes = self
            .deps
            .store
            .recent_closed(&position.ticker, position.side, cfg.recent_outcomes_in_context)
            .await
            .map(|rows| rows.iter().map(ClosedOutcome::from).collect())
            .unwrap_or_else(|e| {
                warn!("Closed outcomes for {} unavailable: {}", position.ticker, e);
                Vec::new()
            });

        ArbitrationContext {
            decision: self.request.decision.clone(),
            suggestion: suggestion.cloned(),
            position: LivePositionState::new(
                position,
                price,
                now,
                minutes_to_expiry(position.expiration, now, &self.deps.market),
            ),
            recent_ticks,
            recent_outcomes,
        }
    }

    async fn adjust_stop(&self, old_stop: f64, new_stop: f64) {
        let update = PositionUpdate {
            stop_price: Some(new_stop),
            ..Default::default()
        };
        if let Err(e) = self.deps.store.update_position(&self.position_id, &update).await {
            warn!("Stop update for {} failed: {}", self.position_id, e);
            return;
        }

        info!(
            "Stop for {} ratcheted {:.2} -> {:.2}",
            self.position_id, old_stop, new_stop
        );
        self.deps.events.publish(PositionEvent::StopAdjusted {
            position_id: self.position_id.clone(),
            old_stop,
            new_stop,
        });
    }

    /// Confirm an entry that traded. A partially filled order still working
    /// is canceled first so the position tracks exactly what was bought;
    /// when the cancel cannot be confirmed the next tick tries again.
    async fn settle_entry(&self, order: BrokerOrder) {
        let order = if order.status == OrderStatus::PartiallyFilled {
            match self.cancel_entry_remainder(&order).await {
                Some(order) => order,
                None => return,
            }
        } else {
            order
        };
        self.confirm_fill(order.filled_avg_price, Some(order.filled_quantity))
            .await;
    }

    async fn cancel_entry_remainder(&self, order: &BrokerOrder) -> Option<BrokerOrder> {
        if let Err(e) = self
            .deps
            .broker
            .cancel_open_orders(Some(self.option_symbol()))
            .await
        {
            warn!("Cancel of entry remainder {} failed: {}", order.order_id, e);
            return None;
        }

        match self.deps.broker.get_order(&order.order_id).await {
            Ok(after) if after.status == OrderStatus::PartiallyFilled => {
                warn!("Entry {} still working after cancel", order.order_id);
                None
            }
            Ok(after) => {
                info!(
                    "Entry {} remainder canceled, {}/{} filled",
                    order.order_id, after.filled_quantity, after.quantity
                );
                Some(after)
            }
            Err(e) => {
                warn!("Entry {} unreadable after cancel: {}", order.order_id, e);
                None
            }
        }
    }

    async fn confirm_fill(&self, fill_price: Option<f64>, filled_quantity: Option<u32>) {
        let fill_price = fill_price.filter(|p| *p > 0.0);
        let mut update = PositionUpdate {
            entry_price: fill_price,
            ..Default::default()
        };
        if let Some(filled) = filled_quantity.filter(|q| *q > 0 && *q < self.request.sizing.quantity) {
            update.quantity = Some(filled);
        }

        if update != PositionUpdate::default() {
            if let Err(e) = self.deps.store.update_position(&self.position_id, &update).await {
                warn!("Fill sync for {} failed, retrying: {}", self.position_id, e);
                return;
            }
        }

        {
            let mut st = self.state.lock();
            st.fill_price = fill_price.or(st.fill_price);
            st.phase
                .transition_to(PositionPhase::Monitoring, Some("entry filled"));
        }

        let quantity = update.quantity.unwrap_or(self.request.sizing.quantity);
        info!(
            "Entry filled: {} x{} @ {}",
            self.option_symbol(),
            quantity,
            fill_price.map_or("unknown".to_string(), |p| format!("${:.2}", p))
        );
        self.deps.events.publish(PositionEvent::Filled {
            position_id: self.position_id.clone(),
            fill_price,
            quantity,
        });
    }

    async fn fail_entry(&self, reason: &str) {
        if let Err(e) = self
            .deps
            .store
            .update_position(&self.position_id, &PositionUpdate::void(reason))
            .await
        {
            warn!("Void of {} not persisted: {}", self.position_id, e);
        }

        warn!("Entry for {} failed: {}", self.position_id, reason);
        self.deps.events.publish(PositionEvent::Failed {
            position_id: self.position_id.clone(),
            ticker: self.ticker().to_string(),
            reason: reason.to_string(),
        });
        self.deps
            .notifier
            .notify(Alert::warning(
                "Entry failed",
                format!("{} {}: {}", self.ticker(), self.option_symbol(), reason),
            ))
            .await;
        self.finish(PositionPhase::Failed, reason);
    }

    /// Guarded full exit; a no-op when an exit is already under way
    async fn exit_position(&self, reason: String) {
        if !self.begin_closing(&reason) {
            debug!("Exit for {} already in progress or done", self.position_id);
            return;
        }
        self.execute_exit(&reason).await;
    }

    fn begin_closing(&self, reason: &str) -> bool {
        let mut st = self.state.lock();
        if !st.phase.current().is_live() {
            return false;
        }
        st.phase.transition_to(PositionPhase::Closing, Some(reason));
        st.pending_exit = Some(reason.to_string());
        true
    }

    /// Immediate exit before the entry is confirmed: cancel the entry, sell
    /// whatever filled, void the row when nothing did.
    async fn exit_unfilled(&self, reason: String) {
        if !self.begin_closing(&reason) {
            return;
        }

        if let Err(e) = self
            .deps
            .broker
            .cancel_open_orders(Some(self.option_symbol()))
            .await
        {
            warn!("Cancel for {} failed: {}", self.option_symbol(), e);
        }

        let order_id = self.state.lock().entry_order_id.clone();
        let Some(order_id) = order_id else {
            // Restored without an entry order: treat as held
            self.execute_exit(&reason).await;
            return;
        };

        let filled = match self.deps.broker.get_order(&order_id).await {
            Ok(order) if order.filled_quantity > 0 => Some(order),
            Ok(_) => None,
            Err(e) => {
                error!("Entry {} state unknown after cancel: {}", order_id, e);
                None
            }
        };

        match filled {
            Some(order) => {
                self.confirm_partial_before_exit(&order).await;
                self.execute_exit(&reason).await;
            }
            None => {
                let void_reason = format!("{} (entry unfilled)", reason);
                if let Err(e) = self
                    .deps
                    .store
                    .update_position(&self.position_id, &PositionUpdate::void(&void_reason))
                    .await
                {
                    warn!("Void of {} not persisted: {}", self.position_id, e);
                }
                info!("Unfilled entry {} voided: {}", self.position_id, reason);
                self.deps.events.publish(PositionEvent::Voided {
                    position_id: self.position_id.clone(),
                    ticker: self.ticker().to_string(),
                    reason: void_reason.clone(),
                });
                self.finish(PositionPhase::Closed, &void_reason);
            }
        }
    }

    async fn confirm_partial_before_exit(&self, order: &BrokerOrder) {
        let mut update = PositionUpdate {
            entry_price: order.filled_avg_price.filter(|p| *p > 0.0),
            ..Default::default()
        };
        if order.filled_quantity < self.request.sizing.quantity {
            update.quantity = Some(order.filled_quantity);
        }
        if update != PositionUpdate::default() {
            if let Err(e) = self.deps.store.update_position(&self.position_id, &update).await {
                warn!("Fill sync for {} failed: {}", self.position_id, e);
            }
        }
        self.state.lock().fill_price = update.entry_price;
    }

    /// Sell the current persisted quantity and record the close.
    ///
    /// Runs only in CLOSING. A failed sell leaves the agent in CLOSING with
    /// the reason pending, and the next tick tries again.
    async fn execute_exit(&self, reason: &str) {
        let store = &self.deps.store;
        let broker = &self.deps.broker;

        let position = match store.get_position(&self.position_id).await {
            Ok(Some(p)) if p.is_open() => p,
            Ok(_) => {
                info!("Position {} already closed in store", self.position_id);
                self.finish(PositionPhase::Closed, reason);
                return;
            }
            Err(e) => {
                warn!("Position read for exit of {} failed, retrying: {}", self.position_id, e);
                return;
            }
        };

        let quantity = position.quantity;
        let fallback = self.state.lock().last_price.unwrap_or(position.entry_price);

        let exit_price = if quantity == 0 {
            fallback
        } else {
            let order = match broker.submit_market_sell(&position.option_symbol, quantity).await {
                Ok(order) => order,
                Err(e) => {
                    self.exit_failed(&position, reason, &e.to_string()).await;
                    return;
                }
            };

            let fill = resolve_fill(
                broker.as_ref(),
                &order,
                self.deps.agent.fill_poll_attempts,
                self.deps.agent.fill_poll_interval(),
                fallback,
            )
            .await;
            let sold = fill.filled_quantity(quantity);
            self.record_order(
                OrderKind::Exit,
                &order,
                quantity,
                None,
                (sold > 0).then(|| fill.price()),
            )
            .await;

            if sold < quantity {
                if sold > 0 {
                    self.book_partial_exit(&position, sold, fill.price()).await;
                }
                let detail = match fill {
                    FillResolution::Ended { status, .. } => {
                        format!("sell {} with {}/{} filled", status, sold, quantity)
                    }
                    _ => format!("sell filled {}/{}", sold, quantity),
                };
                self.exit_failed(&position, reason, &detail).await;
                return;
            }
            fill.price()
        };

        let realized_pnl = position.realized_pnl + leg_pnl(position.entry_price, exit_price, quantity);
        let update = PositionUpdate::close(reason, Some(exit_price), realized_pnl);
        let closed_at = update.closed_at.unwrap_or_else(Utc::now);

        if let Err(e) = retry_with_backoff(
            || store.update_position(&self.position_id, &update),
            self.deps.agent.close_write_retries,
            CLOSE_WRITE_BACKOFF_MS,
        )
        .await
        {
            error!(
                "Close of {} confirmed at broker but not persisted: {}",
                self.position_id, e
            );
            self.deps
                .notifier
                .notify(Alert::critical(
                    "Close not persisted",
                    format!("{} sold x{} but the row is still OPEN: {}", position.option_symbol, quantity, e),
                ))
                .await;
        }

        info!(
            "Position closed: {} x{} entry ${:.2} exit ${:.2} P&L {} ({})",
            position.option_symbol,
            quantity,
            position.entry_price,
            exit_price,
            format_usd(realized_pnl),
            reason
        );
        self.deps.events.publish(PositionEvent::Closed {
            position_id: self.position_id.clone(),
            ticker: position.ticker.clone(),
            reason: reason.to_string(),
            exit_price,
            realized_pnl,
        });
        self.deps
            .notifier
            .notify(Alert::info(
                "Position closed",
                format!(
                    "{} {} x{} | entry ${:.2} | exit ${:.2} | P&L {} | {}",
                    position.ticker,
                    position.option_symbol,
                    quantity,
                    position.entry_price,
                    exit_price,
                    format_usd(realized_pnl),
                    reason
                ),
            ))
            .await;

        let evaluation = TradeEvaluationInput {
            position_id: self.position_id.clone(),
            ticker: position.ticker.clone(),
            option_symbol: position.option_symbol.clone(),
            side: position.side,
            quantity,
            entry_price: position.entry_price,
            exit_price,
            realized_pnl,
            opened_at: position.opened_at,
            closed_at,
            close_reason: reason.to_string(),
            conviction_tier: position.conviction_tier,
            entry_confidence: position.entry_confidence,
            entry_alignment: position.entry_alignment.clone(),
            entry_direction: position.entry_direction.clone(),
        };
        if let Err(e) = self.deps.evaluator.evaluate(&evaluation).await {
            warn!("Post-trade evaluation of {} failed: {:#}", self.position_id, e);
        }

        self.finish(PositionPhase::Closed, reason);
    }

    /// Exit sell not confirmed: stay CLOSING with the reason pending
    async fn exit_failed(&self, position: &Position, reason: &str, error: &str) {
        error!("Exit sell for {} failed, retrying next tick: {}", self.position_id, error);
        self.deps.events.publish(PositionEvent::ExitFailed {
            position_id: self.position_id.clone(),
            error: error.to_string(),
        });
        self.deps
            .notifier
            .notify(Alert::error(
                "Exit failed",
                format!(
                    "{} x{} ({}): {}",
                    position.option_symbol, position.quantity, reason, error
                ),
            ))
            .await;
    }

    /// Book the contracts a dead exit sell did trade, so the retry sells
    /// only what is still held
    async fn book_partial_exit(&self, position: &Position, sold: u32, price: f64) {
        let update = PositionUpdate {
            quantity: Some(position.quantity - sold),
            realized_pnl: Some(position.realized_pnl + leg_pnl(position.entry_price, price, sold)),
            ..Default::default()
        };
        let store = &self.deps.store;
        if let Err(e) = retry_with_backoff(
            || store.update_position(&self.position_id, &update),
            self.deps.agent.close_write_retries,
            CLOSE_WRITE_BACKOFF_MS,
        )
        .await
        {
            error!("Partial exit of {} sold but not persisted: {}", self.position_id, e);
            self.deps
                .notifier
                .notify(Alert::critical(
                    "Partial exit not persisted",
                    format!(
                        "{} sold x{} but the row still shows x{}: {}",
                        position.option_symbol, sold, position.quantity, e
                    ),
                ))
                .await;
        }
    }

    async fn reduce(&self, requested: u32, reason: &str) {
        if self.phase() != PositionPhase::Monitoring {
            debug!("Reduce ignored for {} in {}", self.position_id, self.phase());
            return;
        }

        let position = match self.deps.store.get_position(&self.position_id).await {
            Ok(Some(p)) if p.is_open() => p,
            Ok(_) => return,
            Err(e) => {
                warn!("Position read for reduce of {} failed: {}", self.position_id, e);
                return;
            }
        };

        let current = position.quantity;
        let quantity = if requested == 0 {
            (current / 2).max(1)
        } else {
            requested
        };
        if quantity >= current {
            self.exit_position(format!("REDUCED_TO_ZERO: {}", reason)).await;
            return;
        }

        let order = match self
            .deps
            .broker
            .submit_market_sell(&position.option_symbol, quantity)
            .await
        {
            Ok(order) => order,
            Err(e) => {
                warn!("Reduce sell for {} failed: {}", self.position_id, e);
                self.deps
                    .notifier
                    .notify(Alert::warning(
                        "Reduce failed",
                        format!("{} x{}: {}", position.option_symbol, quantity, e),
                    ))
                    .await;
                return;
            }
        };

        let fallback = self.state.lock().last_price.unwrap_or(position.entry_price);
        let fill = resolve_fill(
            self.deps.broker.as_ref(),
            &order,
            self.deps.agent.fill_poll_attempts,
            self.deps.agent.fill_poll_interval(),
            fallback,
        )
        .await;
        let requested_sell = quantity;
        let quantity = fill.filled_quantity(requested_sell);
        self.record_order(
            OrderKind::Reduce,
            &order,
            requested_sell,
            None,
            (quantity > 0).then(|| fill.price()),
        )
        .await;
        if quantity == 0 {
            warn!("Reduce sell for {} ended unfilled", self.position_id);
            self.deps
                .notifier
                .notify(Alert::warning(
                    "Reduce failed",
                    format!("{} x{}: sell ended unfilled", position.option_symbol, requested_sell),
                ))
                .await;
            return;
        }

        let leg = leg_pnl(position.entry_price, fill.price(), quantity);
        let remaining = current - quantity;
        let update = PositionUpdate {
            quantity: Some(remaining),
            realized_pnl: Some(position.realized_pnl + leg),
            ..Default::default()
        };
        let store = &self.deps.store;
        if let Err(e) = retry_with_backoff(
            || store.update_position(&self.position_id, &update),
            self.deps.agent.close_write_retries,
            CLOSE_WRITE_BACKOFF_MS,
        )
        .await
        {
            error!("Reduce of {} sold but not persisted: {}", self.position_id, e);
        }

        info!(
            "Reduced {} by {} @ ${:.2}, {} left ({})",
            position.option_symbol,
            quantity,
            fill.price(),
            remaining,
            reason
        );
        self.deps.events.publish(PositionEvent::Reduced {
            position_id: self.position_id.clone(),
            quantity,
            remaining,
            fill_price: fill.price(),
            pnl: leg,
        });
        self.deps
            .notifier
            .notify(Alert::info(
                "Position reduced",
                format!(
                    "{} sold {} @ ${:.2} ({} left) | leg P&L {} | {}",
                    position.option_symbol,
                    quantity,
                    fill.price(),
                    remaining,
                    format_usd(leg),
                    reason
                ),
            ))
            .await;
    }

    fn initial_position(&self) -> Position {
        let now = Utc::now();
        let c = &self.request.candidate;
        let s = &self.request.sizing;
        Position {
            id: self.position_id.clone(),
            decision_id: self.request.decision.id.clone(),
            session_id: self.request.session_id.clone(),
            ticker: self.ticker().to_string(),
            option_symbol: c.symbol.clone(),
            side: c.side,
            strike: c.strike,
            expiration: c.expiration,
            quantity: s.quantity,
            entry_price: s.limit_price,
            limit_price: s.limit_price,
            stop_price: c.stop_price,
            take_profit_price: c.take_profit_price,
            conviction_score: s.conviction_score,
            conviction_tier: s.tier,
            status: PositionStatus::Open,
            entry_order_id: None,
            entry_confidence: self.request.entry_confidence,
            entry_alignment: self.request.entry_alignment.clone(),
            entry_direction: self.request.entry_direction.clone(),
            opened_at: self.state.lock().opened_at,
            closed_at: None,
            close_reason: None,
            exit_price: None,
            realized_pnl: 0.0,
            updated_at: now,
        }
    }

    async fn live_price(&self) -> Option<f64> {
        match self.deps.broker.get_position_prices().await {
            Ok(prices) => {
                let price = prices.get(self.option_symbol()).copied().filter(|p| *p > 0.0);
                match price {
                    Some(p) => self.state.lock().last_price = Some(p),
                    None => debug!("No live price for {}", self.option_symbol()),
                }
                price
            }
            Err(e) => {
                warn!("Price fetch for {} failed: {}", self.option_symbol(), e);
                None
            }
        }
    }

    /// Open row plus the live (or last known) price
    async fn live_state(&self) -> Option<(Position, f64)> {
        let position = match self.deps.store.get_position(&self.position_id).await {
            Ok(Some(p)) if p.is_open() => p,
            Ok(_) => return None,
            Err(e) => {
                warn!("Position read for {} failed: {}", self.position_id, e);
                return None;
            }
        };
        let price = match self.live_price().await {
            Some(p) => p,
            None => self.state.lock().last_price?,
        };
        Some((position, price))
    }

    async fn record_order(
        &self,
        kind: OrderKind,
        order: &BrokerOrder,
        quantity: u32,
        limit_price: Option<f64>,
        fill_price: Option<f64>,
    ) {
        let record = OrderRecord {
            id: generate_id(),
            position_id: self.position_id.clone(),
            broker_order_id: order.order_id.clone(),
            kind,
            side: order.side,
            symbol: order.symbol.clone(),
            quantity,
            limit_price,
            fill_price,
            status: order.status,
            created_at: Utc::now(),
        };
        if let Err(e) = self.deps.store.insert_order(&record).await {
            warn!("Order {} for {} not persisted: {}", order.order_id, self.position_id, e);
        }
    }

    fn set_phase(&self, phase: PositionPhase, reason: &str) {
        self.state.lock().phase.transition_to(phase, Some(reason));
    }

    /// Terminal bookkeeping: phase, timer, registry
    fn finish(&self, phase: PositionPhase, reason: &str) {
        {
            let mut st = self.state.lock();
            st.pending_exit = None;
            if st.phase.current() != phase {
                st.phase.transition_to(phase, Some(reason));
            }
        }
        self.stop_timer();
        (self.deregister)(&self.position_id);
    }
}
