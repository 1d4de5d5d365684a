//! Agent Module
//!
//! One autonomous agent per position:
//! - Phase machine for the position lifecycle
//! - Deterministic exits (stop, take-profit, expiry) every tick
//! - Advisory AI arbitration with a stop ratchet
//! - Idempotent exit and partial-close execution

pub mod arbitration;
pub mod expiry;
pub mod position_agent;
pub mod state_machine;

pub use arbitration::{ratchet_stop, AiRecommendation, ArbitrationContext};
pub use expiry::{ExpiryAction, ExpiryGuard};
pub use position_agent::{AgentStatus, PositionAgent};
pub use state_machine::{PhaseMachine, PositionPhase};

use std::sync::Arc;

use crate::agentic::{AiAdvisor, TradeEvaluator};
use crate::config::{AgentConfig, MarketConfig};
use crate::events::EventBus;
use crate::execution::Broker;
use crate::position::Position;
use crate::risk::sizing::SizingResult;
use crate::store::PositionStore;
use crate::telemetry::Notifier;
use crate::utils::types::{
    DecisionAction, Direction, OptionCandidate, OptionSide, TradeDecision,
};

/// Narrow capability an agent uses to remove itself once terminal
pub type Deregister = Arc<dyn Fn(&str) + Send + Sync>;

/// Collaborators and settings shared by every agent
#[derive(Clone)]
pub struct AgentDeps {
    pub broker: Arc<dyn Broker>,
    pub store: Arc<dyn PositionStore>,
    pub advisor: Arc<dyn AiAdvisor>,
    pub notifier: Arc<dyn Notifier>,
    pub evaluator: Arc<dyn TradeEvaluator>,
    pub events: EventBus,
    pub agent: AgentConfig,
    pub market: MarketConfig,
}

/// Immutable creation-time configuration of an agent
#[derive(Debug, Clone)]
pub struct EntryRequest {
    pub decision: TradeDecision,
    pub candidate: OptionCandidate,
    pub sizing: SizingResult,
    pub session_id: Option<String>,
    pub entry_confidence: f64,
    pub entry_alignment: String,
    pub entry_direction: String,
}

impl EntryRequest {
    pub fn ticker(&self) -> &str {
        &self.decision.ticker
    }

    /// Rebuild the context of a persisted position.
    ///
    /// Quotes, risk budget and risk/reward are not persisted and are zeroed;
    /// nothing after entry reads them. A missing decision is synthesized from
    /// the row.
    pub fn from_position(position: &Position, decision: Option<TradeDecision>) -> Self {
        let decision = decision.unwrap_or_else(|| TradeDecision {
            id: position.decision_id.clone(),
            ticker: position.ticker.clone(),
            action: DecisionAction::Open,
            direction: parse_direction(&position.entry_direction).unwrap_or(match position.side {
                OptionSide::Call => Direction::Bullish,
                OptionSide::Put => Direction::Bearish,
            }),
            confidence: position.entry_confidence,
            reasoning: "restored without originating decision".to_string(),
            session_id: position.session_id.clone(),
            created_at: position.opened_at,
        });

        Self {
            decision,
            candidate: OptionCandidate {
                symbol: position.option_symbol.clone(),
                side: position.side,
                strike: position.strike,
                expiration: position.expiration,
                bid: 0.0,
                ask: 0.0,
                spread_pct: 0.0,
                stop_price: position.stop_price,
                take_profit_price: position.take_profit_price,
                risk_reward: 0.0,
                passed: true,
            },
            sizing: SizingResult {
                quantity: position.quantity,
                conviction_score: position.conviction_score,
                tier: position.conviction_tier,
                base_risk: 0.0,
                effective_risk: 0.0,
                risk_per_contract: 0.0,
                limit_price: position.limit_price,
            },
            session_id: position.session_id.clone(),
            entry_confidence: position.entry_confidence,
            entry_alignment: position.entry_alignment.clone(),
            entry_direction: position.entry_direction.clone(),
        }
    }
}

fn parse_direction(label: &str) -> Option<Direction> {
    match label.trim().to_uppercase().as_str() {
        "BULLISH" => Some(Direction::Bullish),
        "BEARISH" => Some(Direction::Bearish),
        "NEUTRAL" => Some(Direction::Neutral),
        _ => None,
    }
}
