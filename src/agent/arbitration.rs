//! AI arbitration
//!
//! Context handed to the advisor, strict decoding of its answer, and the
//! stop ratchet that keeps the advisor from ever loosening a stop.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::agentic::AdvisorError;
use crate::position::{AgentTick, AiAction, Position};
use crate::risk::sizing::ConvictionTier;
use crate::utils::types::{OptionSide, OrchestratorSuggestion, TradeDecision};

/// Live view of the position at arbitration time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LivePositionState {
    pub position_id: String,
    pub ticker: String,
    pub option_symbol: String,
    pub side: OptionSide,
    pub strike: f64,
    pub expiration: NaiveDate,
    pub quantity: u32,
    pub entry_price: f64,
    pub current_price: f64,
    pub unrealized_pnl_pct: f64,
    pub stop_price: f64,
    pub take_profit_price: f64,
    pub minutes_held: i64,
    pub minutes_to_expiry: i64,
    pub conviction_tier: ConvictionTier,
    pub entry_confidence: f64,
    pub entry_alignment: String,
    pub entry_direction: String,
}

impl LivePositionState {
    pub fn new(position: &Position, price: f64, now: DateTime<Utc>, minutes_to_expiry: i64) -> Self {
        Self {
            position_id: position.id.clone(),
            ticker: position.ticker.clone(),
            option_symbol: position.option_symbol.clone(),
            side: position.side,
            strike: position.strike,
            expiration: position.expiration,
            quantity: position.quantity,
            entry_price: position.entry_price,
            current_price: price,
            unrealized_pnl_pct: position.unrealized_pnl_pct(price),
            stop_price: position.stop_price,
            take_profit_price: position.take_profit_price,
            minutes_held: (now - position.opened_at).num_minutes(),
            minutes_to_expiry,
            conviction_tier: position.conviction_tier,
            entry_confidence: position.entry_confidence,
            entry_alignment: position.entry_alignment.clone(),
            entry_direction: position.entry_direction.clone(),
        }
    }
}

/// Closed trade on the same ticker and side
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClosedOutcome {
    pub position_id: String,
    pub entry_price: f64,
    pub exit_price: Option<f64>,
    pub realized_pnl: f64,
    pub close_reason: Option<String>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl From<&Position> for ClosedOutcome {
    fn from(p: &Position) -> Self {
        Self {
            position_id: p.id.clone(),
            entry_price: p.entry_price,
            exit_price: p.exit_price,
            realized_pnl: p.realized_pnl,
            close_reason: p.close_reason.clone(),
            closed_at: p.closed_at,
        }
    }
}

/// Payload sent to the advisor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArbitrationContext {
    pub decision: TradeDecision,
    /// Orchestrator suggestion under arbitration, `None` for periodic reviews
    pub suggestion: Option<OrchestratorSuggestion>,
    pub position: LivePositionState,
    /// Oldest first
    pub recent_ticks: Vec<AgentTick>,
    pub recent_outcomes: Vec<ClosedOutcome>,
}

/// Decoded advisor answer
#[derive(Debug, Clone, PartialEq)]
pub struct AiRecommendation {
    pub action: AiAction,
    pub reasoning: String,
    pub new_stop: Option<f64>,
    pub overriding_orchestrator: bool,
}

#[derive(Deserialize)]
struct RawRecommendation {
    #[serde(default)]
    action: Option<serde_json::Value>,
    #[serde(default)]
    reasoning: Option<String>,
    #[serde(default)]
    new_stop: Option<serde_json::Value>,
    #[serde(default)]
    overriding_orchestrator: Option<bool>,
}

impl AiRecommendation {
    /// Decode an advisor response.
    ///
    /// The body may be wrapped in prose or a fenced code block; the outermost
    /// JSON object is used. Missing or unknown actions decode to HOLD and a
    /// stop that is not a positive number decodes to `None`. A body without a
    /// JSON object is an error.
    pub fn decode(raw: &str) -> Result<Self, AdvisorError> {
        let start = raw.find('{');
        let end = raw.rfind('}');
        let json = match (start, end) {
            (Some(s), Some(e)) if e > s => &raw[s..=e],
            _ => {
                return Err(AdvisorError::InvalidResponse(
                    "no JSON object in response".to_string(),
                ))
            }
        };

        let parsed: RawRecommendation = serde_json::from_str(json)
            .map_err(|e| AdvisorError::InvalidResponse(e.to_string()))?;

        Ok(Self {
            action: parsed.action.as_ref().map(parse_action).unwrap_or(AiAction::Hold),
            reasoning: parsed.reasoning.unwrap_or_default(),
            new_stop: parsed.new_stop.as_ref().and_then(parse_price),
            overriding_orchestrator: parsed.overriding_orchestrator.unwrap_or(false),
        })
    }
}

fn parse_action(value: &serde_json::Value) -> AiAction {
    let Some(text) = value.as_str() else {
        return AiAction::Hold;
    };
    match text.trim().to_uppercase().replace(['-', ' '], "_").as_str() {
        "EXIT" => AiAction::Exit,
        "REDUCE" => AiAction::Reduce,
        "ADJUST_STOP" => AiAction::AdjustStop,
        _ => AiAction::Hold,
    }
}

fn parse_price(value: &serde_json::Value) -> Option<f64> {
    let price = match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().trim_start_matches('$').parse().ok(),
        _ => None,
    }?;
    (price.is_finite() && price > 0.0).then_some(price)
}

/// Accept a proposed stop only when it strictly tightens risk.
///
/// Calls ratchet upward, puts downward. The stop must also stay positive
/// and strictly below the live option price, otherwise it would trigger on
/// the very next tick.
pub fn ratchet_stop(side: OptionSide, current_stop: f64, proposed: f64, live_price: f64) -> Option<f64> {
    if !proposed.is_finite() || proposed <= 0.0 || proposed >= live_price {
        return None;
    }
    let improves = match side {
        OptionSide::Call => proposed > current_stop,
        OptionSide::Put => proposed < current_stop,
    };
    improves.then_some(proposed)
}
