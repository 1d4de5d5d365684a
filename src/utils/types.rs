//! Common types used throughout the application

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Option contract side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OptionSide {
    Call,
    Put,
}

impl fmt::Display for OptionSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionSide::Call => write!(f, "CALL"),
            OptionSide::Put => write!(f, "PUT"),
        }
    }
}

/// Directional bias of an upstream decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Bullish,
    Bearish,
    Neutral,
}

impl Direction {
    /// Contract side that expresses this direction, if any
    pub fn option_side(&self) -> Option<OptionSide> {
        match self {
            Direction::Bullish => Some(OptionSide::Call),
            Direction::Bearish => Some(OptionSide::Put),
            Direction::Neutral => None,
        }
    }
}

/// What the upstream pipeline decided for a ticker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionAction {
    Open,
    Hold,
    ReduceExposure,
    Exit,
    Reverse,
}

/// Upstream trade decision that originates a position
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeDecision {
    pub id: String,
    pub ticker: String,
    pub action: DecisionAction,
    pub direction: Direction,
    /// Technical confidence in [0, 1]
    pub confidence: f64,
    pub reasoning: String,
    pub session_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Selected option contract handed over by the contract selector
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptionCandidate {
    pub symbol: String,
    pub side: OptionSide,
    pub strike: f64,
    pub expiration: NaiveDate,
    pub bid: f64,
    pub ask: f64,
    /// Bid/ask spread as a percentage of mid
    pub spread_pct: f64,
    pub stop_price: f64,
    pub take_profit_price: f64,
    pub risk_reward: f64,
    /// Whether the selector accepted this contract
    pub passed: bool,
}

/// Urgency attached to an orchestrator suggestion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    Immediate,
    Standard,
    Low,
}

impl fmt::Display for Urgency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Urgency::Immediate => write!(f, "immediate"),
            Urgency::Standard => write!(f, "standard"),
            Urgency::Low => write!(f, "low"),
        }
    }
}

/// Kind of orchestrator suggestion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SuggestionKind {
    Exit,
    ReduceExposure,
}

impl fmt::Display for SuggestionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SuggestionKind::Exit => write!(f, "EXIT"),
            SuggestionKind::ReduceExposure => write!(f, "REDUCE_EXPOSURE"),
        }
    }
}

/// Suggestion delivered to a running agent by the orchestrator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorSuggestion {
    pub kind: SuggestionKind,
    pub reason: String,
    pub urgency: Urgency,
}

impl OrchestratorSuggestion {
    pub fn exit(reason: impl Into<String>, urgency: Urgency) -> Self {
        Self {
            kind: SuggestionKind::Exit,
            reason: reason.into(),
            urgency,
        }
    }

    pub fn reduce(reason: impl Into<String>, urgency: Urgency) -> Self {
        Self {
            kind: SuggestionKind::ReduceExposure,
            reason: reason.into(),
            urgency,
        }
    }
}

/// Broker order side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

/// Broker order status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    New,
    Accepted,
    PendingNew,
    PartiallyFilled,
    Filled,
    Canceled,
    Expired,
    Rejected,
}

impl OrderStatus {
    pub fn is_filled(&self) -> bool {
        matches!(self, OrderStatus::Filled | OrderStatus::PartiallyFilled)
    }

    /// Canceled, expired or rejected: the order will never fill
    pub fn is_dead(&self) -> bool {
        matches!(
            self,
            OrderStatus::Canceled | OrderStatus::Expired | OrderStatus::Rejected
        )
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OrderStatus::New => "new",
            OrderStatus::Accepted => "accepted",
            OrderStatus::PendingNew => "pending_new",
            OrderStatus::PartiallyFilled => "partially_filled",
            OrderStatus::Filled => "filled",
            OrderStatus::Canceled => "canceled",
            OrderStatus::Expired => "expired",
            OrderStatus::Rejected => "rejected",
        };
        write!(f, "{}", s)
    }
}

/// Multiplier between an option premium and contract value
pub const CONTRACT_MULTIPLIER: f64 = 100.0;
