//! Position Module
//!
//! Persisted records of the position lifecycle:
//! - Position rows (one per opened contract holding)
//! - Broker order records (entry, reduce, exit)
//! - Immutable agent tick records written before every AI action
//!
//! The registry that owns the live agents lives in [`registry`].

pub mod registry;

pub use registry::{
    CloseAllReport, EntryRequest, NotifyOutcome, PositionRegistry, RegistryError, RestoreReport,
};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::risk::sizing::ConvictionTier;
use crate::utils::types::{OptionSide, OrderSide, OrderStatus, CONTRACT_MULTIPLIER};

/// Persisted position status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionStatus {
    Open,
    Closed,
}

/// A persisted option position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: String,
    pub decision_id: String,
    pub session_id: Option<String>,
    pub ticker: String,
    pub option_symbol: String,
    pub side: OptionSide,
    pub strike: f64,
    pub expiration: NaiveDate,
    pub quantity: u32,
    pub entry_price: f64,
    pub limit_price: f64,
    pub stop_price: f64,
    pub take_profit_price: f64,
    pub conviction_score: f64,
    pub conviction_tier: ConvictionTier,
    pub status: PositionStatus,
    pub entry_order_id: Option<String>,
    pub entry_confidence: f64,
    pub entry_alignment: String,
    pub entry_direction: String,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub close_reason: Option<String>,
    pub exit_price: Option<f64>,
    /// Realized P&L including any partial reductions
    pub realized_pnl: f64,
    pub updated_at: DateTime<Utc>,
}

impl Position {
    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::Open
    }

    /// Unrealized P&L in percent of entry premium
    pub fn unrealized_pnl_pct(&self, price: f64) -> f64 {
        if self.entry_price <= 0.0 {
            return 0.0;
        }
        (price - self.entry_price) / self.entry_price * 100.0
    }
}

/// P&L of closing `quantity` contracts bought at `entry` and sold at `exit`
pub fn leg_pnl(entry: f64, exit: f64, quantity: u32) -> f64 {
    (exit - entry) * quantity as f64 * CONTRACT_MULTIPLIER
}

/// Partial update applied to a position row; `None` leaves a column untouched
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PositionUpdate {
    pub quantity: Option<u32>,
    pub entry_order_id: Option<String>,
    pub entry_price: Option<f64>,
    pub stop_price: Option<f64>,
    pub take_profit_price: Option<f64>,
    pub status: Option<PositionStatus>,
    pub exit_price: Option<f64>,
    pub realized_pnl: Option<f64>,
    pub close_reason: Option<String>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl PositionUpdate {
    /// Close the row, recording an exit price when one is known
    pub fn close(reason: impl Into<String>, exit_price: Option<f64>, realized_pnl: f64) -> Self {
        Self {
            status: Some(PositionStatus::Closed),
            exit_price,
            realized_pnl: Some(realized_pnl),
            close_reason: Some(reason.into()),
            closed_at: Some(Utc::now()),
            ..Default::default()
        }
    }

    /// Close without an exit price: the position never traded
    pub fn void(reason: impl Into<String>) -> Self {
        Self::close(reason, None, 0.0)
    }

    pub fn apply(&self, position: &mut Position) {
        if let Some(q) = self.quantity {
            position.quantity = q;
        }
        if self.entry_order_id.is_some() {
            position.entry_order_id = self.entry_order_id.clone();
        }
        if let Some(p) = self.entry_price {
            position.entry_price = p;
        }
        if let Some(s) = self.stop_price {
            position.stop_price = s;
        }
        if let Some(tp) = self.take_profit_price {
            position.take_profit_price = tp;
        }
        if let Some(status) = self.status {
            position.status = status;
        }
        if self.exit_price.is_some() {
            position.exit_price = self.exit_price;
        }
        if let Some(pnl) = self.realized_pnl {
            position.realized_pnl = pnl;
        }
        if self.close_reason.is_some() {
            position.close_reason = self.close_reason.clone();
        }
        if self.closed_at.is_some() {
            position.closed_at = self.closed_at;
        }
        position.updated_at = Utc::now();
    }
}

/// Why an order was sent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderKind {
    Entry,
    Reduce,
    Exit,
}

/// Persisted broker order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRecord {
    pub id: String,
    pub position_id: String,
    pub broker_order_id: String,
    pub kind: OrderKind,
    pub side: OrderSide,
    pub symbol: String,
    pub quantity: u32,
    pub limit_price: Option<f64>,
    pub fill_price: Option<f64>,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
}

/// Action chosen by the AI advisor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AiAction {
    Hold,
    Exit,
    Reduce,
    AdjustStop,
}

impl std::fmt::Display for AiAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AiAction::Hold => write!(f, "HOLD"),
            AiAction::Exit => write!(f, "EXIT"),
            AiAction::Reduce => write!(f, "REDUCE"),
            AiAction::AdjustStop => write!(f, "ADJUST_STOP"),
        }
    }
}

/// Immutable record of one AI arbitration outcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentTick {
    pub position_id: String,
    pub tick_number: u64,
    pub action: AiAction,
    /// Stop that results from the action, when it changes the stop
    pub new_stop: Option<f64>,
    pub pnl_pct: f64,
    pub price: f64,
    pub overrode_orchestrator: bool,
    /// Reason of the orchestrator suggestion under arbitration
    pub suggestion: Option<String>,
    pub reasoning: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_position() -> Position {
        let now = Utc::now();
        Position {
            id: "pos-1".to_string(),
            decision_id: "dec-1".to_string(),
            session_id: None,
            ticker: "SPY".to_string(),
            option_symbol: "SPY250620C00550000".to_string(),
            side: OptionSide::Call,
            strike: 550.0,
            expiration: NaiveDate::from_ymd_opt(2025, 6, 20).unwrap(),
            quantity: 4,
            entry_price: 2.0,
            limit_price: 2.0,
            stop_price: 1.5,
            take_profit_price: 3.0,
            conviction_score: 8.0,
            conviction_tier: ConvictionTier::MaxConviction,
            status: PositionStatus::Open,
            entry_order_id: Some("ord-1".to_string()),
            entry_confidence: 0.7,
            entry_alignment: "ALIGNED".to_string(),
            entry_direction: "BULLISH".to_string(),
            opened_at: now,
            closed_at: None,
            close_reason: None,
            exit_price: None,
            realized_pnl: 0.0,
            updated_at: now,
        }
    }

    #[test]
    fn test_leg_pnl() {
        assert_eq!(leg_pnl(2.0, 2.5, 4), 200.0);
        assert_eq!(leg_pnl(2.0, 1.5, 2), -100.0);
    }

    #[test]
    fn test_update_apply_only_touches_set_fields() {
        let mut pos = sample_position();
        PositionUpdate {
            stop_price: Some(1.8),
            ..Default::default()
        }
        .apply(&mut pos);
        assert_eq!(pos.stop_price, 1.8);
        assert_eq!(pos.quantity, 4);
        assert!(pos.is_open());
    }

    #[test]
    fn test_void_has_no_exit_price() {
        let mut pos = sample_position();
        PositionUpdate::void("ENTRY_REJECTED").apply(&mut pos);
        assert_eq!(pos.status, PositionStatus::Closed);
        assert_eq!(pos.exit_price, None);
        assert_eq!(pos.close_reason.as_deref(), Some("ENTRY_REJECTED"));
        assert!(pos.closed_at.is_some());
    }

    #[test]
    fn test_unrealized_pnl_pct() {
        let pos = sample_position();
        assert!((pos.unrealized_pnl_pct(2.5) - 25.0).abs() < 1e-9);
    }
}
