//! Persistence Module
//!
//! The `PositionStore` seam the agents and the registry write through:
//! - Position rows and their partial updates
//! - Broker order records
//! - Immutable agent tick history
//! - Originating decisions (bulk-read on restore)

pub mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use thiserror::Error;

use crate::position::{AgentTick, OrderRecord, Position, PositionUpdate};
use crate::utils::types::{OptionSide, TradeDecision};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),
    #[error("duplicate record: {0}")]
    Duplicate(String),
    #[error("snapshot I/O failed: {0}")]
    Io(String),
    #[error("serialization failed: {0}")]
    Serialization(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait PositionStore: Send + Sync {
    async fn insert_position(&self, position: &Position) -> StoreResult<()>;

    /// Apply a partial update and return the resulting row
    async fn update_position(&self, id: &str, update: &PositionUpdate) -> StoreResult<Position>;

    async fn get_position(&self, id: &str) -> StoreResult<Option<Position>>;

    /// Open rows, optionally for a single ticker
    async fn list_open_positions(&self, ticker: Option<&str>) -> StoreResult<Vec<Position>>;

    /// Most recently closed rows for a ticker and side, newest first
    async fn recent_closed(
        &self,
        ticker: &str,
        side: OptionSide,
        limit: usize,
    ) -> StoreResult<Vec<Position>>;

    /// Realized P&L booked since `since`, partial reductions included
    async fn realized_pnl_since(&self, since: DateTime<Utc>) -> StoreResult<f64>;

    async fn insert_order(&self, order: &OrderRecord) -> StoreResult<()>;

    async fn orders_for(&self, position_id: &str) -> StoreResult<Vec<OrderRecord>>;

    async fn insert_agent_tick(&self, tick: &AgentTick) -> StoreResult<()>;

    /// Latest `limit` ticks for a position, oldest first
    async fn recent_ticks(&self, position_id: &str, limit: usize) -> StoreResult<Vec<AgentTick>>;

    async fn insert_decision(&self, decision: &TradeDecision) -> StoreResult<()>;

    /// Bulk read keyed by decision id; unknown ids are omitted
    async fn get_decisions(&self, ids: &[String]) -> StoreResult<HashMap<String, TradeDecision>>;
}
