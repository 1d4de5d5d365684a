//! Execution Module
//!
//! Broker seam used by agents and the registry:
//! - `Broker` trait (limit buy, market sell, cancel, order status, marks)
//! - Bounded fill polling for asynchronous fills
//! - In-process paper broker

pub mod fills;
pub mod paper;

pub use fills::{resolve_fill, FillResolution};
pub use paper::PaperBroker;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

use crate::utils::types::{OrderSide, OrderStatus};

/// Broker-side failure; never panics across the seam
#[derive(Debug, Clone, Error, PartialEq)]
pub enum BrokerError {
    #[error("order rejected: {0}")]
    Rejected(String),
    #[error("order not found: {0}")]
    OrderNotFound(String),
    #[error("broker unavailable: {0}")]
    Unavailable(String),
}

/// Broker view of an order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerOrder {
    pub order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: u32,
    pub filled_quantity: u32,
    pub filled_avg_price: Option<f64>,
    pub status: OrderStatus,
}

pub type BrokerResult<T> = Result<T, BrokerError>;

#[async_trait]
pub trait Broker: Send + Sync {
    async fn submit_limit_buy(
        &self,
        symbol: &str,
        quantity: u32,
        limit_price: f64,
    ) -> BrokerResult<BrokerOrder>;

    async fn submit_market_sell(&self, symbol: &str, quantity: u32) -> BrokerResult<BrokerOrder>;

    /// Cancel open orders for one symbol, or every open order when `None`.
    /// Returns the number of orders canceled.
    async fn cancel_open_orders(&self, symbol: Option<&str>) -> BrokerResult<usize>;

    async fn get_order(&self, order_id: &str) -> BrokerResult<BrokerOrder>;

    /// Live mark prices keyed by option symbol for every open position
    async fn get_position_prices(&self) -> BrokerResult<HashMap<String, f64>>;
}
