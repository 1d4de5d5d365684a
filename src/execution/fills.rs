//! Fill Resolution
//!
//! Option fills are often reported asynchronously. When an order comes back
//! without a fill price we poll it a bounded number of times and fall back
//! to the best price we already know, so P&L math always has a number.
//! An order that dies while we poll reports how much of it actually filled.

use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use super::{Broker, BrokerOrder};
use crate::utils::types::OrderStatus;

/// Where the fill price came from
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FillResolution {
    /// Reported by the broker with the submission
    Immediate(f64),
    /// Found by polling the order
    Polled(f64),
    /// Polling ran out; best known price used instead
    Fallback(f64),
    /// Canceled, expired or rejected with `filled` contracts done
    Ended {
        status: OrderStatus,
        filled: u32,
        price: f64,
    },
}

impl FillResolution {
    pub fn price(&self) -> f64 {
        match self {
            FillResolution::Immediate(p) | FillResolution::Polled(p) | FillResolution::Fallback(p) => *p,
            FillResolution::Ended { price, .. } => *price,
        }
    }

    pub fn confirmed(&self) -> bool {
        matches!(self, FillResolution::Immediate(_) | FillResolution::Polled(_))
    }

    /// Contracts the order actually traded out of `submitted`
    pub fn filled_quantity(&self, submitted: u32) -> u32 {
        match self {
            FillResolution::Ended { filled, .. } => (*filled).min(submitted),
            _ => submitted,
        }
    }
}

fn ended(order: &BrokerOrder, fallback_price: f64) -> FillResolution {
    warn!(
        "Order {} ended {} with {}/{} filled",
        order.order_id, order.status, order.filled_quantity, order.quantity
    );
    FillResolution::Ended {
        status: order.status,
        filled: order.filled_quantity,
        price: order.filled_avg_price.filter(|p| *p > 0.0).unwrap_or(fallback_price),
    }
}

/// Resolve the fill price of a submitted order.
///
/// Total wait is bounded by `attempts * interval`.
pub async fn resolve_fill(
    broker: &dyn Broker,
    order: &BrokerOrder,
    attempts: u32,
    interval: Duration,
    fallback_price: f64,
) -> FillResolution {
    if order.status.is_dead() {
        return ended(order, fallback_price);
    }
    if let Some(price) = order.filled_avg_price.filter(|p| *p > 0.0) {
        return FillResolution::Immediate(price);
    }

    for attempt in 1..=attempts {
        sleep(interval).await;
        match broker.get_order(&order.order_id).await {
            Ok(polled) => {
                if polled.status.is_dead() {
                    return ended(&polled, fallback_price);
                }
                if let Some(price) = polled.filled_avg_price.filter(|p| *p > 0.0) {
                    debug!(
                        "Order {} filled @ {:.2} after {} poll(s)",
                        order.order_id, price, attempt
                    );
                    return FillResolution::Polled(price);
                }
            }
            Err(e) => {
                debug!("Fill poll {} for {} failed: {}", attempt, order.order_id, e);
            }
        }
    }

    warn!(
        "No fill price for order {} after {} polls, using {:.2}",
        order.order_id, attempts, fallback_price
    );
    FillResolution::Fallback(fallback_price)
}
