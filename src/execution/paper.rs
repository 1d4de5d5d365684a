//! Paper Broker
//!
//! In-process broker for paper trading:
//! - Limit buys fill at the limit (immediately or on demand)
//! - Market sells fill at the current mark
//! - Marks are set externally and served as live position prices
//! - Failures can be injected for drills

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use tracing::{debug, info};

use super::{Broker, BrokerError, BrokerOrder, BrokerResult};
use crate::utils::types::{OrderSide, OrderStatus};

#[derive(Debug, Clone)]
pub struct PaperConfig {
    /// Fill limit buys as soon as they are submitted
    pub fill_entries_immediately: bool,
    /// Report a fill price with market sells when a mark is known
    pub report_sell_fills: bool,
}

impl Default for PaperConfig {
    fn default() -> Self {
        Self {
            fill_entries_immediately: true,
            report_sell_fills: true,
        }
    }
}

#[derive(Default)]
struct PaperBook {
    orders: HashMap<String, BrokerOrder>,
    /// Submission order of `orders`
    sequence: Vec<String>,
    marks: HashMap<String, f64>,
    injected_failures: VecDeque<BrokerError>,
    /// Terminal status and filled count for upcoming market sells
    sell_endings: VecDeque<(OrderStatus, u32)>,
    prices_unavailable: bool,
}

/// Paper broker
pub struct PaperBroker {
    config: PaperConfig,
    book: Mutex<PaperBook>,
}

impl PaperBroker {
    pub fn new(config: PaperConfig) -> Self {
        Self {
            config,
            book: Mutex::new(PaperBook::default()),
        }
    }

    /// Set the live mark for an option symbol
    pub fn set_mark(&self, symbol: &str, price: f64) {
        self.book.lock().marks.insert(symbol.to_string(), price);
    }

    /// Force an order to a status, optionally with a fill price
    pub fn set_order_fill(&self, order_id: &str, status: OrderStatus, price: Option<f64>) {
        let mut book = self.book.lock();
        if let Some(order) = book.orders.get_mut(order_id) {
            order.status = status;
            order.filled_avg_price = price;
            if status.is_filled() && order.filled_quantity == 0 {
                order.filled_quantity = order.quantity;
            }
        }
    }

    /// Override the filled quantity of an order (partial fills)
    pub fn set_filled_quantity(&self, order_id: &str, filled: u32) {
        if let Some(order) = self.book.lock().orders.get_mut(order_id) {
            order.filled_quantity = filled.min(order.quantity);
        }
    }

    /// The next submission fails with `error`
    pub fn fail_next_submit(&self, error: BrokerError) {
        self.book.lock().injected_failures.push_back(error);
    }

    /// The next market sell is accepted but ends with `status` after
    /// `filled` contracts
    pub fn end_next_sell(&self, status: OrderStatus, filled: u32) {
        self.book.lock().sell_endings.push_back((status, filled));
    }

    pub fn set_prices_unavailable(&self, unavailable: bool) {
        self.book.lock().prices_unavailable = unavailable;
    }

    /// Every order in submission order
    pub fn orders(&self) -> Vec<BrokerOrder> {
        let book = self.book.lock();
        book.sequence
            .iter()
            .filter_map(|id| book.orders.get(id).cloned())
            .collect()
    }

    pub fn sell_orders(&self, symbol: &str) -> Vec<BrokerOrder> {
        self.orders()
            .into_iter()
            .filter(|o| o.side == OrderSide::Sell && o.symbol == symbol)
            .collect()
    }

    pub fn buy_orders(&self) -> Vec<BrokerOrder> {
        self.orders()
            .into_iter()
            .filter(|o| o.side == OrderSide::Buy)
            .collect()
    }

    fn record(book: &mut PaperBook, order: BrokerOrder) -> BrokerOrder {
        book.sequence.push(order.order_id.clone());
        book.orders.insert(order.order_id.clone(), order.clone());
        order
    }
}

#[async_trait]
impl Broker for PaperBroker {
    async fn submit_limit_buy(
        &self,
        symbol: &str,
        quantity: u32,
        limit_price: f64,
    ) -> BrokerResult<BrokerOrder> {
        let mut book = self.book.lock();
        if let Some(err) = book.injected_failures.pop_front() {
            return Err(err);
        }

        let filled = self.config.fill_entries_immediately;
        let order = BrokerOrder {
            order_id: format!("paper-{}", uuid::Uuid::new_v4()),
            symbol: symbol.to_string(),
            side: OrderSide::Buy,
            quantity,
            filled_quantity: if filled { quantity } else { 0 },
            filled_avg_price: filled.then_some(limit_price),
            status: if filled { OrderStatus::Filled } else { OrderStatus::Accepted },
        };
        book.marks.entry(symbol.to_string()).or_insert(limit_price);

        info!(
            "Paper BUY {} x{} @ {:.2} ({})",
            symbol, quantity, limit_price, order.status
        );
        Ok(Self::record(&mut book, order))
    }

    async fn submit_market_sell(&self, symbol: &str, quantity: u32) -> BrokerResult<BrokerOrder> {
        let mut book = self.book.lock();
        if let Some(err) = book.injected_failures.pop_front() {
            return Err(err);
        }

        let mark = book.marks.get(symbol).copied();
        let order_id = format!("paper-{}", uuid::Uuid::new_v4());
        let order = match book.sell_endings.pop_front() {
            Some((status, filled)) => {
                let filled = filled.min(quantity);
                BrokerOrder {
                    order_id,
                    symbol: symbol.to_string(),
                    side: OrderSide::Sell,
                    quantity,
                    filled_quantity: filled,
                    filled_avg_price: if filled > 0 { mark } else { None },
                    status,
                }
            }
            None => {
                let filled = self.config.report_sell_fills && mark.is_some();
                BrokerOrder {
                    order_id,
                    symbol: symbol.to_string(),
                    side: OrderSide::Sell,
                    quantity,
                    filled_quantity: if filled { quantity } else { 0 },
                    filled_avg_price: if filled { mark } else { None },
                    status: if filled { OrderStatus::Filled } else { OrderStatus::Accepted },
                }
            }
        };

        info!("Paper SELL {} x{} ({})", symbol, quantity, order.status);
        Ok(Self::record(&mut book, order))
    }

    async fn cancel_open_orders(&self, symbol: Option<&str>) -> BrokerResult<usize> {
        let mut book = self.book.lock();
        let mut canceled = 0;
        for order in book.orders.values_mut() {
            let open = matches!(
                order.status,
                OrderStatus::New
                    | OrderStatus::Accepted
                    | OrderStatus::PendingNew
                    | OrderStatus::PartiallyFilled
            );
            if open && symbol.map_or(true, |s| s == order.symbol) {
                order.status = OrderStatus::Canceled;
                canceled += 1;
            }
        }
        debug!("Paper canceled {} open order(s)", canceled);
        Ok(canceled)
    }

    async fn get_order(&self, order_id: &str) -> BrokerResult<BrokerOrder> {
        self.book
            .lock()
            .orders
            .get(order_id)
            .cloned()
            .ok_or_else(|| BrokerError::OrderNotFound(order_id.to_string()))
    }

    async fn get_position_prices(&self) -> BrokerResult<HashMap<String, f64>> {
        let book = self.book.lock();
        if book.prices_unavailable {
            return Err(BrokerError::Unavailable("price feed down".to_string()));
        }
        Ok(book.marks.clone())
    }
}
