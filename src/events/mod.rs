//! Event Bus for position lifecycle events
//!
//! Broadcast-based so the agents never wait on observers (metrics,
//! dashboards, audit trails).

use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Lifecycle events published by position agents
#[derive(Debug, Clone, PartialEq)]
pub enum PositionEvent {
    Opened {
        position_id: String,
        ticker: String,
        option_symbol: String,
        quantity: u32,
        limit_price: f64,
    },
    Filled {
        position_id: String,
        fill_price: Option<f64>,
        quantity: u32,
    },
    Reduced {
        position_id: String,
        quantity: u32,
        remaining: u32,
        fill_price: f64,
        pnl: f64,
    },
    StopAdjusted {
        position_id: String,
        old_stop: f64,
        new_stop: f64,
    },
    ExpiryWarning {
        position_id: String,
        minutes_to_close: i64,
    },
    Closed {
        position_id: String,
        ticker: String,
        reason: String,
        exit_price: f64,
        realized_pnl: f64,
    },
    /// Exit requested before the entry filled; nothing was held
    Voided {
        position_id: String,
        ticker: String,
        reason: String,
    },
    Failed {
        position_id: String,
        ticker: String,
        reason: String,
    },
    ExitFailed {
        position_id: String,
        error: String,
    },
}

impl PositionEvent {
    pub fn position_id(&self) -> &str {
        match self {
            PositionEvent::Opened { position_id, .. }
            | PositionEvent::Filled { position_id, .. }
            | PositionEvent::Reduced { position_id, .. }
            | PositionEvent::StopAdjusted { position_id, .. }
            | PositionEvent::ExpiryWarning { position_id, .. }
            | PositionEvent::Closed { position_id, .. }
            | PositionEvent::Voided { position_id, .. }
            | PositionEvent::Failed { position_id, .. }
            | PositionEvent::ExitFailed { position_id, .. } => position_id,
        }
    }
}

/// Event bus for broadcasting events to multiple subscribers
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<PositionEvent>,
    capacity: usize,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender, capacity }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PositionEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: PositionEvent) {
        match self.sender.send(event) {
            Ok(count) => debug!("Event sent to {} receivers", count),
            // No receivers - fine during startup/shutdown and in tests
            Err(_) => debug!("No event receivers"),
        }
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// Spawn a task that feeds every event to `handler` until the bus closes
pub fn spawn_event_handler<F, Fut>(
    bus: &EventBus,
    name: &str,
    mut handler: F,
) -> tokio::task::JoinHandle<()>
where
    F: FnMut(PositionEvent) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send,
{
    let mut receiver = bus.subscribe();
    let name = name.to_string();

    tokio::spawn(async move {
        debug!("Event handler '{}' started", name);
        loop {
            match receiver.recv().await {
                Ok(event) => handler(event).await,
                Err(broadcast::error::RecvError::Lagged(count)) => {
                    warn!("Event handler '{}' lagged by {} messages", name, count);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        debug!("Event handler '{}' stopped", name);
    })
}
