//! Options Pilot Library
//!
//! Lifecycle and concurrency engine for single-leg option positions:
//! one autonomous agent per position, a registry that enforces per-ticker
//! caps, pre-trade safety gates and conviction-tiered sizing.

pub mod agent;
pub mod agentic;
pub mod config;
pub mod events;
pub mod execution;
pub mod position;
pub mod risk;
pub mod store;
pub mod telemetry;
pub mod utils;

// Re-export main types
pub use agent::{AgentDeps, EntryRequest, PositionAgent, PositionPhase};
pub use config::AppConfig;
pub use events::{EventBus, PositionEvent};
pub use execution::{Broker, BrokerError, PaperBroker};
pub use position::{PositionRegistry, RegistryError};
pub use risk::{evaluate_gates, size_position, GateResult, SizingResult};
pub use store::{MemoryStore, PositionStore};
