//! Agentic Module
//!
//! Advisory and learning collaborators of the position agents:
//! - AI recommendation seam (HTTP advisor, always-hold fallback)
//! - Post-trade evaluation (performance journal)

pub mod advisor;
pub mod performance_db;

pub use advisor::{HoldAdvisor, HttpAdvisor};
pub use performance_db::{PerformanceDb, PerformanceMetrics, TierPerformance, TradeOutcome};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::agent::arbitration::ArbitrationContext;
use crate::risk::sizing::ConvictionTier;
use crate::utils::types::OptionSide;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum AdvisorError {
    #[error("advisor request failed: {0}")]
    Request(String),
    #[error("advisor timed out")]
    Timeout,
    #[error("advisor returned an unusable response: {0}")]
    InvalidResponse(String),
}

/// Source of advisory recommendations.
///
/// Returns the raw response body; decoding happens at the agent boundary.
#[async_trait]
pub trait AiAdvisor: Send + Sync {
    async fn recommend(&self, context: &ArbitrationContext) -> Result<String, AdvisorError>;
}

/// Everything known about a position once it is closed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeEvaluationInput {
    pub position_id: String,
    pub ticker: String,
    pub option_symbol: String,
    pub side: OptionSide,
    pub quantity: u32,
    pub entry_price: f64,
    pub exit_price: f64,
    pub realized_pnl: f64,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
    pub close_reason: String,
    pub conviction_tier: ConvictionTier,
    pub entry_confidence: f64,
    pub entry_alignment: String,
    pub entry_direction: String,
}

/// Post-trade evaluation, invoked once per closed position
#[async_trait]
pub trait TradeEvaluator: Send + Sync {
    async fn evaluate(&self, trade: &TradeEvaluationInput) -> anyhow::Result<()>;
}
