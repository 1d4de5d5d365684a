//! Conviction Sizing
//!
//! Turns a 0-10 conviction score and account state into a bounded
//! contract quantity:
//! - score maps to a tier with a risk multiplier
//! - quantity = floor(effective risk / risk per contract)
//! - clamped to [1, max_contracts], then capped by buying power

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

use crate::config::SizingConfig;
use crate::utils::types::CONTRACT_MULTIPLIER;

/// Discrete sizing bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConvictionTier {
    Regular,
    Sizable,
    MaxConviction,
}

impl fmt::Display for ConvictionTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConvictionTier::Regular => write!(f, "REGULAR"),
            ConvictionTier::Sizable => write!(f, "SIZABLE"),
            ConvictionTier::MaxConviction => write!(f, "MAX_CONVICTION"),
        }
    }
}

/// Inputs for one sizing decision
#[derive(Debug, Clone)]
pub struct SizingInput {
    pub conviction_score: f64,
    pub equity: f64,
    pub buying_power: f64,
    pub entry_price: f64,
    pub stop_price: f64,
}

/// Sizing decision, immutable once the position is opened
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SizingResult {
    pub quantity: u32,
    pub conviction_score: f64,
    pub tier: ConvictionTier,
    pub base_risk: f64,
    pub effective_risk: f64,
    pub risk_per_contract: f64,
    pub limit_price: f64,
}

impl SizingResult {
    /// Premium outlay for the full quantity
    pub fn total_cost(&self) -> f64 {
        self.quantity as f64 * self.limit_price * CONTRACT_MULTIPLIER
    }
}

pub fn tier_for_score(config: &SizingConfig, score: f64) -> (ConvictionTier, f64) {
    if score >= config.max_conviction_threshold {
        (ConvictionTier::MaxConviction, config.max_conviction_multiplier)
    } else if score >= config.sizable_threshold {
        (ConvictionTier::Sizable, config.sizable_multiplier)
    } else {
        (ConvictionTier::Regular, config.regular_multiplier)
    }
}

/// Size a new position.
///
/// A stop at or above the entry leaves no per-contract risk to divide by; the
/// raw quantity is then the floor of one contract. The result may be zero
/// contracts when buying power cannot cover even one.
pub fn size_position(config: &SizingConfig, input: &SizingInput) -> SizingResult {
    let score = input.conviction_score.clamp(0.0, 10.0);
    let (tier, multiplier) = tier_for_score(config, score);

    let base_risk = input.equity.max(0.0) * config.max_risk_pct;
    let effective_risk = base_risk * multiplier;
    let risk_per_contract = (input.entry_price - input.stop_price) * CONTRACT_MULTIPLIER;

    let raw = if risk_per_contract > 0.0 {
        (effective_risk / risk_per_contract).floor()
    } else {
        1.0
    };
    let max_contracts = config.max_contracts.max(1);
    let mut quantity = (raw as u32).clamp(1, max_contracts);

    let cost_per_contract = input.entry_price * CONTRACT_MULTIPLIER;
    if cost_per_contract > 0.0 {
        let affordable = (input.buying_power.max(0.0) / cost_per_contract).floor() as u32;
        if affordable < quantity {
            debug!(
                "Sizing capped by buying power: {} -> {} contracts",
                quantity, affordable
            );
            quantity = affordable;
        }
    }

    SizingResult {
        quantity,
        conviction_score: score,
        tier,
        base_risk,
        effective_risk,
        risk_per_contract,
        limit_price: input.entry_price,
    }
}
