//! Safety Gates
//!
//! Pre-trade checks that fail-close new entries. Every gate is evaluated
//! and every failure is reported, so an operator sees the whole picture
//! rather than the first problem.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::GateConfig;
use crate::utils::types::{Direction, OptionCandidate, CONTRACT_MULTIPLIER};

/// Gate identifiers, in evaluation order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GateId {
    #[serde(rename = "TIME_GATE")]
    Time,
    #[serde(rename = "LIQUIDITY_GATE")]
    Liquidity,
    #[serde(rename = "CONFIDENCE_GATE")]
    Confidence,
    #[serde(rename = "RISK_REWARD_GATE")]
    RiskReward,
    #[serde(rename = "SIDE_MATCH_GATE")]
    SideMatch,
    #[serde(rename = "CANDIDATE_GATE")]
    Candidate,
    #[serde(rename = "BUYING_POWER_GATE")]
    BuyingPower,
    #[serde(rename = "QUANTITY_CAP_GATE")]
    QuantityCap,
    #[serde(rename = "DAILY_LOSS_GATE")]
    DailyLoss,
}

impl GateId {
    pub fn as_str(&self) -> &'static str {
        match self {
            GateId::Time => "TIME_GATE",
            GateId::Liquidity => "LIQUIDITY_GATE",
            GateId::Confidence => "CONFIDENCE_GATE",
            GateId::RiskReward => "RISK_REWARD_GATE",
            GateId::SideMatch => "SIDE_MATCH_GATE",
            GateId::Candidate => "CANDIDATE_GATE",
            GateId::BuyingPower => "BUYING_POWER_GATE",
            GateId::QuantityCap => "QUANTITY_CAP_GATE",
            GateId::DailyLoss => "DAILY_LOSS_GATE",
        }
    }
}

impl fmt::Display for GateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateFailure {
    pub gate: GateId,
    pub reason: String,
}

/// Outcome of a full gate evaluation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateResult {
    pub passed: bool,
    pub failures: Vec<GateFailure>,
}

impl GateResult {
    pub fn failed_gates(&self) -> Vec<GateId> {
        self.failures.iter().map(|f| f.gate).collect()
    }

    pub fn has_failure(&self, gate: GateId) -> bool {
        self.failures.iter().any(|f| f.gate == gate)
    }

    /// All reasons joined for logs and notifications
    pub fn summary(&self) -> String {
        self.failures
            .iter()
            .map(|f| format!("{}: {}", f.gate, f.reason))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Everything the gates look at
#[derive(Debug, Clone)]
pub struct GateInput<'a> {
    pub market_open: bool,
    /// Technical confidence of the qualitative analysis, in [0, 1]
    pub confidence: f64,
    pub direction: Direction,
    /// Selected contract, `None` when the selector found nothing
    pub candidate: Option<&'a OptionCandidate>,
    pub equity: f64,
    pub buying_power: f64,
    pub realized_pnl_today: f64,
    pub quantity: u32,
    pub limit_price: f64,
}

impl GateInput<'_> {
    pub fn total_cost(&self) -> f64 {
        self.quantity as f64 * self.limit_price * CONTRACT_MULTIPLIER
    }
}

/// Evaluate every gate and collect all failures
pub fn evaluate_gates(config: &GateConfig, input: &GateInput<'_>) -> GateResult {
    let mut failures = Vec::new();
    let mut fail = |gate: GateId, reason: String| failures.push(GateFailure { gate, reason });

    if !input.market_open {
        fail(GateId::Time, "market is closed".to_string());
    }

    match input.candidate {
        Some(c) if c.spread_pct > config.max_spread_pct => fail(
            GateId::Liquidity,
            format!("spread {:.2}% exceeds max {:.2}%", c.spread_pct, config.max_spread_pct),
        ),
        Some(_) => {}
        None => fail(GateId::Liquidity, "no contract to measure spread".to_string()),
    }

    if input.confidence < config.min_confidence {
        fail(
            GateId::Confidence,
            format!(
                "confidence {:.2} below minimum {:.2}",
                input.confidence, config.min_confidence
            ),
        );
    }

    match input.candidate {
        Some(c) if c.risk_reward < config.min_risk_reward => fail(
            GateId::RiskReward,
            format!(
                "risk/reward {:.2} below minimum {:.2}",
                c.risk_reward, config.min_risk_reward
            ),
        ),
        Some(_) => {}
        None => fail(GateId::RiskReward, "no contract to measure risk/reward".to_string()),
    }

    match (input.direction.option_side(), input.candidate) {
        (Some(wanted), Some(c)) if c.side != wanted => fail(
            GateId::SideMatch,
            format!("selected {} but direction {:?} wants {}", c.side, input.direction, wanted),
        ),
        (None, _) => fail(
            GateId::SideMatch,
            "neutral direction has no contract side".to_string(),
        ),
        _ => {}
    }

    match input.candidate {
        Some(c) if c.passed => {}
        Some(c) => fail(
            GateId::Candidate,
            format!("contract {} did not pass selection", c.symbol),
        ),
        None => fail(GateId::Candidate, "no valid contract selected".to_string()),
    }

    let cost = input.total_cost();
    if cost > input.buying_power || input.quantity == 0 {
        fail(
            GateId::BuyingPower,
            format!(
                "cost ${:.2} for {} contracts exceeds buying power ${:.2}",
                cost, input.quantity, input.buying_power
            ),
        );
    }

    if input.quantity > config.max_contracts {
        fail(
            GateId::QuantityCap,
            format!(
                "quantity {} exceeds max {} contracts",
                input.quantity, config.max_contracts
            ),
        );
    }

    let loss_limit = input.equity * config.daily_loss_limit_pct;
    if input.realized_pnl_today < 0.0 && -input.realized_pnl_today > loss_limit {
        fail(
            GateId::DailyLoss,
            format!(
                "realized loss ${:.2} today exceeds limit ${:.2}",
                -input.realized_pnl_today, loss_limit
            ),
        );
    }

    GateResult {
        passed: failures.is_empty(),
        failures,
    }
}
