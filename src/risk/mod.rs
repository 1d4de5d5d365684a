//! Risk Module
//!
//! Pure pre-trade functions:
//! - Conviction sizing (score -> tier -> bounded contract count)
//! - Safety gates (every failed check reported, fail-closed)

pub mod gates;
pub mod sizing;

pub use gates::{evaluate_gates, GateFailure, GateId, GateInput, GateResult};
pub use sizing::{size_position, ConvictionTier, SizingInput, SizingResult};

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::agent::expiry::eastern_day_start;
use crate::config::{GateConfig, SizingConfig};
use crate::store::{PositionStore, StoreResult};
use crate::utils::types::{Direction, OptionCandidate};

/// Account snapshot used for a pre-trade screen
#[derive(Debug, Clone, Copy)]
pub struct AccountState {
    pub equity: f64,
    pub buying_power: f64,
    pub realized_pnl_today: f64,
}

impl AccountState {
    /// Broker balances plus the P&L realized since midnight US/Eastern,
    /// partial reductions included
    pub async fn load(
        store: &dyn PositionStore,
        equity: f64,
        buying_power: f64,
        now: DateTime<Utc>,
    ) -> StoreResult<Self> {
        let realized_pnl_today = store.realized_pnl_since(eastern_day_start(now)).await?;
        Ok(Self {
            equity,
            buying_power,
            realized_pnl_today,
        })
    }
}

/// Size a candidate and run every gate against the sized order.
///
/// Returns the sizing when all gates pass, otherwise the complete gate result.
#[allow(clippy::too_many_arguments)]
pub fn screen_entry(
    sizing_config: &SizingConfig,
    gate_config: &GateConfig,
    market_open: bool,
    confidence: f64,
    direction: Direction,
    conviction_score: f64,
    candidate: Option<&OptionCandidate>,
    account: AccountState,
) -> Result<SizingResult, GateResult> {
    let limit_price = candidate.map(|c| c.ask).unwrap_or(0.0);
    let sizing = size_position(
        sizing_config,
        &SizingInput {
            conviction_score,
            equity: account.equity,
            buying_power: account.buying_power,
            entry_price: limit_price,
            stop_price: candidate.map(|c| c.stop_price).unwrap_or(0.0),
        },
    );

    let gates = evaluate_gates(
        gate_config,
        &GateInput {
            market_open,
            confidence,
            direction,
            candidate,
            equity: account.equity,
            buying_power: account.buying_power,
            realized_pnl_today: account.realized_pnl_today,
            quantity: sizing.quantity,
            limit_price,
        },
    );

    if gates.passed {
        info!(
            "Entry cleared: {} contracts @ ${:.2} ({})",
            sizing.quantity, sizing.limit_price, sizing.tier
        );
        Ok(sizing)
    } else {
        warn!("Entry blocked by {} gate(s): {}", gates.failures.len(), gates.summary());
        crate::telemetry::metrics::record_gate_rejections(&gates);
        Err(gates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::types::OptionSide;
    use chrono::NaiveDate;

    fn candidate() -> OptionCandidate {
        OptionCandidate {
            symbol: "QQQ250620P00450000".to_string(),
            side: OptionSide::Put,
            strike: 450.0,
            expiration: NaiveDate::from_ymd_opt(2025, 6, 20).unwrap(),
            bid: 1.95,
            ask: 2.0,
            spread_pct: 2.5,
            stop_price: 1.5,
            take_profit_price: 3.0,
            risk_reward: 2.0,
            passed: true,
        }
    }

    #[test]
    fn test_screen_passes_and_sizes() {
        let account = AccountState {
            equity: 50_000.0,
            buying_power: 50_000.0,
            realized_pnl_today: 0.0,
        };
        let c = candidate();
        let gates = GateConfig {
            max_spread_pct: 3.0,
            ..Default::default()
        };
        let sizing = screen_entry(
            &SizingConfig::default(),
            &gates,
            true,
            0.8,
            Direction::Bearish,
            8.0,
            Some(&c),
            account,
        )
        .unwrap();
        assert_eq!(sizing.quantity, 5);
        assert_eq!(sizing.limit_price, 2.0);
    }

    #[test]
    fn test_screen_reports_every_failure() {
        let account = AccountState {
            equity: 50_000.0,
            buying_power: 50_000.0,
            realized_pnl_today: 0.0,
        };
        let c = candidate();
        let err = screen_entry(
            &SizingConfig::default(),
            &GateConfig::default(),
            false,
            0.8,
            Direction::Bearish,
            8.0,
            Some(&c),
            account,
        )
        .unwrap_err();
        assert_eq!(err.failed_gates(), vec![GateId::Time, GateId::Liquidity]);
    }
}
