//! Performance Database
//!
//! JSON-backed journal of closed option trades:
//! - Stores every trade outcome persistently
//! - Calculates win rate, profit factor, expectancy, drawdown
//! - Breaks performance down by conviction tier
//! - Serves as the post-trade evaluator for position agents

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::{TradeEvaluationInput, TradeEvaluator};
use crate::utils::types::CONTRACT_MULTIPLIER;

/// Trade outcome record
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TradeOutcome {
    /// Position ID
    pub id: String,
    pub ticker: String,
    pub option_symbol: String,
    /// CALL or PUT
    pub side: String,
    /// Open timestamp (ms)
    pub open_time: i64,
    /// Close timestamp (ms)
    pub close_time: i64,
    /// Contracts closed by the final exit
    pub quantity: u32,
    pub entry_price: f64,
    pub exit_price: f64,
    /// Realized P&L including partial reductions
    pub total_pnl: f64,
    /// Return on premium paid (%)
    pub roi_pct: f64,
    pub hold_hours: f64,
    pub is_winner: bool,
    pub close_reason: String,
    pub conviction_tier: String,
    pub entry_confidence: f64,
    pub entry_alignment: String,
    pub entry_direction: String,
}

impl From<&TradeEvaluationInput> for TradeOutcome {
    fn from(t: &TradeEvaluationInput) -> Self {
        let premium = t.entry_price * t.quantity as f64 * CONTRACT_MULTIPLIER;
        let roi_pct = if premium > 0.0 {
            t.realized_pnl / premium * 100.0
        } else {
            0.0
        };
        let hold_hours = (t.closed_at - t.opened_at).num_seconds() as f64 / 3600.0;

        Self {
            id: t.position_id.clone(),
            ticker: t.ticker.clone(),
            option_symbol: t.option_symbol.clone(),
            side: t.side.to_string(),
            open_time: t.opened_at.timestamp_millis(),
            close_time: t.closed_at.timestamp_millis(),
            quantity: t.quantity,
            entry_price: t.entry_price,
            exit_price: t.exit_price,
            total_pnl: t.realized_pnl,
            roi_pct,
            hold_hours,
            is_winner: t.realized_pnl > 0.0,
            close_reason: t.close_reason.clone(),
            conviction_tier: t.conviction_tier.to_string(),
            entry_confidence: t.entry_confidence,
            entry_alignment: t.entry_alignment.clone(),
            entry_direction: t.entry_direction.clone(),
        }
    }
}

/// Performance metrics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub total_trades: u32,
    pub winning_trades: u32,
    pub losing_trades: u32,
    /// Win rate (0-1)
    pub win_rate: f64,
    pub gross_profit: f64,
    pub gross_loss: f64,
    pub net_pnl: f64,
    /// gross_profit / gross_loss
    pub profit_factor: f64,
    pub avg_win: f64,
    pub avg_loss: f64,
    /// Expectancy per trade
    pub expectancy: f64,
    pub avg_hold_hours: f64,
    /// Maximum drawdown of cumulative P&L (%)
    pub max_drawdown_pct: f64,
    pub avg_roi_pct: f64,
    pub best_trade: f64,
    pub worst_trade: f64,
    /// Positive = wins, negative = losses
    pub current_streak: i32,
    pub longest_win_streak: u32,
    pub longest_loss_streak: u32,
}

/// Win rate and average P&L for one conviction tier
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TierPerformance {
    pub trades: u32,
    pub win_rate: f64,
    pub avg_pnl: f64,
}

/// Performance database using JSON file storage
pub struct PerformanceDb {
    /// Journal file path; memory only when `None`
    db_path: Option<String>,
    trades: Arc<RwLock<Vec<TradeOutcome>>>,
    metrics: Arc<RwLock<PerformanceMetrics>>,
}

impl PerformanceDb {
    /// Create or open a performance database
    pub async fn new(db_path: &str) -> Result<Self> {
        let trades = if Path::new(db_path).exists() {
            let content = tokio::fs::read_to_string(db_path)
                .await
                .context("Failed to read performance database")?;
            serde_json::from_str(&content).context("Failed to parse performance database")?
        } else {
            Vec::new()
        };

        let db = Self {
            db_path: Some(db_path.to_string()),
            trades: Arc::new(RwLock::new(trades)),
            metrics: Arc::new(RwLock::new(PerformanceMetrics::default())),
        };
        db.recalculate_metrics().await;

        info!("Performance database loaded: {} trades", db.trades.read().await.len());
        Ok(db)
    }

    pub fn in_memory() -> Self {
        Self {
            db_path: None,
            trades: Arc::new(RwLock::new(Vec::new())),
            metrics: Arc::new(RwLock::new(PerformanceMetrics::default())),
        }
    }

    /// Record a trade outcome
    pub async fn record_trade(&self, trade: TradeOutcome) -> Result<()> {
        {
            let mut trades = self.trades.write().await;
            trades.push(trade.clone());
        }

        self.save().await?;
        self.recalculate_metrics().await;

        info!(
            "Trade recorded: {} {} | P&L: ${:.2} | ROI: {:.2}% | {}",
            trade.ticker, trade.option_symbol, trade.total_pnl, trade.roi_pct, trade.close_reason
        );
        Ok(())
    }

    async fn save(&self) -> Result<()> {
        let Some(path) = &self.db_path else {
            return Ok(());
        };
        let trades = self.trades.read().await;
        let content =
            serde_json::to_string_pretty(&*trades).context("Failed to serialize trades")?;

        if let Some(parent) = Path::new(path).parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .context("Failed to create performance database directory")?;
        }
        tokio::fs::write(path, content)
            .await
            .context("Failed to write performance database")?;

        debug!("Performance database saved");
        Ok(())
    }

    async fn recalculate_metrics(&self) {
        let trades = self.trades.read().await;

        if trades.is_empty() {
            *self.metrics.write().await = PerformanceMetrics::default();
            return;
        }

        let total_trades = trades.len() as u32;
        let winning_trades = trades.iter().filter(|t| t.is_winner).count() as u32;
        let losing_trades = total_trades - winning_trades;
        let win_rate = winning_trades as f64 / total_trades as f64;

        let gross_profit: f64 = trades
            .iter()
            .filter(|t| t.total_pnl > 0.0)
            .map(|t| t.total_pnl)
            .sum();
        let gross_loss: f64 = trades
            .iter()
            .filter(|t| t.total_pnl < 0.0)
            .map(|t| t.total_pnl.abs())
            .sum();
        let net_pnl: f64 = trades.iter().map(|t| t.total_pnl).sum();

        let profit_factor = if gross_loss > 0.0 {
            gross_profit / gross_loss
        } else if gross_profit > 0.0 {
            f64::INFINITY
        } else {
            0.0
        };

        let avg_win = if winning_trades > 0 {
            gross_profit / winning_trades as f64
        } else {
            0.0
        };
        let avg_loss = if losing_trades > 0 {
            gross_loss / losing_trades as f64
        } else {
            0.0
        };

        // Expectancy = (Win% × Avg Win) - (Loss% × Avg Loss)
        let expectancy = (win_rate * avg_win) - ((1.0 - win_rate) * avg_loss);

        let avg_hold_hours = trades.iter().map(|t| t.hold_hours).sum::<f64>() / total_trades as f64;
        let avg_roi_pct = trades.iter().map(|t| t.roi_pct).sum::<f64>() / total_trades as f64;
        let best_trade = trades.iter().map(|t| t.total_pnl).fold(f64::NEG_INFINITY, f64::max);
        let worst_trade = trades.iter().map(|t| t.total_pnl).fold(f64::INFINITY, f64::min);

        let max_drawdown_pct = Self::calculate_max_drawdown(&trades);
        let (current_streak, longest_win, longest_loss) = Self::calculate_streaks(&trades);

        *self.metrics.write().await = PerformanceMetrics {
            total_trades,
            winning_trades,
            losing_trades,
            win_rate,
            gross_profit,
            gross_loss,
            net_pnl,
            profit_factor,
            avg_win,
            avg_loss,
            expectancy,
            avg_hold_hours,
            max_drawdown_pct,
            avg_roi_pct,
            best_trade,
            worst_trade,
            current_streak,
            longest_win_streak: longest_win,
            longest_loss_streak: longest_loss,
        };
    }

    fn calculate_max_drawdown(trades: &[TradeOutcome]) -> f64 {
        let mut peak = 0.0_f64;
        let mut max_dd = 0.0_f64;
        let mut cumulative = 0.0;

        for trade in trades {
            cumulative += trade.total_pnl;
            peak = peak.max(cumulative);
            if peak > 0.0 {
                max_dd = max_dd.max((peak - cumulative) / peak * 100.0);
            }
        }

        max_dd
    }

    fn calculate_streaks(trades: &[TradeOutcome]) -> (i32, u32, u32) {
        let mut longest_win: u32 = 0;
        let mut longest_loss: u32 = 0;
        let mut current_win: u32 = 0;
        let mut current_loss: u32 = 0;

        for trade in trades {
            if trade.is_winner {
                current_win += 1;
                current_loss = 0;
                longest_win = longest_win.max(current_win);
            } else {
                current_loss += 1;
                current_win = 0;
                longest_loss = longest_loss.max(current_loss);
            }
        }

        let current_streak = match trades.last() {
            Some(last) if last.is_winner => current_win as i32,
            Some(_) => -(current_loss as i32),
            None => 0,
        };

        (current_streak, longest_win, longest_loss)
    }

    pub async fn get_metrics(&self) -> PerformanceMetrics {
        self.metrics.read().await.clone()
    }

    /// Win rate of the last `n` trades for a ticker, 0.5 without history
    pub async fn get_recent_win_rate(&self, ticker: &str, n: usize) -> f64 {
        let trades = self.trades.read().await;
        let recent: Vec<_> = trades.iter().rev().filter(|t| t.ticker == ticker).take(n).collect();

        if recent.is_empty() {
            return 0.5;
        }
        recent.iter().filter(|t| t.is_winner).count() as f64 / recent.len() as f64
    }

    pub async fn get_recent_trades(&self, n: usize) -> Vec<TradeOutcome> {
        let trades = self.trades.read().await;
        trades.iter().rev().take(n).cloned().collect()
    }

    /// Performance keyed by conviction tier label
    pub async fn get_performance_by_tier(&self) -> HashMap<String, TierPerformance> {
        let trades = self.trades.read().await;
        let mut grouped: HashMap<String, Vec<&TradeOutcome>> = HashMap::new();
        for t in trades.iter() {
            grouped.entry(t.conviction_tier.clone()).or_default().push(t);
        }

        grouped
            .into_iter()
            .map(|(tier, trades)| {
                let n = trades.len() as f64;
                let wins = trades.iter().filter(|t| t.is_winner).count() as f64;
                let perf = TierPerformance {
                    trades: trades.len() as u32,
                    win_rate: wins / n,
                    avg_pnl: trades.iter().map(|t| t.total_pnl).sum::<f64>() / n,
                };
                (tier, perf)
            })
            .collect()
    }
}

#[async_trait]
impl TradeEvaluator for PerformanceDb {
    async fn evaluate(&self, trade: &TradeEvaluationInput) -> Result<()> {
        self.record_trade(TradeOutcome::from(trade)).await
    }
}
