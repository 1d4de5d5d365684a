//! Configuration module
//!
//! Handles loading and validation of the application configuration.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub gates: GateConfig,
    #[serde(default)]
    pub sizing: SizingConfig,
    #[serde(default)]
    pub market: MarketConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub advisor: AdvisorConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub paper_trading: bool,
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config = Self::from_yaml(&content)?;
        info!("Configuration loaded from {:?}", path);
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content)
            .with_context(|| "Failed to parse config file")?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.agent.tick_interval_secs > 0,
            "tick_interval_secs must be positive"
        );
        anyhow::ensure!(
            self.agent.ai_review_every_ticks > 0,
            "ai_review_every_ticks must be positive"
        );
        anyhow::ensure!(
            self.market.expiry_warning_minutes > self.market.expiry_force_close_minutes,
            "expiry_warning_minutes must be greater than expiry_force_close_minutes"
        );
        anyhow::ensure!(
            self.market.close_hour_et < 24 && self.market.close_minute_et < 60,
            "market close must be a valid wall-clock time"
        );
        anyhow::ensure!(
            self.registry.max_positions_per_ticker > 0,
            "max_positions_per_ticker must be positive"
        );
        anyhow::ensure!(
            self.sizing.max_risk_pct > 0.0 && self.sizing.max_risk_pct <= 0.1,
            "max_risk_pct must be between 0 and 0.1"
        );
        anyhow::ensure!(
            self.sizing.max_contracts > 0,
            "max_contracts must be positive"
        );
        anyhow::ensure!(
            self.gates.daily_loss_limit_pct > 0.0 && self.gates.daily_loss_limit_pct <= 1.0,
            "daily_loss_limit_pct must be between 0 and 1"
        );
        anyhow::ensure!(
            (0.0..=1.0).contains(&self.gates.min_confidence),
            "min_confidence must be between 0 and 1"
        );
        Ok(())
    }
}

/// Position agent timing and arbitration settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,
    /// Run AI arbitration on every N-th quiet tick
    #[serde(default = "default_ai_review_every")]
    pub ai_review_every_ticks: u64,
    #[serde(default = "default_fill_poll_attempts")]
    pub fill_poll_attempts: u32,
    #[serde(default = "default_fill_poll_interval")]
    pub fill_poll_interval_ms: u64,
    #[serde(default = "default_context_depth")]
    pub recent_ticks_in_context: usize,
    #[serde(default = "default_context_depth")]
    pub recent_outcomes_in_context: usize,
    /// Retries for the final close write once the broker sell is confirmed
    #[serde(default = "default_close_write_retries")]
    pub close_write_retries: u32,
}

fn default_tick_interval() -> u64 { 30 }
fn default_ai_review_every() -> u64 { 5 }
fn default_fill_poll_attempts() -> u32 { 5 }
fn default_fill_poll_interval() -> u64 { 3000 }
fn default_context_depth() -> usize { 5 }
fn default_close_write_retries() -> u32 { 3 }

impl AgentConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    pub fn fill_poll_interval(&self) -> Duration {
        Duration::from_millis(self.fill_poll_interval_ms)
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval(),
            ai_review_every_ticks: default_ai_review_every(),
            fill_poll_attempts: default_fill_poll_attempts(),
            fill_poll_interval_ms: default_fill_poll_interval(),
            recent_ticks_in_context: default_context_depth(),
            recent_outcomes_in_context: default_context_depth(),
            close_write_retries: default_close_write_retries(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(default = "default_max_per_ticker")]
    pub max_positions_per_ticker: usize,
}

fn default_max_per_ticker() -> usize { 2 }

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_positions_per_ticker: default_max_per_ticker(),
        }
    }
}

/// Pre-trade safety gate thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    /// Maximum bid/ask spread, in percent of mid
    #[serde(default = "default_max_spread_pct")]
    pub max_spread_pct: f64,
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
    #[serde(default = "default_min_risk_reward")]
    pub min_risk_reward: f64,
    #[serde(default = "default_max_contracts")]
    pub max_contracts: u32,
    /// Fraction of equity that today's realized loss may reach
    #[serde(default = "default_daily_loss_limit")]
    pub daily_loss_limit_pct: f64,
}

fn default_max_spread_pct() -> f64 { 2.0 }
fn default_min_confidence() -> f64 { 0.65 }
fn default_min_risk_reward() -> f64 { 1.5 }
fn default_max_contracts() -> u32 { 5 }
fn default_daily_loss_limit() -> f64 { 0.02 }

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            max_spread_pct: default_max_spread_pct(),
            min_confidence: default_min_confidence(),
            min_risk_reward: default_min_risk_reward(),
            max_contracts: default_max_contracts(),
            daily_loss_limit_pct: default_daily_loss_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SizingConfig {
    /// Fraction of equity risked per trade before the tier multiplier
    #[serde(default = "default_max_risk_pct")]
    pub max_risk_pct: f64,
    #[serde(default = "default_max_contracts")]
    pub max_contracts: u32,
    #[serde(default = "default_sizable_threshold")]
    pub sizable_threshold: f64,
    #[serde(default = "default_max_conviction_threshold")]
    pub max_conviction_threshold: f64,
    #[serde(default = "default_regular_multiplier")]
    pub regular_multiplier: f64,
    #[serde(default = "default_sizable_multiplier")]
    pub sizable_multiplier: f64,
    #[serde(default = "default_max_conviction_multiplier")]
    pub max_conviction_multiplier: f64,
}

fn default_max_risk_pct() -> f64 { 0.005 }
fn default_sizable_threshold() -> f64 { 5.0 }
fn default_max_conviction_threshold() -> f64 { 7.0 }
fn default_regular_multiplier() -> f64 { 1.0 }
fn default_sizable_multiplier() -> f64 { 1.5 }
fn default_max_conviction_multiplier() -> f64 { 2.0 }

impl Default for SizingConfig {
    fn default() -> Self {
        Self {
            max_risk_pct: default_max_risk_pct(),
            max_contracts: default_max_contracts(),
            sizable_threshold: default_sizable_threshold(),
            max_conviction_threshold: default_max_conviction_threshold(),
            regular_multiplier: default_regular_multiplier(),
            sizable_multiplier: default_sizable_multiplier(),
            max_conviction_multiplier: default_max_conviction_multiplier(),
        }
    }
}

/// Market session settings used by the expiry guard
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketConfig {
    /// Regular session close, US/Eastern wall clock
    #[serde(default = "default_close_hour")]
    pub close_hour_et: u32,
    #[serde(default)]
    pub close_minute_et: u32,
    #[serde(default = "default_expiry_warning")]
    pub expiry_warning_minutes: i64,
    #[serde(default = "default_expiry_force_close")]
    pub expiry_force_close_minutes: i64,
}

fn default_close_hour() -> u32 { 16 }
fn default_expiry_warning() -> i64 { 30 }
fn default_expiry_force_close() -> i64 { 15 }

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            close_hour_et: default_close_hour(),
            close_minute_et: 0,
            expiry_warning_minutes: default_expiry_warning(),
            expiry_force_close_minutes: default_expiry_force_close(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// JSON snapshot of the position store; in-memory only when unset
    pub snapshot_path: Option<String>,
    #[serde(default = "default_performance_db_path")]
    pub performance_db_path: String,
}

fn default_performance_db_path() -> String { "data/performance.json".to_string() }

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            snapshot_path: None,
            performance_db_path: default_performance_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdvisorConfig {
    /// HTTP endpoint returning recommendation JSON; advisor always holds when unset
    pub endpoint: Option<String>,
    #[serde(default = "default_advisor_timeout")]
    pub timeout_ms: u64,
}

fn default_advisor_timeout() -> u64 { 20_000 }

impl Default for AdvisorConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            timeout_ms: default_advisor_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub json_logs: bool,
    pub log_file: Option<String>,
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
    #[serde(default)]
    pub enable_metrics: bool,
    #[serde(default)]
    pub enable_alerts: bool,
    pub alert_webhook: Option<String>,
    #[serde(default)]
    pub telegram: TelegramConfig,
}

fn default_log_level() -> String { "info".to_string() }
fn default_metrics_port() -> u16 { 9090 }

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logs: false,
            log_file: None,
            metrics_port: default_metrics_port(),
            enable_metrics: false,
            enable_alerts: false,
            alert_webhook: None,
            telegram: TelegramConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelegramConfig {
    #[serde(default)]
    pub enabled: bool,
    pub bot_token: Option<String>,
    pub chat_id: Option<String>,
}
