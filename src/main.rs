//! Options Pilot
//!
//! Runs the position agents for single-leg option trades:
//! - Restores an agent for every open position on start
//! - Ticks each agent on its own task until Ctrl-C
//! - Emergency close of all (or one ticker's) positions from the CLI

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

use options_pilot::agent::AgentDeps;
use options_pilot::agentic::{AiAdvisor, HoldAdvisor, HttpAdvisor, PerformanceDb};
use options_pilot::config::AppConfig;
use options_pilot::events::{spawn_event_handler, EventBus};
use options_pilot::execution::paper::{PaperBroker, PaperConfig};
use options_pilot::position::PositionRegistry;
use options_pilot::store::{MemoryStore, PositionStore};
use options_pilot::telemetry::{init_logging, init_metrics, metrics, AlertManager};

/// Options Pilot - autonomous option position agents
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Enable paper trading mode (no real orders)
    #[arg(long)]
    paper: bool,

    /// Override log level
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Restore open positions and run until interrupted (default)
    Run,
    /// Close every open position, or only one ticker's
    CloseAll {
        #[arg(long)]
        ticker: Option<String>,
        #[arg(long, default_value = "MANUAL_CLOSE_ALL")]
        reason: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Load configuration
    let mut config = AppConfig::load(&args.config)?;

    // Apply CLI overrides
    if args.paper {
        config.paper_trading = true;
    }
    if let Some(level) = args.log_level {
        config.telemetry.log_level = level;
    }

    // Initialize logging; the guard flushes the log file on exit
    let _log_guard = init_logging(&config.telemetry)?;

    info!("Starting Options Pilot v{}", env!("CARGO_PKG_VERSION"));
    info!("Paper trading: {}", config.paper_trading);

    anyhow::ensure!(
        config.paper_trading,
        "no live broker is configured; run with --paper or set paper_trading: true"
    );

    if config.telemetry.enable_metrics {
        init_metrics(config.telemetry.metrics_port)?;
    }

    let registry = build_registry(&config).await?;

    match args.command.unwrap_or(Command::Run) {
        Command::Run => run(registry).await,
        Command::CloseAll { ticker, reason } => {
            let report = registry.close_all_positions(&reason, ticker.as_deref()).await;
            info!(
                "Close-all done: {} notified, {} closed in store, {} order(s) canceled, {} error(s)",
                report.notified,
                report.fallback_closed,
                report.orders_canceled,
                report.errors.len()
            );
            registry.shutdown_all();
            Ok(())
        }
    }
}

async fn build_registry(config: &AppConfig) -> Result<PositionRegistry> {
    let store: Arc<dyn PositionStore> = match &config.persistence.snapshot_path {
        Some(path) => Arc::new(
            MemoryStore::open(path)
                .await
                .with_context(|| format!("Failed to open position snapshot {}", path))?,
        ),
        None => {
            warn!("No snapshot_path configured, positions will not survive a restart");
            Arc::new(MemoryStore::new())
        }
    };

    let advisor: Arc<dyn AiAdvisor> = match HttpAdvisor::from_config(&config.advisor)? {
        Some(advisor) => Arc::new(advisor),
        None => {
            info!("No advisor endpoint configured, AI arbitration always holds");
            Arc::new(HoldAdvisor)
        }
    };

    let evaluator = PerformanceDb::new(&config.persistence.performance_db_path).await?;

    let events = EventBus::default();
    spawn_event_handler(&events, "metrics", |event| async move {
        metrics::record_event(&event);
    });

    let deps = AgentDeps {
        broker: Arc::new(PaperBroker::new(PaperConfig::default())),
        store,
        advisor,
        notifier: Arc::new(AlertManager::new(&config.telemetry)),
        evaluator: Arc::new(evaluator),
        events,
        agent: config.agent.clone(),
        market: config.market.clone(),
    };

    Ok(PositionRegistry::new(deps, config.registry.max_positions_per_ticker))
}

async fn run(registry: PositionRegistry) -> Result<()> {
    let report = registry.restore_from_db().await;
    for e in &report.errors {
        warn!("Restore: {}", e);
    }
    info!("{} agent(s) active", registry.active_count());

    // Wait for shutdown signal
    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Shutdown signal received, stopping agents...");
        }
        Err(err) => {
            error!("Error listening for shutdown signal: {}", err);
        }
    }

    // Open rows stay OPEN and are restored on the next start
    registry.shutdown_all();
    info!("Options Pilot stopped");
    Ok(())
}
