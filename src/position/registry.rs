//! Position Registry
//!
//! Owns every live position agent, keyed by position id. Agents are
//! registered before their entry order goes out, so the per-ticker cap,
//! broadcasts and the agent-less fallback close all see entries that are
//! still starting. Also restores agents after a restart and performs the
//! emergency close.

use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Weak};
use thiserror::Error;
use tracing::{error, info, warn};

use super::{Position, PositionUpdate};
use crate::agent::{AgentDeps, AgentStatus, Deregister, PositionAgent, PositionPhase};
use crate::telemetry::metrics;
use crate::utils::types::{OrchestratorSuggestion, SuggestionKind, Urgency};

pub use crate::agent::EntryRequest;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum RegistryError {
    #[error("{ticker} already has {open} of {cap} positions")]
    TickerCapReached {
        ticker: String,
        open: usize,
        cap: usize,
    },
    #[error("invalid entry request: {0}")]
    InvalidRequest(String),
    #[error("entry for {ticker} failed: {reason}")]
    EntryFailed { ticker: String, reason: String },
}

/// Result of an orchestrator broadcast
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NotifyOutcome {
    /// Agents the suggestion was delivered to
    pub delivered: usize,
    /// OPEN rows closed directly because no agent was running for them
    pub fallback_closed: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RestoreReport {
    pub restored: usize,
    pub skipped: usize,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CloseAllReport {
    pub notified: usize,
    pub fallback_closed: usize,
    pub orders_canceled: usize,
    pub errors: Vec<String>,
}

type AgentMap = DashMap<String, Arc<PositionAgent>>;

pub struct PositionRegistry {
    agents: Arc<AgentMap>,
    /// Held across the cap check and the insert that claims the slot
    admission: Mutex<()>,
    deps: AgentDeps,
    max_per_ticker: usize,
}

/// Agent registered ahead of its entry; unregistered on drop unless kept
struct Admission<'a> {
    agents: &'a AgentMap,
    position_id: String,
    kept: bool,
}

impl Admission<'_> {
    fn keep(mut self) {
        self.kept = true;
    }
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        if !self.kept {
            self.agents.remove(&self.position_id);
        }
    }
}

impl PositionRegistry {
    pub fn new(deps: AgentDeps, max_per_ticker: usize) -> Self {
        Self {
            agents: Arc::new(DashMap::new()),
            admission: Mutex::new(()),
            deps,
            max_per_ticker,
        }
    }

    /// Create an agent for a sized entry and start it.
    ///
    /// The cap is checked and the agent registered before any broker call.
    /// Suggestions that arrive while the entry is starting queue behind it
    /// on the agent. An agent whose entry fails is unregistered.
    pub async fn create_and_start(&self, request: EntryRequest) -> Result<String, RegistryError> {
        validate_request(&request)?;
        let ticker = request.ticker().to_string();

        let agent = PositionAgent::new(request, self.deps.clone(), self.deregister_fn());
        let admission = self.admit(&agent)?;
        let phase = agent.start().await;

        if phase == PositionPhase::Failed {
            let reason = agent
                .last_transition_reason()
                .unwrap_or_else(|| "entry failed".to_string());
            drop(admission);
            metrics::record_active_agents(self.agents.len());
            return Err(RegistryError::EntryFailed { ticker, reason });
        }

        let position_id = agent.position_id().to_string();
        admission.keep();
        // Closed by a suggestion delivered while starting
        if agent.phase().is_terminal() {
            self.remove(&position_id);
        }

        info!("Agent registered: {} {} ({})", ticker, agent.option_symbol(), position_id);
        metrics::record_active_agents(self.agents.len());
        Ok(position_id)
    }

    fn admit(&self, agent: &Arc<PositionAgent>) -> Result<Admission<'_>, RegistryError> {
        let _admission = self.admission.lock();
        let ticker = agent.ticker();
        let open = self.agents_for_ticker(ticker).len();

        if open >= self.max_per_ticker {
            warn!(
                "Entry for {} rejected: {} open or starting, cap {}",
                ticker, open, self.max_per_ticker
            );
            return Err(RegistryError::TickerCapReached {
                ticker: ticker.to_string(),
                open,
                cap: self.max_per_ticker,
            });
        }

        let position_id = agent.position_id().to_string();
        self.agents.insert(position_id.clone(), Arc::clone(agent));
        Ok(Admission {
            agents: &self.agents,
            position_id,
            kept: false,
        })
    }

    fn deregister_fn(&self) -> Deregister {
        let agents: Weak<AgentMap> = Arc::downgrade(&self.agents);
        Arc::new(move |position_id: &str| {
            if let Some(agents) = agents.upgrade() {
                if agents.remove(position_id).is_some() {
                    metrics::record_active_agents(agents.len());
                }
            }
        })
    }

    pub async fn notify_exit(&self, ticker: &str, reason: &str, urgency: Urgency) -> NotifyOutcome {
        self.broadcast(ticker, OrchestratorSuggestion::exit(reason, urgency))
            .await
    }

    pub async fn notify_reduce(&self, ticker: &str, reason: &str, urgency: Urgency) -> NotifyOutcome {
        self.broadcast(ticker, OrchestratorSuggestion::reduce(reason, urgency))
            .await
    }

    /// Deliver a suggestion to every live agent of a ticker and wait for all
    /// of them. With no live agent the ticker's OPEN rows are closed directly.
    async fn broadcast(&self, ticker: &str, suggestion: OrchestratorSuggestion) -> NotifyOutcome {
        let targets: Vec<_> = self
            .agents_for_ticker(ticker)
            .into_iter()
            .filter(|a| a.phase().is_live())
            .collect();

        if targets.is_empty() {
            let fallback_reason = match suggestion.kind {
                SuggestionKind::Exit => suggestion.reason.clone(),
                SuggestionKind::ReduceExposure => format!("{} (reduce)", suggestion.reason),
            };
            let (fallback_closed, errors) = self.fallback_close(Some(ticker), &fallback_reason).await;
            for e in errors {
                error!("{}", e);
            }
            return NotifyOutcome {
                delivered: 0,
                fallback_closed,
            };
        }

        info!(
            "Broadcasting {} ({}) to {} agent(s) on {}",
            suggestion.kind,
            suggestion.urgency,
            targets.len(),
            ticker
        );
        join_all(
            targets
                .iter()
                .map(|agent| agent.process_orchestrator_decision(&suggestion)),
        )
        .await;

        NotifyOutcome {
            delivered: targets.len(),
            fallback_closed: 0,
        }
    }

    /// Close OPEN rows that no registered agent owns, including agents still
    /// submitting their entry. Returns the number of rows closed and the
    /// errors met.
    async fn fallback_close(&self, ticker: Option<&str>, reason: &str) -> (usize, Vec<String>) {
        let rows = match self.deps.store.list_open_positions(ticker).await {
            Ok(rows) => rows,
            Err(e) => return (0, vec![format!("open positions unavailable: {}", e)]),
        };

        let mut closed = 0;
        let mut errors = Vec::new();
        for row in rows.iter().filter(|r| !self.agents.contains_key(&r.id)) {
            let update = PositionUpdate::close(
                format!("FALLBACK_CLOSE: {}", reason),
                None,
                row.realized_pnl,
            );
            match self.deps.store.update_position(&row.id, &update).await {
                Ok(_) => {
                    warn!(
                        "No agent for {} {} ({}), closed in store",
                        row.ticker, row.option_symbol, row.id
                    );
                    closed += 1;
                }
                Err(e) => errors.push(format!("fallback close of {} failed: {}", row.id, e)),
            }
        }
        (closed, errors)
    }

    /// Rebuild agents for every OPEN row. Per-row problems are reported and
    /// skipped; the cap does not apply to positions that already exist.
    pub async fn restore_from_db(&self) -> RestoreReport {
        let mut report = RestoreReport::default();

        let rows = match self.deps.store.list_open_positions(None).await {
            Ok(rows) => rows,
            Err(e) => {
                error!("Restore aborted, open positions unavailable: {}", e);
                report.errors.push(e.to_string());
                return report;
            }
        };
        if rows.is_empty() {
            info!("No open positions to restore");
            return report;
        }

        let decision_ids: Vec<String> = rows
            .iter()
            .map(|r| r.decision_id.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        let mut decisions = self
            .deps
            .store
            .get_decisions(&decision_ids)
            .await
            .unwrap_or_else(|e| {
                warn!("Decisions unavailable during restore: {}", e);
                HashMap::new()
            });

        for row in rows {
            if self.agents.contains_key(&row.id) {
                report.skipped += 1;
                continue;
            }
            if let Err(reason) = restorable(&row) {
                warn!("Skipping restore of {}: {}", row.id, reason);
                report.errors.push(format!("{}: {}", row.id, reason));
                report.skipped += 1;
                continue;
            }

            let decision = decisions.remove(&row.decision_id).or_else(|| {
                warn!("Decision {} missing for {}, synthesizing", row.decision_id, row.id);
                None
            });
            let request = EntryRequest::from_position(&row, decision);
            let agent = PositionAgent::restored(&row, request, self.deps.clone(), self.deregister_fn());

            self.agents.insert(row.id.clone(), Arc::clone(&agent));
            let phase = agent.start_restored().await;
            if phase.is_terminal() {
                self.remove(&row.id);
            }
            report.restored += 1;
        }

        info!(
            "Restore complete: {} restored, {} skipped, {} error(s)",
            report.restored,
            report.skipped,
            report.errors.len()
        );
        metrics::record_active_agents(self.agents.len());
        report
    }

    /// Emergency close: immediate exit for every live agent, direct close of
    /// agent-less rows, then cancel broker orders. Never fails.
    pub async fn close_all_positions(&self, reason: &str, ticker: Option<&str>) -> CloseAllReport {
        let mut report = CloseAllReport::default();
        let suggestion = OrchestratorSuggestion::exit(reason, Urgency::Immediate);

        let targets: Vec<_> = self
            .agents
            .iter()
            .filter(|e| ticker.map_or(true, |t| e.value().ticker() == t))
            .map(|e| Arc::clone(e.value()))
            .collect();

        // Orders are keyed by option symbol; collect the ticker's symbols
        // before the exits close their rows
        let scoped_symbols = match ticker {
            Some(t) => Some(self.symbols_for_ticker(t, &targets, &mut report.errors).await),
            None => None,
        };

        let live: Vec<_> = targets.into_iter().filter(|a| a.phase().is_live()).collect();
        report.notified = live.len();

        warn!(
            "Closing all positions{}: {} live agent(s), reason {}",
            ticker.map(|t| format!(" on {}", t)).unwrap_or_default(),
            live.len(),
            reason
        );
        join_all(
            live.iter()
                .map(|agent| agent.process_orchestrator_decision(&suggestion)),
        )
        .await;

        let (fallback_closed, errors) = self.fallback_close(ticker, reason).await;
        report.fallback_closed = fallback_closed;
        report.errors.extend(errors);

        match scoped_symbols {
            None => match self.deps.broker.cancel_open_orders(None).await {
                Ok(n) => report.orders_canceled = n,
                Err(e) => report.errors.push(format!("order cancel failed: {}", e)),
            },
            Some(symbols) => {
                for symbol in symbols {
                    match self.deps.broker.cancel_open_orders(Some(&symbol)).await {
                        Ok(n) => report.orders_canceled += n,
                        Err(e) => report
                            .errors
                            .push(format!("order cancel for {} failed: {}", symbol, e)),
                    }
                }
            }
        }

        for e in &report.errors {
            error!("close-all: {}", e);
        }
        report
    }

    async fn symbols_for_ticker(
        &self,
        ticker: &str,
        agents: &[Arc<PositionAgent>],
        errors: &mut Vec<String>,
    ) -> BTreeSet<String> {
        let mut symbols: BTreeSet<String> =
            agents.iter().map(|a| a.option_symbol().to_string()).collect();
        match self.deps.store.list_open_positions(Some(ticker)).await {
            Ok(rows) => symbols.extend(rows.into_iter().map(|r| r.option_symbol)),
            Err(e) => errors.push(format!("open positions for {} unavailable: {}", ticker, e)),
        }
        symbols
    }

    /// Hard-stop every agent and forget them. Persisted rows are untouched.
    pub fn shutdown_all(&self) {
        let count = self.agents.len();
        for entry in self.agents.iter() {
            entry.value().shutdown();
        }
        self.agents.clear();
        metrics::record_active_agents(0);
        info!("Shut down {} agent(s)", count);
    }

    /// Drop an agent from the registry; `false` when it was not registered
    pub fn remove(&self, position_id: &str) -> bool {
        let removed = self.agents.remove(position_id).is_some();
        if removed {
            metrics::record_active_agents(self.agents.len());
        }
        removed
    }

    pub fn active_count(&self) -> usize {
        self.agents.len()
    }

    pub fn agents_for_ticker(&self, ticker: &str) -> Vec<Arc<PositionAgent>> {
        self.agents
            .iter()
            .filter(|e| e.value().ticker() == ticker)
            .map(|e| Arc::clone(e.value()))
            .collect()
    }

    pub fn get(&self, position_id: &str) -> Option<Arc<PositionAgent>> {
        self.agents.get(position_id).map(|e| Arc::clone(e.value()))
    }

    pub fn statuses(&self) -> Vec<AgentStatus> {
        let mut statuses: Vec<_> = self.agents.iter().map(|e| e.value().status()).collect();
        statuses.sort_by(|a, b| a.opened_at.cmp(&b.opened_at));
        statuses
    }
}

fn validate_request(request: &EntryRequest) -> Result<(), RegistryError> {
    if request.ticker().trim().is_empty() {
        return Err(RegistryError::InvalidRequest("empty ticker".to_string()));
    }
    if request.candidate.symbol.trim().is_empty() {
        return Err(RegistryError::InvalidRequest("empty option symbol".to_string()));
    }
    if request.sizing.quantity == 0 {
        return Err(RegistryError::InvalidRequest("quantity must be positive".to_string()));
    }
    if !(request.sizing.limit_price > 0.0) {
        return Err(RegistryError::InvalidRequest("limit price must be positive".to_string()));
    }
    Ok(())
}

fn restorable(row: &Position) -> Result<(), String> {
    if row.quantity == 0 {
        return Err("zero quantity".to_string());
    }
    if row.option_symbol.trim().is_empty() {
        return Err("missing option symbol".to_string());
    }
    Ok(())
}
