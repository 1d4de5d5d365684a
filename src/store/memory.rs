//! In-memory position store
//!
//! `DashMap`-backed tables with an optional JSON snapshot. When a snapshot
//! path is configured every mutation rewrites the file, and `open` loads it
//! back, so open positions survive a process restart.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{PositionStore, StoreError, StoreResult};
use crate::position::{AgentTick, OrderRecord, Position, PositionStatus, PositionUpdate};
use crate::utils::types::{OptionSide, TradeDecision};

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    positions: Vec<Position>,
    orders: Vec<OrderRecord>,
    ticks: Vec<AgentTick>,
    decisions: Vec<TradeDecision>,
}

pub struct MemoryStore {
    positions: DashMap<String, Position>,
    /// Orders keyed by position id, in insertion order
    orders: DashMap<String, Vec<OrderRecord>>,
    /// Agent ticks keyed by position id, in insertion order
    ticks: DashMap<String, Vec<AgentTick>>,
    decisions: DashMap<String, TradeDecision>,
    snapshot_path: Option<PathBuf>,
    save_lock: Mutex<()>,
    failing_updates: AtomicU32,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Purely in-memory store
    pub fn new() -> Self {
        Self {
            positions: DashMap::new(),
            orders: DashMap::new(),
            ticks: DashMap::new(),
            decisions: DashMap::new(),
            snapshot_path: None,
            save_lock: Mutex::new(()),
            failing_updates: AtomicU32::new(0),
        }
    }

    /// Store backed by a JSON snapshot, loaded when the file exists
    pub async fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let mut store = Self::new();

        if path.exists() {
            let content = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| StoreError::Io(e.to_string()))?;
            let snapshot: Snapshot = serde_json::from_str(&content)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;

            for p in snapshot.positions {
                store.positions.insert(p.id.clone(), p);
            }
            for o in snapshot.orders {
                store.orders.entry(o.position_id.clone()).or_default().push(o);
            }
            for t in snapshot.ticks {
                store.ticks.entry(t.position_id.clone()).or_default().push(t);
            }
            for d in snapshot.decisions {
                store.decisions.insert(d.id.clone(), d);
            }
            info!(
                "Position store loaded from {:?}: {} positions ({} open)",
                path,
                store.positions.len(),
                store.positions.iter().filter(|p| p.is_open()).count()
            );
        }

        store.snapshot_path = Some(path);
        Ok(store)
    }

    /// Make the next `count` position updates fail as unavailable
    pub fn fail_next_updates(&self, count: u32) {
        self.failing_updates.store(count, Ordering::SeqCst);
    }

    /// Overwrite a row as stored, bypassing the update path
    pub fn put_position(&self, position: Position) {
        self.positions.insert(position.id.clone(), position);
    }

    pub fn position_count(&self) -> usize {
        self.positions.len()
    }

    /// All agent ticks for a position, oldest first
    pub fn ticks_for(&self, position_id: &str) -> Vec<AgentTick> {
        self.ticks
            .get(position_id)
            .map(|t| t.clone())
            .unwrap_or_default()
    }

    async fn persist(&self) -> StoreResult<()> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };
        let _guard = self.save_lock.lock().await;

        let snapshot = Snapshot {
            positions: self.positions.iter().map(|p| p.clone()).collect(),
            orders: self.orders.iter().flat_map(|o| o.clone()).collect(),
            ticks: self.ticks.iter().flat_map(|t| t.clone()).collect(),
            decisions: self.decisions.iter().map(|d| d.clone()).collect(),
        };
        let content = serde_json::to_string_pretty(&snapshot)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::Io(e.to_string()))?;
        }
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, content)
            .await
            .map_err(|e| StoreError::Io(e.to_string()))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| StoreError::Io(e.to_string()))?;

        debug!("Position store snapshot written");
        Ok(())
    }

    fn take_injected_failure(&self) -> bool {
        self.failing_updates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl PositionStore for MemoryStore {
    async fn insert_position(&self, position: &Position) -> StoreResult<()> {
        if self.positions.contains_key(&position.id) {
            return Err(StoreError::Duplicate(position.id.clone()));
        }
        self.positions.insert(position.id.clone(), position.clone());
        self.persist().await
    }

    async fn update_position(&self, id: &str, update: &PositionUpdate) -> StoreResult<Position> {
        if self.take_injected_failure() {
            return Err(StoreError::Unavailable("injected update failure".to_string()));
        }
        let updated = {
            let mut row = self
                .positions
                .get_mut(id)
                .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
            update.apply(&mut row);
            row.clone()
        };
        self.persist().await?;
        Ok(updated)
    }

    async fn get_position(&self, id: &str) -> StoreResult<Option<Position>> {
        Ok(self.positions.get(id).map(|p| p.clone()))
    }

    async fn list_open_positions(&self, ticker: Option<&str>) -> StoreResult<Vec<Position>> {
        let mut open: Vec<Position> = self
            .positions
            .iter()
            .filter(|p| p.is_open() && ticker.map_or(true, |t| p.ticker == t))
            .map(|p| p.clone())
            .collect();
        open.sort_by_key(|p| p.opened_at);
        Ok(open)
    }

    async fn recent_closed(
        &self,
        ticker: &str,
        side: OptionSide,
        limit: usize,
    ) -> StoreResult<Vec<Position>> {
        let mut closed: Vec<Position> = self
            .positions
            .iter()
            .filter(|p| p.status == PositionStatus::Closed && p.ticker == ticker && p.side == side)
            .filter(|p| p.exit_price.is_some())
            .map(|p| p.clone())
            .collect();
        closed.sort_by(|a, b| b.closed_at.cmp(&a.closed_at));
        closed.truncate(limit);
        Ok(closed)
    }

    async fn realized_pnl_since(&self, since: DateTime<Utc>) -> StoreResult<f64> {
        Ok(self
            .positions
            .iter()
            .filter(|p| match p.closed_at {
                Some(closed_at) => closed_at >= since,
                None => p.updated_at >= since,
            })
            .map(|p| p.realized_pnl)
            .sum())
    }

    async fn insert_order(&self, order: &OrderRecord) -> StoreResult<()> {
        self.orders
            .entry(order.position_id.clone())
            .or_default()
            .push(order.clone());
        self.persist().await
    }

    async fn orders_for(&self, position_id: &str) -> StoreResult<Vec<OrderRecord>> {
        Ok(self
            .orders
            .get(position_id)
            .map(|o| o.clone())
            .unwrap_or_default())
    }

    async fn insert_agent_tick(&self, tick: &AgentTick) -> StoreResult<()> {
        self.ticks
            .entry(tick.position_id.clone())
            .or_default()
            .push(tick.clone());
        self.persist().await
    }

    async fn recent_ticks(&self, position_id: &str, limit: usize) -> StoreResult<Vec<AgentTick>> {
        let ticks = self.ticks_for(position_id);
        let skip = ticks.len().saturating_sub(limit);
        Ok(ticks.into_iter().skip(skip).collect())
    }

    async fn insert_decision(&self, decision: &TradeDecision) -> StoreResult<()> {
        self.decisions.insert(decision.id.clone(), decision.clone());
        self.persist().await
    }

    async fn get_decisions(&self, ids: &[String]) -> StoreResult<HashMap<String, TradeDecision>> {
        Ok(ids
            .iter()
            .filter_map(|id| self.decisions.get(id).map(|d| (id.clone(), d.clone())))
            .collect())
    }
}
