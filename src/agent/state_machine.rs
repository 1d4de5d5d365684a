//! Position Phase Machine
//!
//! Lifecycle phases of one position agent:
//! - AwaitingFill: entry order submitted, not yet filled
//! - Monitoring: position held, exits evaluated every tick
//! - Closing: exit in progress, re-entrant exits are no-ops
//! - Closed: position closed (terminal)
//! - Failed: entry never filled (terminal)
//!
//! Transitions only move forward within one lifecycle.

use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionPhase {
    AwaitingFill,
    Monitoring,
    Closing,
    Closed,
    Failed,
}

impl PositionPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PositionPhase::Closed | PositionPhase::Failed)
    }

    /// Still holds (or may still hold) contracts and accepts suggestions
    pub fn is_live(&self) -> bool {
        matches!(self, PositionPhase::AwaitingFill | PositionPhase::Monitoring)
    }
}

impl std::fmt::Display for PositionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PositionPhase::AwaitingFill => write!(f, "AWAITING_FILL"),
            PositionPhase::Monitoring => write!(f, "MONITORING"),
            PositionPhase::Closing => write!(f, "CLOSING"),
            PositionPhase::Closed => write!(f, "CLOSED"),
            PositionPhase::Failed => write!(f, "FAILED"),
        }
    }
}

/// Phase transition record
#[derive(Debug, Clone)]
pub struct PhaseTransition {
    pub from: PositionPhase,
    pub to: PositionPhase,
    pub timestamp: i64,
    pub reason: Option<String>,
}

pub struct PhaseMachine {
    current: PositionPhase,
    entered_at: Instant,
    history: Vec<PhaseTransition>,
    max_history: usize,
}

impl PhaseMachine {
    pub fn new() -> Self {
        Self {
            current: PositionPhase::AwaitingFill,
            entered_at: Instant::now(),
            history: Vec::new(),
            max_history: 32,
        }
    }

    pub fn current(&self) -> PositionPhase {
        self.current
    }

    pub fn time_in_phase(&self) -> std::time::Duration {
        self.entered_at.elapsed()
    }

    pub fn can_transition_to(&self, target: PositionPhase) -> bool {
        use PositionPhase::*;

        match (self.current, target) {
            (AwaitingFill, Monitoring) => true,
            (AwaitingFill, Closing) => true,
            (AwaitingFill, Closed) => true,
            (AwaitingFill, Failed) => true,

            (Monitoring, Closing) => true,
            // Row closed externally, or hard shutdown
            (Monitoring, Closed) => true,

            (Closing, Closed) => true,

            _ => false,
        }
    }

    pub fn transition_to(&mut self, target: PositionPhase, reason: Option<&str>) -> bool {
        if !self.can_transition_to(target) {
            warn!("Invalid phase transition: {} -> {}", self.current, target);
            return false;
        }

        info!(
            "Phase transition: {} -> {}{}",
            self.current,
            target,
            reason.map(|r| format!(" ({})", r)).unwrap_or_default()
        );

        self.history.push(PhaseTransition {
            from: self.current,
            to: target,
            timestamp: chrono::Utc::now().timestamp_millis(),
            reason: reason.map(str::to_string),
        });
        if self.history.len() > self.max_history {
            self.history.remove(0);
        }

        self.current = target;
        self.entered_at = Instant::now();
        true
    }

    pub fn history(&self) -> &[PhaseTransition] {
        &self.history
    }
}

impl Default for PhaseMachine {
    fn default() -> Self {
        Self::new()
    }
}
