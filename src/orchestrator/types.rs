//! Public types for the sync orchestrator.

use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::journal::{JournalEntry, SyncDirection};

/// Background loop state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Stopped,
    Running,
}

impl std::fmt::Display for LoopState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stopped => write!(f, "Stopped"),
            Self::Running => write!(f, "Running"),
        }
    }
}

/// Mutable state owned by one orchestrator.
#[derive(Debug, Default)]
pub struct OrchestratorState {
    running: AtomicBool,
    last_sync: RwLock<Option<DateTime<Utc>>>,
}

impl OrchestratorState {
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub(crate) fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Release);
    }

    #[must_use]
    pub fn last_sync(&self) -> Option<DateTime<Utc>> {
        *self.last_sync.read()
    }

    /// Only ever moves forward.
    pub(crate) fn record_sync(&self, at: DateTime<Utc>) {
        let mut last = self.last_sync.write();
        if last.map_or(true, |prev| at > prev) {
            *last = Some(at);
        }
    }
}

/// Outcome of a manual sync: one journal entry per direction run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub direction: SyncDirection,
    pub entries: Vec<JournalEntry>,
}

impl SyncReport {
    /// True only if every direction succeeded.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        !self.entries.is_empty() && self.entries.iter().all(JournalEntry::is_success)
    }

    #[must_use]
    pub fn affected(&self) -> u64 {
        self.entries.iter().map(|e| e.affected_count).sum()
    }
}
