// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sync orchestrator.
//!
//! The [`SyncOrchestrator`] owns the two stores, the replicator and the
//! journal, and runs replication either on a timer or on demand:
//! - **background**: a spawned loop that uploads local changes every
//!   `sync_interval_secs` while the remote store is reachable
//! - **manual**: [`SyncOrchestrator::manual_sync`] in any direction
//!
//! # Lifecycle
//!
//! ```text
//! Stopped ──start()──► Running ──stop() / auto sync switched off──► Stopped
//! ```
//!
//! Store failures never escape the orchestrator. Each direction run leaves
//! one journal entry and callers get a boolean.
//!
//! # Example
//!
//! ```rust,no_run
//! use participation_sync::{SyncConfig, SyncDirection, SyncOrchestrator};
//! use tokio::sync::watch;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), participation_sync::SyncError> {
//! let config = SyncConfig::load_with_dotenv()?;
//! let (_tx, rx) = watch::channel(config);
//! let orchestrator = SyncOrchestrator::open(rx).await?;
//!
//! orchestrator.start();
//! let ok = orchestrator.manual_sync(SyncDirection::Bidirectional).await;
//! println!("manual sync ok: {ok}, last sync: {:?}", orchestrator.last_sync_time());
//! orchestrator.stop().await;
//! # Ok(())
//! # }
//! ```

mod api;
mod lifecycle;
mod types;

pub use types::{LoopState, OrchestratorState, SyncReport};

use std::sync::Arc;

use parking_lot::Mutex as SyncMutex;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::catalog::{participation, EntityCatalog};
use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::journal::{JournalSink, SqlJournal};
use crate::replicator::Replicator;
use crate::storage::sql::SqlStore;
use crate::storage::traits::{StoreError, StoreHandle};

/// Replication orchestrator for one local/remote pair.
pub struct SyncOrchestrator {
    inner: Arc<Inner>,
    worker: SyncMutex<Option<Worker>>,
}

/// State shared with the background task.
struct Inner {
    local: Arc<dyn StoreHandle>,
    remote: Arc<dyn StoreHandle>,
    replicator: Replicator,
    journal: Arc<dyn JournalSink>,
    config_rx: watch::Receiver<SyncConfig>,
    state: OrchestratorState,
    /// Held for the duration of a replication when `serialize_cycles` is on
    cycle_lock: Mutex<()>,
}

struct Worker {
    handle: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

impl SyncOrchestrator {
    /// Assemble an orchestrator from already-open parts.
    pub fn new(
        local: Arc<dyn StoreHandle>,
        remote: Arc<dyn StoreHandle>,
        catalog: Arc<EntityCatalog>,
        journal: Arc<dyn JournalSink>,
        config_rx: watch::Receiver<SyncConfig>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                local,
                remote,
                replicator: Replicator::new(catalog),
                journal,
                config_rx,
                state: OrchestratorState::default(),
                cycle_lock: Mutex::new(()),
            }),
            worker: SyncMutex::new(None),
        }
    }

    /// Open the local SQLite store and journal, configure the remote server
    /// (without connecting), and restore the last successful sync time.
    ///
    /// # Errors
    ///
    /// Fails if the configuration is invalid, the catalog is inconsistent,
    /// or the local store cannot be opened. An unreachable remote server is
    /// not an error.
    pub async fn open(config_rx: watch::Receiver<SyncConfig>) -> Result<Self, SyncError> {
        let config = config_rx.borrow().clone();
        config.validate()?;
        let catalog = Arc::new(participation()?);

        if let Some(parent) = config.local_store_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    StoreError::Backend(format!("cannot create {}: {e}", parent.display()))
                })?;
            }
        }

        let local = SqlStore::open_local("local", &config.local_store_url(), catalog.clone()).await?;
        let journal = SqlJournal::open(&local).await?;
        let remote = SqlStore::connect_remote(
            "remote",
            &config.remote.connection_url(),
            catalog.clone(),
            config.remote.connect_timeout(),
        )?;
        info!(
            local = %config.local_store_path.display(),
            remote_host = %config.remote.host,
            "Sync orchestrator opened"
        );

        let orchestrator = Self::new(
            Arc::new(local),
            Arc::new(remote),
            catalog,
            Arc::new(journal),
            config_rx,
        );
        orchestrator.restore_last_sync().await;
        Ok(orchestrator)
    }

    /// Seed `last_sync_time()` from the journal.
    pub async fn restore_last_sync(&self) {
        match self.inner.journal.last_success().await {
            Ok(Some(at)) => self.inner.state.record_sync(at),
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Could not read last sync time from journal"),
        }
    }

    #[must_use]
    pub fn state(&self) -> LoopState {
        if self.inner.state.is_running() {
            LoopState::Running
        } else {
            LoopState::Stopped
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.state.is_running()
    }

    #[must_use]
    pub fn local(&self) -> Arc<dyn StoreHandle> {
        Arc::clone(&self.inner.local)
    }

    #[must_use]
    pub fn remote(&self) -> Arc<dyn StoreHandle> {
        Arc::clone(&self.inner.remote)
    }
}
