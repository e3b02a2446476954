//! # Participation Sync
//!
//! Offline-first replication between a local SQLite store and a shared
//! MySQL server, for a classroom participation tracker.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     SyncOrchestrator                        │
//! │  • Background loop: upload every interval while reachable  │
//! │  • Manual sync: upload, download or both                   │
//! └─────────────────────────────────────────────────────────────┘
//!               │                                │
//!               ▼                                ▼
//! ┌──────────────────────────┐     ┌──────────────────────────┐
//! │        Replicator        │     │       Sync Journal       │
//! │  • Catalog order walk    │     │  • One entry per leg     │
//! │  • One unit of work      │     │  • Own transaction       │
//! └──────────────────────────┘     └──────────────────────────┘
//!          │             │
//!          ▼             ▼
//! ┌────────────────┐  ┌────────────────┐
//! │  Local store   │  │  Remote store  │
//! │  SQLite (WAL)  │  │  MySQL (lazy)  │
//! └────────────────┘  └────────────────┘
//! ```
//!
//! Every replicated entity type is declared in an [`EntityCatalog`] whose
//! order puts parents before children. Replication copies those types in
//! that order, upserting by identity, and commits all of them or none.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use participation_sync::{SyncConfig, SyncDirection, SyncOrchestrator};
//! use tokio::sync::watch;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), participation_sync::SyncError> {
//!     let config = SyncConfig::load_with_dotenv()?;
//!     let (_config_tx, config_rx) = watch::channel(config);
//!
//!     let orchestrator = SyncOrchestrator::open(config_rx).await?;
//!     orchestrator.start();
//!
//!     if !orchestrator.manual_sync(SyncDirection::Download).await {
//!         eprintln!("download failed, see sync_journal");
//!     }
//!
//!     orchestrator.stop().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`orchestrator`]: background loop and manual sync
//! - [`replicator`]: one-way, all-or-nothing replication
//! - [`catalog`]: entity descriptors and the participation catalog
//! - [`storage`]: store handles (SQL, memory)
//! - [`journal`]: append-only sync journal
//! - [`resilience`]: connection health and retry
//! - [`config`]: layered configuration

pub mod catalog;
pub mod config;
pub mod error;
pub mod journal;
pub mod metrics;
pub mod orchestrator;
pub mod record;
pub mod replicator;
pub mod resilience;
pub mod storage;

pub use catalog::{CatalogError, EntityCatalog, EntityDescriptor, FieldKind, FieldSpec, ForeignKey};
pub use config::{ConfigError, RemoteStoreConfig, SyncConfig};
pub use error::SyncError;
pub use journal::{
    JournalEntry, JournalRecord, JournalSink, JournalStatus, MemoryJournal, SqlJournal, SyncDirection,
};
pub use orchestrator::{LoopState, OrchestratorState, SyncOrchestrator, SyncReport};
pub use record::{FieldValue, Record};
pub use replicator::{ReplicationOutcome, Replicator};
pub use resilience::health::{ConnectionHealth, ConnectionState};
pub use resilience::retry::RetryConfig;
pub use storage::memory::MemoryStore;
pub use storage::sql::{Dialect, SqlStore};
pub use storage::traits::{run_in_unit_of_work, StoreError, StoreHandle, UnitOfWork};
