//! Manual sync API and the per-direction cycle shared with the loop.

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use super::{Inner, SyncOrchestrator, SyncReport};
use crate::journal::{JournalEntry, SyncDirection};
use crate::metrics::{self, CycleTimer};

impl SyncOrchestrator {
    /// Run one replication per leg of `direction` and report every entry.
    ///
    /// Bidirectional runs upload, then download, even if the upload failed.
    /// Each leg leaves exactly one journal entry, including a leg skipped
    /// because the remote store was unreachable.
    #[tracing::instrument(skip(self))]
    pub async fn sync_now(&self, direction: SyncDirection) -> SyncReport {
        let mut entries = Vec::with_capacity(direction.legs().len());

        for &leg in direction.legs() {
            let reachable = self.inner.remote.probe().await;
            metrics::set_remote_reachable(reachable);

            let entry = if reachable {
                self.inner.run_direction(leg).await
            } else {
                warn!(direction = %leg, "Remote store unreachable, manual sync failed");
                let entry = JournalEntry::failure(leg, "remote store unreachable");
                metrics::record_cycle(leg, entry.status);
                self.inner.record(&entry).await;
                entry
            };
            entries.push(entry);
        }

        SyncReport { direction, entries }
    }

    /// Manual sync. `true` only if every direction succeeded.
    pub async fn manual_sync(&self, direction: SyncDirection) -> bool {
        self.sync_now(direction).await.succeeded()
    }

    /// When a replication last committed, from this process or the journal.
    #[must_use]
    pub fn last_sync_time(&self) -> Option<DateTime<Utc>> {
        self.inner.state.last_sync()
    }
}

impl Inner {
    /// Replicate one direction and journal the outcome. Never fails.
    pub(super) async fn run_direction(&self, direction: SyncDirection) -> JournalEntry {
        let serialize = self.config_rx.borrow().serialize_cycles;
        let _serial = if serialize {
            Some(self.cycle_lock.lock().await)
        } else {
            None
        };
        let _timer = CycleTimer::new(direction);

        // legs() never yields Bidirectional
        let (source, target) = match direction {
            SyncDirection::Download => (&self.remote, &self.local),
            SyncDirection::Upload | SyncDirection::Bidirectional => (&self.local, &self.remote),
        };

        let entry = match self.replicator.replicate(source.as_ref(), target.as_ref()).await {
            Ok(outcome) => {
                for (entity, count) in &outcome.per_entity {
                    metrics::record_replicated(direction, *entity, *count);
                }
                info!(
                    %direction,
                    affected = outcome.affected,
                    elapsed_ms = outcome.elapsed.as_millis() as u64,
                    "Sync cycle committed"
                );
                JournalEntry::success(direction, outcome.affected)
            }
            Err(e) if e.is_integrity_violation() => {
                error!(%direction, error = %e, "Sync cycle rolled back");
                JournalEntry::failure(direction, e.to_string())
            }
            Err(e) => {
                warn!(%direction, error = %e, "Sync cycle rolled back");
                JournalEntry::failure(direction, e.to_string())
            }
        };

        metrics::record_cycle(direction, entry.status);
        if entry.is_success() {
            self.state.record_sync(entry.timestamp);
        }
        self.record(&entry).await;
        entry
    }

    /// Append to the journal; a failed write is logged, never raised.
    pub(super) async fn record(&self, entry: &JournalEntry) {
        if let Err(e) = self.journal.record(entry).await {
            error!(direction = %entry.direction, status = %entry.status, error = %e, "Journal write failed");
            metrics::record_journal_write_failure();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use tokio::sync::watch;

    use crate::catalog::{participation, EntityCatalog};
    use crate::config::SyncConfig;
    use crate::journal::{JournalEntry, JournalSink, JournalStatus, MemoryJournal, SyncDirection};
    use crate::orchestrator::SyncOrchestrator;
    use crate::record::Record;
    use crate::storage::memory::MemoryStore;
    use crate::storage::traits::{StoreError, StoreHandle};

    fn stores() -> (Arc<EntityCatalog>, Arc<MemoryStore>, Arc<MemoryStore>) {
        let catalog = Arc::new(participation().unwrap());
        let local = Arc::new(MemoryStore::new("local", catalog.clone()));
        let remote = Arc::new(MemoryStore::new("remote", catalog.clone()));
        (catalog, local, remote)
    }

    fn orchestrator(
        catalog: Arc<EntityCatalog>,
        local: Arc<MemoryStore>,
        remote: Arc<MemoryStore>,
        journal: Arc<dyn JournalSink>,
    ) -> SyncOrchestrator {
        let (_tx, rx) = watch::channel(SyncConfig::default());
        SyncOrchestrator::new(local, remote, catalog, journal, rx)
    }

    async fn seed(store: &MemoryStore, catalog: &EntityCatalog) {
        store
            .upsert(
                catalog.get("Institution").unwrap(),
                &Record::new(1).with("name", "Central").with("kind", "colegio"),
            )
            .await
            .unwrap();
        store
            .upsert(
                catalog.get("Level").unwrap(),
                &Record::new(10).with("institution_id", 1).with("name", "Primaria"),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_manual_upload_journals_success() {
        let (catalog, local, remote) = stores();
        seed(&local, &catalog).await;
        let journal = Arc::new(MemoryJournal::new());
        let orch = orchestrator(catalog, local, remote.clone(), journal.clone());

        assert!(orch.manual_sync(SyncDirection::Upload).await);

        let entries = journal.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].direction, SyncDirection::Upload);
        assert_eq!(entries[0].affected_count, 2);
        assert_eq!(remote.total_len(), 2);
        assert_eq!(orch.last_sync_time(), Some(entries[0].timestamp));
    }

    #[tokio::test]
    async fn test_bidirectional_uploads_then_downloads() {
        let (catalog, local, remote) = stores();
        seed(&local, &catalog).await;
        // Remote-only institution comes down on the second leg
        remote
            .upsert(
                catalog.get("Institution").unwrap(),
                &Record::new(2).with("name", "Norte").with("kind", "escuela"),
            )
            .await
            .unwrap();
        let journal = Arc::new(MemoryJournal::new());
        let orch = orchestrator(catalog, local.clone(), remote.clone(), journal.clone());

        let report = orch.sync_now(SyncDirection::Bidirectional).await;
        assert!(report.succeeded());

        let entries = journal.entries();
        let directions: Vec<_> = entries.iter().map(|e| e.direction).collect();
        assert_eq!(directions, [SyncDirection::Upload, SyncDirection::Download]);
        assert_eq!(entries[0].affected_count, 2);
        assert_eq!(entries[1].affected_count, 3);
        assert_eq!(local.len("Institution"), 2);
        assert_eq!(local.snapshot("Institution"), remote.snapshot("Institution"));
    }

    #[tokio::test]
    async fn test_empty_source_is_a_zero_success() {
        let (catalog, local, remote) = stores();
        let journal = Arc::new(MemoryJournal::new());
        let orch = orchestrator(catalog, local, remote, journal.clone());

        assert!(orch.manual_sync(SyncDirection::Upload).await);
        let entries = journal.entries();
        assert_eq!(entries[0].status, JournalStatus::Success);
        assert_eq!(entries[0].affected_count, 0);
    }

    #[tokio::test]
    async fn test_unreachable_remote_returns_false() {
        let (catalog, local, remote) = stores();
        seed(&local, &catalog).await;
        remote.set_reachable(false);
        let journal = Arc::new(MemoryJournal::new());
        let orch = orchestrator(catalog, local, remote, journal.clone());

        assert!(!orch.manual_sync(SyncDirection::Bidirectional).await);
        let entries = journal.entries();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.status == JournalStatus::Error && e.affected_count == 0));
        assert!(orch.last_sync_time().is_none());
    }

    struct BrokenJournal;

    #[async_trait]
    impl JournalSink for BrokenJournal {
        async fn record(&self, _entry: &JournalEntry) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("disk full".into()))
        }
    }

    #[tokio::test]
    async fn test_journal_failure_does_not_fail_sync() {
        let (catalog, local, remote) = stores();
        seed(&local, &catalog).await;
        let orch = orchestrator(catalog, local, remote.clone(), Arc::new(BrokenJournal));

        assert!(orch.manual_sync(SyncDirection::Upload).await);
        assert_eq!(remote.total_len(), 2);
    }

    #[tokio::test]
    async fn test_last_sync_restored_from_journal() {
        let (catalog, local, remote) = stores();
        let journal = Arc::new(MemoryJournal::new());
        let earlier = JournalEntry::success(SyncDirection::Upload, 7);
        journal.record(&earlier).await.unwrap();

        let orch = orchestrator(catalog, local, remote, journal);
        assert!(orch.last_sync_time().is_none());
        orch.restore_last_sync().await;
        assert_eq!(orch.last_sync_time(), Some(earlier.timestamp));
    }
}
