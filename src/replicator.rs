// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! One-way replication between two stores.
//!
//! A replication walks the catalog in order and upserts every source record
//! into the target. All target writes share a single unit of work:
//!
//! ```text
//! source.begin() ──► fetch Institution ─► fetch Level ─► ... ─► rollback (read only)
//!                         │                   │
//!                         ▼                   ▼
//! target.begin() ──► upsert each ──────► upsert each ─► ... ─► commit
//!                         │
//!                         └── any error ──► rollback, affected = 0
//! ```
//!
//! Either the whole walk commits or none of it does. Merging is blind
//! overwrite by identity: the direction that ran last wins.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::catalog::EntityCatalog;
use crate::storage::traits::{StoreError, StoreHandle, UnitOfWork};

/// Result of a committed replication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationOutcome {
    /// Total records upserted into the target.
    pub affected: u64,
    /// Records upserted per entity type, in catalog order.
    pub per_entity: Vec<(&'static str, u64)>,
    pub elapsed: Duration,
}

#[derive(Debug, Clone)]
pub struct Replicator {
    catalog: Arc<EntityCatalog>,
}

impl Replicator {
    #[must_use]
    pub fn new(catalog: Arc<EntityCatalog>) -> Self {
        Self { catalog }
    }

    #[must_use]
    pub fn catalog(&self) -> &EntityCatalog {
        &self.catalog
    }

    /// Copy every catalogued record from `source` into `target`.
    ///
    /// # Errors
    ///
    /// Returns the first [`StoreError`] hit while reading or writing. The
    /// target is left exactly as it was.
    #[tracing::instrument(skip_all, fields(source = source.name(), target = target.name()))]
    pub async fn replicate(
        &self,
        source: &dyn StoreHandle,
        target: &dyn StoreHandle,
    ) -> Result<ReplicationOutcome, StoreError> {
        let start = Instant::now();

        let mut reader = source.begin().await?;
        let mut writer = match target.begin().await {
            Ok(writer) => writer,
            Err(e) => {
                discard(reader, source.name()).await;
                return Err(e);
            }
        };

        match self.walk(reader.as_mut(), writer.as_mut()).await {
            Ok(per_entity) => {
                discard(reader, source.name()).await;
                writer.commit().await?;

                let affected: u64 = per_entity.iter().map(|(_, n)| n).sum();
                debug!(affected, "Replication committed");
                Ok(ReplicationOutcome {
                    affected,
                    per_entity,
                    elapsed: start.elapsed(),
                })
            }
            Err(e) => {
                discard(writer, target.name()).await;
                discard(reader, source.name()).await;
                Err(e)
            }
        }
    }

    async fn walk(
        &self,
        reader: &mut dyn UnitOfWork,
        writer: &mut dyn UnitOfWork,
    ) -> Result<Vec<(&'static str, u64)>, StoreError> {
        let mut per_entity = Vec::with_capacity(self.catalog.len());

        for entity in self.catalog.ordered_types() {
            let records = reader.fetch_all(entity).await?;
            let mut written = 0u64;
            for record in &records {
                writer.upsert(entity, record).await.map_err(|e| {
                    debug!(entity = entity.name, id = record.id(), error = %e, "Upsert rejected");
                    e
                })?;
                written += 1;
            }
            debug!(entity = entity.name, written, "Entity replicated");
            per_entity.push((entity.name, written));
        }

        Ok(per_entity)
    }
}

async fn discard(uow: Box<dyn UnitOfWork>, store: &str) {
    if let Err(e) = uow.rollback().await {
        warn!(store, error = %e, "Rollback failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{participation, EntityDescriptor, FieldKind};
    use crate::record::Record;
    use crate::storage::memory::MemoryStore;

    fn fixture() -> (Arc<EntityCatalog>, MemoryStore, MemoryStore) {
        let catalog = Arc::new(participation().unwrap());
        let local = MemoryStore::new("local", catalog.clone());
        let remote = MemoryStore::new("remote", catalog.clone());
        (catalog, local, remote)
    }

    async fn seed_hierarchy(store: &MemoryStore, catalog: &EntityCatalog) {
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
        store
            .upsert(
                catalog.get("Section").unwrap(),
                &Record::new(100).with("level_id", 10).with("name", "A"),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_empty_source_affects_nothing() {
        let (catalog, local, remote) = fixture();
        let outcome = Replicator::new(catalog).replicate(&local, &remote).await.unwrap();
        assert_eq!(outcome.affected, 0);
        assert_eq!(outcome.per_entity.len(), 7);
        assert!(remote.is_empty());
    }

    #[tokio::test]
    async fn test_parent_first_hierarchy_replicates() {
        let (catalog, local, remote) = fixture();
        seed_hierarchy(&local, &catalog).await;

        let outcome = Replicator::new(catalog.clone())
            .replicate(&local, &remote)
            .await
            .unwrap();

        assert_eq!(outcome.affected, 3);
        assert_eq!(outcome.per_entity[..3], [("Institution", 1), ("Level", 1), ("Section", 1)]);
        assert_eq!(remote.snapshot("Section"), local.snapshot("Section"));
    }

    #[tokio::test]
    async fn test_rerun_is_idempotent() {
        let (catalog, local, remote) = fixture();
        seed_hierarchy(&local, &catalog).await;
        let replicator = Replicator::new(catalog);

        let first = replicator.replicate(&local, &remote).await.unwrap();
        let second = replicator.replicate(&local, &remote).await.unwrap();

        assert_eq!(first.affected, second.affected);
        assert_eq!(remote.total_len(), 3);
    }

    #[tokio::test]
    async fn test_unreachable_target_fails_without_writes() {
        let (catalog, local, remote) = fixture();
        seed_hierarchy(&local, &catalog).await;
        remote.set_reachable(false);

        let err = Replicator::new(catalog).replicate(&local, &remote).await.unwrap_err();
        assert!(err.is_transient());
        remote.set_reachable(true);
        assert!(remote.is_empty());
    }

    #[tokio::test]
    async fn test_orphan_in_source_rolls_back_everything() {
        let (catalog, _, remote) = fixture();

        // Source without the Section -> Level constraint, holding an orphan
        let loose = Arc::new(
            EntityCatalog::new(vec![
                catalog.get("Institution").unwrap().clone(),
                catalog.get("Level").unwrap().clone(),
                EntityDescriptor::new("Section", "sections")
                    .field("level_id", FieldKind::Integer)
                    .field("name", FieldKind::Text),
            ])
            .unwrap(),
        );
        let local = MemoryStore::new("local", loose.clone());
        seed_hierarchy(&local, &loose).await;
        local
            .upsert(
                loose.get("Section").unwrap(),
                &Record::new(200).with("level_id", 99).with("name", "orphan"),
            )
            .await
            .unwrap();

        let err = Replicator::new(catalog).replicate(&local, &remote).await.unwrap_err();
        assert!(err.is_integrity_violation());
        // Institution and Level were written before the orphan; none survive
        assert!(remote.is_empty());
    }
}
