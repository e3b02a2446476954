//! In-memory store handle.
//!
//! Behaves like a SQL store with foreign keys enabled: upserts that point at
//! a missing parent are rejected, writes are staged per unit of work and only
//! become visible on commit. Reachability can be toggled to simulate the
//! shared server dropping off the network.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;

use super::traits::{StoreError, StoreHandle, UnitOfWork};
use crate::catalog::{EntityCatalog, EntityDescriptor};
use crate::record::Record;
use crate::resilience::health::{ConnectionHealth, ConnectionState};

type Table = BTreeMap<i64, Record>;

#[derive(Debug)]
struct Shared {
    catalog: Arc<EntityCatalog>,
    tables: DashMap<&'static str, Table>,
    reachable: AtomicBool,
    /// Commits apply atomically across tables
    commit_lock: Mutex<()>,
    health: ConnectionHealth,
}

impl Shared {
    fn ensure_reachable(&self, name: &str) -> Result<(), StoreError> {
        if self.reachable.load(Ordering::Acquire) {
            Ok(())
        } else {
            self.health.record_failure();
            Err(StoreError::Unavailable(format!("{name} store is offline")))
        }
    }

    fn known(&self, entity: &EntityDescriptor) -> Result<(), StoreError> {
        if self.catalog.get(entity.name).is_some() {
            Ok(())
        } else {
            Err(StoreError::UnknownEntity(entity.name.to_string()))
        }
    }
}

#[derive(Debug, Clone)]
pub struct MemoryStore {
    name: String,
    shared: Arc<Shared>,
}

impl MemoryStore {
    #[must_use]
    pub fn new(name: impl Into<String>, catalog: Arc<EntityCatalog>) -> Self {
        Self {
            name: name.into(),
            shared: Arc::new(Shared {
                catalog,
                tables: DashMap::new(),
                reachable: AtomicBool::new(true),
                commit_lock: Mutex::new(()),
                health: ConnectionHealth::new(),
            }),
        }
    }

    /// Simulate the store going offline (or coming back).
    pub fn set_reachable(&self, reachable: bool) {
        self.shared.reachable.store(reachable, Ordering::Release);
    }

    #[must_use]
    pub fn is_reachable(&self) -> bool {
        self.shared.reachable.load(Ordering::Acquire)
    }

    /// Committed record count for one entity type.
    #[must_use]
    pub fn len(&self, entity: &str) -> usize {
        self.shared.tables.get(entity).map_or(0, |t| t.len())
    }

    /// Committed record count across every entity type.
    #[must_use]
    pub fn total_len(&self) -> usize {
        self.shared.tables.iter().map(|t| t.len()).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.total_len() == 0
    }

    /// Committed records of one entity type, ordered by identity.
    #[must_use]
    pub fn snapshot(&self, entity: &str) -> Vec<Record> {
        self.shared
            .tables
            .get(entity)
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl StoreHandle for MemoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn probe(&self) -> bool {
        let shared = &self.shared;
        shared
            .health
            .probe(|| async {
                if shared.reachable.load(Ordering::Acquire) {
                    Ok(())
                } else {
                    Err(StoreError::Unavailable("offline".into()))
                }
            })
            .await
    }

    fn connection_state(&self) -> ConnectionState {
        self.shared.health.snapshot()
    }

    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, StoreError> {
        self.shared.ensure_reachable(&self.name)?;
        self.shared.health.record_success();
        Ok(Box::new(MemoryUnitOfWork {
            name: self.name.clone(),
            shared: Arc::clone(&self.shared),
            staged: BTreeMap::new(),
        }))
    }
}

struct MemoryUnitOfWork {
    name: String,
    shared: Arc<Shared>,
    staged: BTreeMap<&'static str, Table>,
}

impl MemoryUnitOfWork {
    fn lookup(&self, entity: &str, id: i64) -> Option<Record> {
        if let Some(record) = self.staged.get(entity).and_then(|t| t.get(&id)) {
            return Some(record.clone());
        }
        self.shared
            .tables
            .get(entity)
            .and_then(|t| t.get(&id).cloned())
    }

    fn check_references(&self, entity: &EntityDescriptor, record: &Record) -> Result<(), StoreError> {
        for fk in entity.foreign_keys() {
            let Some(parent_id) = record.reference(fk.field) else {
                return Err(StoreError::IntegrityViolation(format!(
                    "{}.{} is required (record {})",
                    entity.table,
                    fk.field,
                    record.id()
                )));
            };
            if self.lookup(fk.references, parent_id).is_none() {
                return Err(StoreError::IntegrityViolation(format!(
                    "{}.{} = {} references a missing {} (record {})",
                    entity.table,
                    fk.field,
                    parent_id,
                    fk.references,
                    record.id()
                )));
            }
        }
        for spec in entity.fields() {
            let missing = record.get(spec.name).map_or(true, |v| v.is_null());
            if !spec.nullable && missing {
                return Err(StoreError::IntegrityViolation(format!(
                    "{}.{} may not be null (record {})",
                    entity.table,
                    spec.name,
                    record.id()
                )));
            }
            if spec.unique && !missing && self.value_taken(entity.name, spec.name, record) {
                return Err(StoreError::IntegrityViolation(format!(
                    "{}.{} must be unique (record {})",
                    entity.table,
                    spec.name,
                    record.id()
                )));
            }
        }
        Ok(())
    }

    /// Whether another record of `entity` already holds `record`'s value for `field`.
    fn value_taken(&self, entity: &str, field: &str, record: &Record) -> bool {
        let value = record.get(field);
        let mut visible: Table = self
            .shared
            .tables
            .get(entity)
            .map(|t| t.value().clone())
            .unwrap_or_default();
        if let Some(staged) = self.staged.get(entity) {
            visible.extend(staged.iter().map(|(id, r)| (*id, r.clone())));
        }
        visible
            .values()
            .any(|other| other.id() != record.id() && other.get(field) == value)
    }
}

#[async_trait]
impl UnitOfWork for MemoryUnitOfWork {
    async fn fetch_all(&mut self, entity: &EntityDescriptor) -> Result<Vec<Record>, StoreError> {
        self.shared.ensure_reachable(&self.name)?;
        self.shared.known(entity)?;

        let mut merged: Table = self
            .shared
            .tables
            .get(entity.name)
            .map(|t| t.value().clone())
            .unwrap_or_default();
        if let Some(staged) = self.staged.get(entity.name) {
            merged.extend(staged.iter().map(|(id, r)| (*id, r.clone())));
        }
        Ok(merged.into_values().collect())
    }

    async fn fetch_by_id(
        &mut self,
        entity: &EntityDescriptor,
        id: i64,
    ) -> Result<Option<Record>, StoreError> {
        self.shared.ensure_reachable(&self.name)?;
        self.shared.known(entity)?;
        Ok(self.lookup(entity.name, id))
    }

    async fn upsert(&mut self, entity: &EntityDescriptor, record: &Record) -> Result<(), StoreError> {
        self.shared.ensure_reachable(&self.name)?;
        self.shared.known(entity)?;

        let row = entity.project(record);
        self.check_references(entity, &row)?;
        self.staged.entry(entity.name).or_default().insert(row.id(), row);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let this = *self;
        this.shared.ensure_reachable(&this.name)?;

        let _guard = this.shared.commit_lock.lock();
        for (entity, rows) in this.staged {
            this.shared.tables.entry(entity).or_default().extend(rows);
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::FieldKind;
    use crate::record::FieldValue;
    use crate::storage::traits::run_in_unit_of_work;

    fn catalog() -> Arc<EntityCatalog> {
        Arc::new(
            EntityCatalog::new(vec![
                EntityDescriptor::new("Institution", "institutions").field("name", FieldKind::Text),
                EntityDescriptor::new("Level", "levels")
                    .foreign_key("institution_id", "Institution")
                    .field("name", FieldKind::Text),
            ])
            .unwrap(),
        )
    }

    fn institution(id: i64, name: &str) -> Record {
        Record::new(id).with("name", name)
    }

    #[tokio::test]
    async fn test_new_store_is_empty() {
        let store = MemoryStore::new("local", catalog());
        assert!(store.is_empty());
        assert_eq!(store.len("Institution"), 0);
    }

    #[tokio::test]
    async fn test_upsert_and_fetch() {
        let cat = catalog();
        let store = MemoryStore::new("local", cat.clone());
        let inst = cat.get("Institution").unwrap();

        store.upsert(inst, &institution(1, "San Martín")).await.unwrap();

        let found = store.fetch_by_id(inst, 1).await.unwrap().unwrap();
        assert_eq!(found.get("name").and_then(|v| v.as_str()), Some("San Martín"));
        assert!(store.fetch_by_id(inst, 2).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_upsert_overwrites() {
        let cat = catalog();
        let store = MemoryStore::new("local", cat.clone());
        let inst = cat.get("Institution").unwrap();

        store.upsert(inst, &institution(1, "old")).await.unwrap();
        store.upsert(inst, &institution(1, "new")).await.unwrap();

        assert_eq!(store.len("Institution"), 1);
        let all = store.fetch_all(inst).await.unwrap();
        assert_eq!(all[0].get("name").and_then(|v| v.as_str()), Some("new"));
    }

    #[tokio::test]
    async fn test_missing_parent_is_integrity_violation() {
        let cat = catalog();
        let store = MemoryStore::new("remote", cat.clone());
        let level = cat.get("Level").unwrap();

        let err = store
            .upsert(level, &Record::new(10).with("institution_id", 1).with("name", "L"))
            .await
            .unwrap_err();
        assert!(err.is_integrity_violation());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_not_null_column_enforced() {
        let cat = catalog();
        let store = MemoryStore::new("remote", cat.clone());
        let inst = cat.get("Institution").unwrap();

        let err = store.upsert(inst, &Record::new(1)).await.unwrap_err();
        assert!(err.is_integrity_violation());
    }

    #[tokio::test]
    async fn test_parent_staged_in_same_unit_of_work_satisfies_fk() {
        let cat = catalog();
        let store = MemoryStore::new("remote", cat.clone());
        let inst = cat.get("Institution").unwrap().clone();
        let level = cat.get("Level").unwrap().clone();

        run_in_unit_of_work(&store, move |uow| {
            Box::pin(async move {
                uow.upsert(&inst, &institution(1, "A")).await?;
                uow.upsert(&level, &Record::new(10).with("institution_id", 1).with("name", "L"))
                    .await
            })
        })
        .await
        .unwrap();

        assert_eq!(store.len("Institution"), 1);
        assert_eq!(store.len("Level"), 1);
    }

    #[tokio::test]
    async fn test_failed_unit_of_work_leaves_nothing_behind() {
        let cat = catalog();
        let store = MemoryStore::new("remote", cat.clone());
        let inst = cat.get("Institution").unwrap().clone();
        let level = cat.get("Level").unwrap().clone();

        let result = run_in_unit_of_work(&store, move |uow| {
            Box::pin(async move {
                uow.upsert(&inst, &institution(1, "A")).await?;
                uow.upsert(&level, &Record::new(10).with("institution_id", 99).with("name", "L"))
                    .await
            })
        })
        .await;

        assert!(result.unwrap_err().is_integrity_violation());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_dropped_unit_of_work_discards_writes() {
        let cat = catalog();
        let store = MemoryStore::new("local", cat.clone());
        let inst = cat.get("Institution").unwrap();

        let mut uow = store.begin().await.unwrap();
        uow.upsert(inst, &institution(1, "A")).await.unwrap();
        assert_eq!(uow.fetch_all(inst).await.unwrap().len(), 1);
        drop(uow);

        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_offline_store_is_unavailable() {
        let cat = catalog();
        let store = MemoryStore::new("remote", cat.clone());
        store.set_reachable(false);

        assert!(!store.probe().await);
        let err = store.begin().await.err().unwrap();
        assert!(err.is_transient());
        assert!(!store.connection_state().connected);

        store.set_reachable(true);
        assert!(store.probe().await);
        assert!(store.connection_state().connected);
    }

    #[tokio::test]
    async fn test_unknown_entity_rejected() {
        let store = MemoryStore::new("local", catalog());
        let stray = EntityDescriptor::new("Ghost", "ghosts");
        let err = store.fetch_all(&stray).await.unwrap_err();
        assert_eq!(err, StoreError::UnknownEntity("Ghost".into()));
    }

    #[tokio::test]
    async fn test_concurrent_units_of_work() {
        let cat = catalog();
        let store = MemoryStore::new("local", cat.clone());
        let mut handles = vec![];

        for batch in 0..10 {
            let store = store.clone();
            let inst = cat.get("Institution").unwrap().clone();
            handles.push(tokio::spawn(async move {
                for i in 0..10 {
                    let id = batch * 10 + i;
                    store.upsert(&inst, &institution(id, "x")).await.unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(store.len("Institution"), 100);
    }

    #[tokio::test]
    async fn test_unique_column_enforced() {
        let cat = Arc::new(
            EntityCatalog::new(vec![EntityDescriptor::new("Teacher", "teachers")
                .unique("email", FieldKind::Text)
                .field("points", FieldKind::Real)])
            .unwrap(),
        );
        let store = MemoryStore::new("remote", cat.clone());
        let teacher = cat.get("Teacher").unwrap();
        let ana = |id: i64| Record::new(id).with("email", "ana@school.test").with("points", 1);

        store.upsert(teacher, &ana(1)).await.unwrap();
        // Rewriting the same row keeps its own value
        store.upsert(teacher, &ana(1)).await.unwrap();
        let err = store.upsert(teacher, &ana(2)).await.unwrap_err();
        assert!(err.is_integrity_violation());

        // Stored the way a SQL store would read it back
        let row = store.fetch_by_id(teacher, 1).await.unwrap().unwrap();
        assert_eq!(row.get("points"), Some(&FieldValue::Real(1.0)));
    }
}
