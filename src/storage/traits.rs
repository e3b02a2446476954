//! Store handle and unit-of-work traits.
//!
//! A [`StoreHandle`] is one physical store (the local SQLite file or the
//! shared server). All reads and writes happen through a [`UnitOfWork`]
//! obtained from [`StoreHandle::begin`]: each unit of work owns its own
//! session, and dropping it without [`UnitOfWork::commit`] discards every
//! write it staged.

use async_trait::async_trait;
use futures::future::BoxFuture;
use thiserror::Error;
use tracing::warn;

use crate::catalog::EntityDescriptor;
use crate::record::Record;
use crate::resilience::health::ConnectionState;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Store cannot be reached (network down, pool timed out, I/O failure).
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// Foreign-key, uniqueness or not-null constraint rejected a write.
    #[error("integrity violation: {0}")]
    IntegrityViolation(String),
    #[error("entity '{0}' is not known to this store")]
    UnknownEntity(String),
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Transient failures are worth retrying on the next cycle.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }

    #[must_use]
    pub fn is_integrity_violation(&self) -> bool {
        matches!(self, Self::IntegrityViolation(_))
    }
}

/// One transactional session against a store.
#[async_trait]
pub trait UnitOfWork: Send {
    /// Every record of `entity`, ordered by identity.
    async fn fetch_all(&mut self, entity: &EntityDescriptor) -> Result<Vec<Record>, StoreError>;

    async fn fetch_by_id(
        &mut self,
        entity: &EntityDescriptor,
        id: i64,
    ) -> Result<Option<Record>, StoreError>;

    /// Insert `record`, or overwrite every declared column if its identity exists.
    async fn upsert(&mut self, entity: &EntityDescriptor, record: &Record) -> Result<(), StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

#[async_trait]
pub trait StoreHandle: Send + Sync {
    /// Short label for logs ("local", "remote").
    fn name(&self) -> &str;

    /// Cheap round-trip. Never fails: any error reads as unreachable and is
    /// recorded in the connection state.
    async fn probe(&self) -> bool;

    fn connection_state(&self) -> ConnectionState;

    /// Open an independent unit of work.
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, StoreError>;

    /// Read every record of `entity` in a short-lived unit of work.
    async fn fetch_all(&self, entity: &EntityDescriptor) -> Result<Vec<Record>, StoreError> {
        let entity = entity.clone();
        run_in_unit_of_work(self, move |uow| {
            Box::pin(async move { uow.fetch_all(&entity).await })
        })
        .await
    }

    async fn fetch_by_id(
        &self,
        entity: &EntityDescriptor,
        id: i64,
    ) -> Result<Option<Record>, StoreError> {
        let entity = entity.clone();
        run_in_unit_of_work(self, move |uow| {
            Box::pin(async move { uow.fetch_by_id(&entity, id).await })
        })
        .await
    }

    /// Upsert a single record in its own unit of work.
    async fn upsert(&self, entity: &EntityDescriptor, record: &Record) -> Result<(), StoreError> {
        let entity = entity.clone();
        let record = record.clone();
        run_in_unit_of_work(self, move |uow| {
            Box::pin(async move { uow.upsert(&entity, &record).await })
        })
        .await
    }
}

/// Run `f` inside a fresh unit of work on `store`.
///
/// Commits when `f` succeeds and rolls back when it fails. If the future is
/// dropped midway the unit of work is dropped with it, which also discards
/// its writes and releases the session.
///
/// # Errors
///
/// Returns the error raised by `f`, or by `begin`/`commit` themselves.
pub async fn run_in_unit_of_work<S, T, F>(store: &S, f: F) -> Result<T, StoreError>
where
    S: StoreHandle + ?Sized,
    T: Send,
    F: for<'u> FnOnce(&'u mut dyn UnitOfWork) -> BoxFuture<'u, Result<T, StoreError>> + Send,
{
    let mut uow = store.begin().await?;
    let result = f(uow.as_mut()).await;
    match result {
        Ok(value) => {
            uow.commit().await?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback_err) = uow.rollback().await {
                warn!(store = store.name(), error = %rollback_err, "Rollback failed");
            }
            Err(e)
        }
    }
}
