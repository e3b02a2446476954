// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQL store handle over the sqlx `Any` driver.
//!
//! The same type backs both sides of replication:
//! - **local**: an SQLite file, opened eagerly at startup (WAL mode, foreign
//!   keys on), schema created immediately
//! - **remote**: the shared MySQL server, connected lazily so that starting
//!   offline is not an error; its schema is created on first use
//!
//! One table per catalogued entity. Columns come straight from the
//! [`EntityDescriptor`], foreign keys become `FOREIGN KEY` constraints:
//!
//! ```sql
//! CREATE TABLE IF NOT EXISTS levels (
//!   id INTEGER PRIMARY KEY,
//!   institution_id INTEGER NOT NULL,
//!   name TEXT NOT NULL,
//!   ...
//!   FOREIGN KEY (institution_id) REFERENCES institutions(id)
//! )
//! ```
//!
//! ## sqlx Any Driver Quirks
//!
//! - Booleans are stored as integers and timestamps as RFC 3339 text so that
//!   both drivers decode them identically.
//! - MySQL `TEXT` columns can come back as bytes through `Any`; text reads
//!   fall back to decoding UTF-8 from `Vec<u8>`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

use async_trait::async_trait;
use sqlx::any::{AnyArguments, AnyPoolOptions, AnyRow};
use sqlx::error::ErrorKind;
use sqlx::query::Query;
use sqlx::{Any, AnyPool, Row, Transaction};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::traits::{StoreError, StoreHandle, UnitOfWork};
use crate::catalog::{EntityCatalog, EntityDescriptor, FieldKind, FieldSpec};
use crate::record::{FieldValue, Record};
use crate::resilience::health::{ConnectionHealth, ConnectionState};
use crate::resilience::retry::{retry, RetryConfig};

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

/// SQL flavour, picked from the connection URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Sqlite,
    MySql,
}

impl Dialect {
    #[must_use]
    pub fn from_url(url: &str) -> Self {
        if url.starts_with("sqlite:") {
            Self::Sqlite
        } else {
            Self::MySql
        }
    }

    fn column_type(self, kind: FieldKind) -> &'static str {
        match (self, kind) {
            (Self::Sqlite, FieldKind::Integer | FieldKind::Boolean) => "INTEGER",
            (Self::Sqlite, FieldKind::Real) => "REAL",
            (Self::Sqlite, FieldKind::Text | FieldKind::Timestamp) => "TEXT",
            (Self::MySql, FieldKind::Integer | FieldKind::Boolean) => "BIGINT",
            (Self::MySql, FieldKind::Real) => "DOUBLE",
            (Self::MySql, FieldKind::Text) => "TEXT",
            (Self::MySql, FieldKind::Timestamp) => "VARCHAR(40)",
        }
    }

    fn column_type_of(self, spec: &FieldSpec) -> &'static str {
        // MySQL cannot index an unbounded TEXT column
        match (self, spec.kind) {
            (Self::MySql, FieldKind::Text) if spec.unique => "VARCHAR(255)",
            (_, kind) => self.column_type(kind),
        }
    }

    fn id_type(self) -> &'static str {
        match self {
            Self::Sqlite => "INTEGER PRIMARY KEY",
            Self::MySql => "BIGINT PRIMARY KEY",
        }
    }
}

/// Translate a sqlx error into the store taxonomy.
pub(crate) fn classify(err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => StoreError::Unavailable(err.to_string()),
        sqlx::Error::Database(db) => {
            let message = db.message().to_string();
            match db.kind() {
                ErrorKind::ForeignKeyViolation
                | ErrorKind::UniqueViolation
                | ErrorKind::NotNullViolation
                | ErrorKind::CheckViolation => StoreError::IntegrityViolation(message),
                _ if looks_like_constraint(&message) => StoreError::IntegrityViolation(message),
                _ => StoreError::Backend(message),
            }
        }
        other => StoreError::Backend(other.to_string()),
    }
}

// Some drivers only report the generic constraint code through `Any`
fn looks_like_constraint(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("foreign key constraint")
        || lower.contains("constraint failed")
        || lower.contains("cannot be null")
        || lower.contains("duplicate entry")
}

fn select_sql(entity: &EntityDescriptor) -> String {
    let columns: Vec<&str> = std::iter::once(entity.id_field)
        .chain(entity.fields().iter().map(|f| f.name))
        .collect();
    format!("SELECT {} FROM {}", columns.join(", "), entity.table)
}

fn upsert_sql(dialect: Dialect, entity: &EntityDescriptor) -> String {
    let names: Vec<&str> = entity.fields().iter().map(|f| f.name).collect();
    let all: Vec<&str> = std::iter::once(entity.id_field).chain(names.iter().copied()).collect();
    let placeholders = vec!["?"; all.len()].join(", ");
    let insert = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        entity.table,
        all.join(", "),
        placeholders
    );

    match dialect {
        Dialect::Sqlite if names.is_empty() => {
            format!("{insert} ON CONFLICT({}) DO NOTHING", entity.id_field)
        }
        Dialect::Sqlite => {
            let updates: Vec<String> = names.iter().map(|n| format!("{n} = excluded.{n}")).collect();
            format!("{insert} ON CONFLICT({}) DO UPDATE SET {}", entity.id_field, updates.join(", "))
        }
        Dialect::MySql if names.is_empty() => {
            format!("{insert} ON DUPLICATE KEY UPDATE {0} = {0}", entity.id_field)
        }
        Dialect::MySql => {
            let updates: Vec<String> = names.iter().map(|n| format!("{n} = VALUES({n})")).collect();
            format!("{insert} ON DUPLICATE KEY UPDATE {}", updates.join(", "))
        }
    }
}

fn bind_field<'q>(
    query: Query<'q, Any, AnyArguments<'q>>,
    entity: &EntityDescriptor,
    spec: &FieldSpec,
    value: Option<&FieldValue>,
) -> Result<Query<'q, Any, AnyArguments<'q>>, StoreError> {
    let value = value.unwrap_or(&FieldValue::Null);
    let query = match (spec.kind, value) {
        (FieldKind::Integer | FieldKind::Boolean, FieldValue::Null) => query.bind(None::<i64>),
        (FieldKind::Real, FieldValue::Null) => query.bind(None::<f64>),
        (FieldKind::Text | FieldKind::Timestamp, FieldValue::Null) => query.bind(None::<String>),
        (FieldKind::Integer | FieldKind::Boolean, v) if v.as_i64().is_some() => {
            query.bind(v.as_i64())
        }
        (FieldKind::Real, FieldValue::Real(v)) => query.bind(*v),
        #[allow(clippy::cast_precision_loss)]
        (FieldKind::Real, FieldValue::Integer(v)) => query.bind(*v as f64),
        (FieldKind::Text | FieldKind::Timestamp, FieldValue::Text(s)) => query.bind(s.clone()),
        (kind, other) => {
            return Err(StoreError::Backend(format!(
                "{}.{}: cannot store {other} in a {kind:?} column",
                entity.table, spec.name
            )))
        }
    };
    Ok(query)
}

fn text_column(row: &AnyRow, name: &str) -> Result<Option<String>, StoreError> {
    // Try String first (SQLite TEXT), then bytes (MySQL TEXT through Any)
    if let Ok(value) = row.try_get::<Option<String>, _>(name) {
        return Ok(value);
    }
    let bytes: Option<Vec<u8>> = row.try_get(name).map_err(classify)?;
    bytes
        .map(|b| String::from_utf8(b).map_err(|e| StoreError::Backend(format!("{name}: {e}"))))
        .transpose()
}

fn decode_row(entity: &EntityDescriptor, row: &AnyRow) -> Result<Record, StoreError> {
    let id: i64 = row.try_get(entity.id_field).map_err(classify)?;
    let mut record = Record::new(id);
    for spec in entity.fields() {
        let value: FieldValue = match spec.kind {
            FieldKind::Integer => row
                .try_get::<Option<i64>, _>(spec.name)
                .map_err(classify)?
                .into(),
            FieldKind::Boolean => row
                .try_get::<Option<i64>, _>(spec.name)
                .map_err(classify)?
                .map(|v| v != 0)
                .into(),
            FieldKind::Real => row
                .try_get::<Option<f64>, _>(spec.name)
                .map_err(classify)?
                .into(),
            FieldKind::Text | FieldKind::Timestamp => text_column(row, spec.name)?.into(),
        };
        record.set(spec.name, value);
    }
    Ok(record)
}

pub struct SqlStore {
    name: String,
    pool: AnyPool,
    dialect: Dialect,
    catalog: Arc<EntityCatalog>,
    health: Arc<ConnectionHealth>,
    schema_ready: AtomicBool,
    schema_lock: Mutex<()>,
}

impl SqlStore {
    /// Open the local store eagerly, retrying transient failures at startup.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the database cannot be opened or its schema
    /// cannot be created.
    pub async fn open_local(
        name: impl Into<String>,
        url: &str,
        catalog: Arc<EntityCatalog>,
    ) -> Result<Self, StoreError> {
        install_drivers();
        let name = name.into();
        let dialect = Dialect::from_url(url);

        let pool = retry("sql_connect", &RetryConfig::startup(), move || async move {
            Self::pool_options(dialect, Duration::from_secs(10))
                .connect(url)
                .await
                .map_err(classify)
        })
        .await?;

        let store = Self::from_pool(name, pool, dialect, catalog);
        if dialect == Dialect::Sqlite {
            store.enable_wal_mode().await?;
        }
        store.ensure_schema().await?;
        store.health.record_success();
        info!(store = %store.name, ?dialect, "Local store ready");
        Ok(store)
    }

    /// Configure the shared store without connecting to it.
    ///
    /// # Errors
    ///
    /// Only fails when the URL itself cannot be parsed.
    pub fn connect_remote(
        name: impl Into<String>,
        url: &str,
        catalog: Arc<EntityCatalog>,
        connect_timeout: Duration,
    ) -> Result<Self, StoreError> {
        install_drivers();
        let dialect = Dialect::from_url(url);
        let pool = Self::pool_options(dialect, connect_timeout)
            .connect_lazy(url)
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(Self::from_pool(name.into(), pool, dialect, catalog))
    }

    fn pool_options(dialect: Dialect, acquire_timeout: Duration) -> AnyPoolOptions {
        let options = AnyPoolOptions::new()
            .max_connections(if dialect == Dialect::Sqlite { 4 } else { 8 })
            .acquire_timeout(acquire_timeout)
            .idle_timeout(Duration::from_secs(300));

        if dialect == Dialect::Sqlite {
            // Per-connection pragmas; journal_mode is persisted in the file instead
            options.after_connect(|conn, _meta| {
                Box::pin(async move {
                    sqlx::query("PRAGMA foreign_keys = ON").execute(&mut *conn).await?;
                    sqlx::query("PRAGMA synchronous = NORMAL").execute(&mut *conn).await?;
                    Ok(())
                })
            })
        } else {
            options
        }
    }

    fn from_pool(name: String, pool: AnyPool, dialect: Dialect, catalog: Arc<EntityCatalog>) -> Self {
        Self {
            name,
            pool,
            dialect,
            catalog,
            health: Arc::new(ConnectionHealth::new()),
            schema_ready: AtomicBool::new(false),
            schema_lock: Mutex::new(()),
        }
    }

    /// Connection pool, shared with the journal.
    #[must_use]
    pub fn pool(&self) -> AnyPool {
        self.pool.clone()
    }

    #[must_use]
    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Close every pooled connection.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn enable_wal_mode(&self) -> Result<(), StoreError> {
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&self.pool)
            .await
            .map_err(classify)?;
        Ok(())
    }

    /// Create every catalog table that does not exist yet, parents first.
    async fn ensure_schema(&self) -> Result<(), StoreError> {
        if self.schema_ready.load(Ordering::Acquire) {
            return Ok(());
        }
        let _guard = self.schema_lock.lock().await;
        if self.schema_ready.load(Ordering::Acquire) {
            return Ok(());
        }

        for entity in self.catalog.ordered_types() {
            let sql = create_table_sql_in(self.dialect, &self.catalog, entity);
            sqlx::query(&sql)
                .execute(&self.pool)
                .await
                .map_err(classify)?;
            debug!(store = %self.name, table = entity.table, "Table ensured");
        }

        self.schema_ready.store(true, Ordering::Release);
        Ok(())
    }
}

/// DDL for `entity`, resolving referenced tables through `catalog`.
fn create_table_sql_in(dialect: Dialect, catalog: &EntityCatalog, entity: &EntityDescriptor) -> String {
    let mut columns = vec![format!("{} {}", entity.id_field, dialect.id_type())];
    columns.extend(entity.fields().iter().map(|f| {
        let null = if f.nullable { "" } else { " NOT NULL" };
        let unique = if f.unique { " UNIQUE" } else { "" };
        format!("{} {}{}{}", f.name, dialect.column_type_of(f), null, unique)
    }));
    for fk in entity.foreign_keys() {
        if let Some(parent) = catalog.get(fk.references) {
            columns.push(format!(
                "FOREIGN KEY ({}) REFERENCES {}({})",
                fk.field, parent.table, parent.id_field
            ));
        }
    }
    format!(
        "CREATE TABLE IF NOT EXISTS {} (\n  {}\n)",
        entity.table,
        columns.join(",\n  ")
    )
}

#[async_trait]
impl StoreHandle for SqlStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn probe(&self) -> bool {
        let reachable = self
            .health
            .probe(|| async {
                sqlx::query("SELECT 1")
                    .execute(&self.pool)
                    .await
                    .map(|_| ())
                    .map_err(classify)
            })
            .await;
        if !reachable {
            debug!(store = %self.name, "Probe failed");
        }
        reachable
    }

    fn connection_state(&self) -> ConnectionState {
        self.health.snapshot()
    }

    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, StoreError> {
        let result = async {
            self.ensure_schema().await?;
            self.pool.begin().await.map_err(classify)
        }
        .await;
        self.health.observe(&result);

        let tx = result?;
        Ok(Box::new(SqlUnitOfWork {
            tx,
            dialect: self.dialect,
            health: Arc::clone(&self.health),
        }))
    }
}

struct SqlUnitOfWork {
    tx: Transaction<'static, Any>,
    dialect: Dialect,
    health: Arc<ConnectionHealth>,
}

impl SqlUnitOfWork {
    fn track<T>(&self, result: Result<T, sqlx::Error>) -> Result<T, StoreError> {
        let result = result.map_err(classify);
        if let Err(e) = &result {
            if e.is_transient() {
                self.health.record_failure();
            }
        }
        result
    }
}

#[async_trait]
impl UnitOfWork for SqlUnitOfWork {
    async fn fetch_all(&mut self, entity: &EntityDescriptor) -> Result<Vec<Record>, StoreError> {
        let sql = format!("{} ORDER BY {}", select_sql(entity), entity.id_field);
        let rows = sqlx::query(&sql).fetch_all(&mut *self.tx).await;
        let rows = self.track(rows)?;
        rows.iter().map(|row| decode_row(entity, row)).collect()
    }

    async fn fetch_by_id(
        &mut self,
        entity: &EntityDescriptor,
        id: i64,
    ) -> Result<Option<Record>, StoreError> {
        let sql = format!("{} WHERE {} = ?", select_sql(entity), entity.id_field);
        let row = sqlx::query(&sql).bind(id).fetch_optional(&mut *self.tx).await;
        let row = self.track(row)?;
        row.map(|r| decode_row(entity, &r)).transpose()
    }

    async fn upsert(&mut self, entity: &EntityDescriptor, record: &Record) -> Result<(), StoreError> {
        let sql = upsert_sql(self.dialect, entity);
        let mut query = sqlx::query(&sql).bind(record.id());
        for spec in entity.fields() {
            query = bind_field(query, entity, spec, record.get(spec.name))?;
        }
        let result = query.execute(&mut *self.tx).await;
        self.track(result)?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let health = Arc::clone(&self.health);
        let result = self.tx.commit().await.map_err(classify);
        health.observe(&result);
        result
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.rollback().await.map_err(|e| {
            warn!(error = %e, "Transaction rollback failed");
            classify(e)
        })
    }
}
