// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Append-only sync journal.
//!
//! Every replication attempt leaves exactly one entry per direction. Entries
//! are written in their own transaction against the local store, separate
//! from the replication's unit of work, so a failed cycle is still recorded
//! after its writes have been rolled back.
//!
//! ```text
//! sync_journal
//! ┌────┬───────────────────────────┬───────────┬─────────┬──────────┬──────────────────────┐
//! │ id │ timestamp                 │ direction │ status  │ affected │ message              │
//! ├────┼───────────────────────────┼───────────┼─────────┼──────────┼──────────────────────┤
//! │  1 │ 2025-03-01T08:00:00+00:00 │ upload    │ success │       42 │ replicated 42 record │
//! │  2 │ 2025-03-01T08:05:00+00:00 │ upload    │ error   │        0 │ integrity violation… │
//! └────┴───────────────────────────┴───────────┴─────────┴──────────┴──────────────────────┘
//! ```

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sqlx::{AnyPool, Row};
use tracing::debug;

use crate::storage::sql::{classify, Dialect, SqlStore};
use crate::storage::traits::StoreError;

/// Which way records flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncDirection {
    /// Local to remote.
    Upload,
    /// Remote to local.
    Download,
    /// Upload, then download.
    Bidirectional,
}

impl SyncDirection {
    /// Single-direction legs, in execution order.
    #[must_use]
    pub fn legs(self) -> &'static [SyncDirection] {
        match self {
            Self::Upload => &[Self::Upload],
            Self::Download => &[Self::Download],
            Self::Bidirectional => &[Self::Upload, Self::Download],
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Upload => "upload",
            Self::Download => "download",
            Self::Bidirectional => "bidirectional",
        }
    }
}

impl fmt::Display for SyncDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncDirection {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "upload" => Ok(Self::Upload),
            "download" => Ok(Self::Download),
            "bidirectional" => Ok(Self::Bidirectional),
            other => Err(StoreError::Backend(format!("unknown sync direction '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JournalStatus {
    Success,
    Error,
    /// Accepted when reading older journals; never written by this crate.
    Partial,
}

impl JournalStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
            Self::Partial => "partial",
        }
    }
}

impl fmt::Display for JournalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JournalStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(Self::Success),
            "error" => Ok(Self::Error),
            "partial" => Ok(Self::Partial),
            other => Err(StoreError::Backend(format!("unknown journal status '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub timestamp: DateTime<Utc>,
    pub direction: SyncDirection,
    pub status: JournalStatus,
    /// Records written. Always 0 for a failed attempt.
    pub affected_count: u64,
    pub message: String,
}

impl JournalEntry {
    #[must_use]
    pub fn success(direction: SyncDirection, affected_count: u64) -> Self {
        Self {
            timestamp: Utc::now(),
            direction,
            status: JournalStatus::Success,
            affected_count,
            message: format!("{direction} replicated {affected_count} record(s)"),
        }
    }

    #[must_use]
    pub fn failure(direction: SyncDirection, reason: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            direction,
            status: JournalStatus::Error,
            affected_count: 0,
            message: reason.into(),
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == JournalStatus::Success
    }
}

/// Where journal entries go.
#[async_trait]
pub trait JournalSink: Send + Sync {
    /// Append one entry, durably, independent of any replication unit of work.
    async fn record(&self, entry: &JournalEntry) -> Result<(), StoreError>;

    /// Timestamp of the most recent successful entry.
    async fn last_success(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(None)
    }
}

/// A persisted entry with its row identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalRecord {
    pub id: i64,
    pub entry: JournalEntry,
}

/// Journal stored in the `sync_journal` table of the local store.
pub struct SqlJournal {
    pool: AnyPool,
}

impl SqlJournal {
    /// Share `store`'s pool and create the journal table if needed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the table cannot be created.
    pub async fn open(store: &SqlStore) -> Result<Self, StoreError> {
        let id_column = match store.dialect() {
            Dialect::Sqlite => "id INTEGER PRIMARY KEY AUTOINCREMENT",
            Dialect::MySql => "id BIGINT PRIMARY KEY AUTO_INCREMENT",
        };
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS sync_journal (
                {id_column},
                timestamp VARCHAR(40) NOT NULL,
                direction VARCHAR(16) NOT NULL,
                status VARCHAR(16) NOT NULL,
                affected_count BIGINT NOT NULL,
                message TEXT NOT NULL
            )"
        );
        let pool = store.pool();
        sqlx::query(&sql).execute(&pool).await.map_err(classify)?;
        Ok(Self { pool })
    }

    /// Most recent entries first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the journal cannot be read.
    pub async fn recent(&self, limit: u32) -> Result<Vec<JournalRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, timestamp, direction, status, affected_count, message \
             FROM sync_journal ORDER BY id DESC LIMIT ?",
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(classify)?;

        rows.iter()
            .map(|row| {
                let id: i64 = row.try_get("id").map_err(classify)?;
                let timestamp: String = row.try_get("timestamp").map_err(classify)?;
                let direction: String = row.try_get("direction").map_err(classify)?;
                let status: String = row.try_get("status").map_err(classify)?;
                let affected: i64 = row.try_get("affected_count").map_err(classify)?;
                let message: String = row.try_get("message").map_err(classify)?;
                Ok(JournalRecord {
                    id,
                    entry: JournalEntry {
                        timestamp: parse_timestamp(&timestamp)?,
                        direction: direction.parse()?,
                        status: status.parse()?,
                        affected_count: u64::try_from(affected).unwrap_or(0),
                        message,
                    },
                })
            })
            .collect()
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Backend(format!("bad journal timestamp '{raw}': {e}")))
}

#[async_trait]
impl JournalSink for SqlJournal {
    async fn record(&self, entry: &JournalEntry) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(classify)?;
        sqlx::query(
            "INSERT INTO sync_journal (timestamp, direction, status, affected_count, message) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(entry.timestamp.to_rfc3339())
        .bind(entry.direction.as_str())
        .bind(entry.status.as_str())
        .bind(i64::try_from(entry.affected_count).unwrap_or(i64::MAX))
        .bind(entry.message.clone())
        .execute(&mut *tx)
        .await
        .map_err(classify)?;
        tx.commit().await.map_err(classify)?;

        debug!(direction = %entry.direction, status = %entry.status, "Journal entry recorded");
        Ok(())
    }

    async fn last_success(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        let row = sqlx::query(
            "SELECT timestamp FROM sync_journal WHERE status = 'success' ORDER BY id DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(classify)?;

        match row {
            Some(row) => {
                let raw: String = row.try_get("timestamp").map_err(classify)?;
                parse_timestamp(&raw).map(Some)
            }
            None => Ok(None),
        }
    }
}

/// In-process journal for tests and embedders without a local database.
#[derive(Debug, Default)]
pub struct MemoryJournal {
    entries: Mutex<Vec<JournalEntry>>,
}

impl MemoryJournal {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn entries(&self) -> Vec<JournalEntry> {
        self.entries.lock().clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[async_trait]
impl JournalSink for MemoryJournal {
    async fn record(&self, entry: &JournalEntry) -> Result<(), StoreError> {
        self.entries.lock().push(entry.clone());
        Ok(())
    }

    async fn last_success(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self
            .entries
            .lock()
            .iter()
            .rev()
            .find(|e| e.is_success())
            .map(|e| e.timestamp))
    }
}
