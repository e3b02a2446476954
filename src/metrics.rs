// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for participation-sync.
//!
//! Uses the `metrics` crate for backend-agnostic collection. The embedding
//! application chooses the exporter.
//!
//! # Metric Naming Convention
//! - `participation_sync_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `direction`: upload, download
//! - `status`: success, error
//! - `entity`: catalog entity name

use std::time::{Duration, Instant};

use metrics::{counter, gauge, histogram};

use crate::journal::{JournalStatus, SyncDirection};

/// Record the outcome of one direction of a sync cycle.
pub fn record_cycle(direction: SyncDirection, status: JournalStatus) {
    counter!(
        "participation_sync_sync_cycles_total",
        "direction" => direction.as_str(),
        "status" => status.as_str()
    )
    .increment(1);
}

pub fn record_cycle_duration(direction: SyncDirection, duration: Duration) {
    histogram!(
        "participation_sync_sync_cycle_seconds",
        "direction" => direction.as_str()
    )
    .record(duration.as_secs_f64());
}

/// Records written for one entity type in a committed cycle.
pub fn record_replicated(direction: SyncDirection, entity: &'static str, count: u64) {
    counter!(
        "participation_sync_records_replicated_total",
        "direction" => direction.as_str(),
        "entity" => entity
    )
    .increment(count);
}

pub fn set_remote_reachable(reachable: bool) {
    gauge!("participation_sync_remote_reachable").set(if reachable { 1.0 } else { 0.0 });
}

/// Background cycle skipped because the remote store was unreachable.
pub fn record_skipped_cycle() {
    counter!("participation_sync_skipped_cycles_total").increment(1);
}

pub fn record_journal_write_failure() {
    counter!("participation_sync_journal_write_failures_total").increment(1);
}

/// Records cycle duration when dropped.
pub struct CycleTimer {
    direction: SyncDirection,
    start: Instant,
}

impl CycleTimer {
    #[must_use]
    pub fn new(direction: SyncDirection) -> Self {
        Self {
            direction,
            start: Instant::now(),
        }
    }
}

impl Drop for CycleTimer {
    fn drop(&mut self) {
        record_cycle_duration(self.direction, self.start.elapsed());
    }
}
