// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Connection health tracking for a store handle.
//!
//! The remote store is expected to come and go (VPN down, laptop offline),
//! so losing it is a state to record, not an error to raise. Every probe and
//! every unit-of-work failure classified as unavailable feeds the tracker.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::Mutex;

use crate::storage::traits::StoreError;

/// Point-in-time view of a store's connectivity.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConnectionState {
    /// Whether the last interaction with the store succeeded.
    pub connected: bool,
    pub consecutive_failures: u64,
    /// When the store was last probed, and what the probe said.
    pub last_probe: Option<(DateTime<Utc>, bool)>,
}

#[derive(Debug, Default)]
pub struct ConnectionHealth {
    /// Starts false: connections are established lazily on first use
    connected: AtomicBool,
    failures: AtomicU64,
    last_probe: RwLock<Option<(DateTime<Utc>, bool)>>,
    /// Serializes probes so concurrent callers don't stampede the server
    probing: Mutex<()>,
}

impl ConnectionHealth {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self) {
        self.failures.store(0, Ordering::Release);
        self.connected.store(true, Ordering::Release);
    }

    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::AcqRel);
        self.connected.store(false, Ordering::Release);
    }

    /// Record the outcome of an operation, only counting availability failures.
    pub fn observe<T>(&self, result: &Result<T, StoreError>) {
        match result {
            Ok(_) => self.record_success(),
            Err(e) if e.is_transient() => self.record_failure(),
            Err(_) => {}
        }
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::Acquire)
    }

    /// Run `ping` as a probe and record its outcome. Never fails.
    pub async fn probe<F, Fut>(&self, ping: F) -> bool
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), StoreError>>,
    {
        let _guard = self.probing.lock().await;

        let reachable = ping().await.is_ok();
        if reachable {
            self.record_success();
        } else {
            self.record_failure();
        }
        *self.last_probe.write() = Some((Utc::now(), reachable));
        reachable
    }

    #[must_use]
    pub fn snapshot(&self) -> ConnectionState {
        ConnectionState {
            connected: self.is_connected(),
            consecutive_failures: self.failure_count(),
            last_probe: *self.last_probe.read(),
        }
    }
}
