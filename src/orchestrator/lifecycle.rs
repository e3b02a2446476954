// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Background loop management: start, stop, run loop.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, error, info, warn};

use super::{Inner, SyncOrchestrator, Worker};
use crate::journal::SyncDirection;
use crate::metrics;

impl SyncOrchestrator {
    /// Spawn the background upload loop.
    ///
    /// Returns `false` without doing anything if auto sync is disabled or a
    /// loop is already running. Must be called from within a Tokio runtime.
    #[tracing::instrument(skip(self))]
    pub fn start(&self) -> bool {
        let config = self.inner.config_rx.borrow().clone();
        if !config.auto_sync_enabled {
            info!("Auto sync disabled, background loop not started");
            return false;
        }

        let mut worker = self.worker.lock();
        if self.inner.state.is_running() {
            debug!("Background loop already running");
            return false;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.inner.state.set_running(true);
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move { inner.run_loop(shutdown_rx).await });
        *worker = Some(Worker {
            handle,
            shutdown: shutdown_tx,
        });

        info!(interval_secs = config.sync_interval_secs, "Background sync started");
        true
    }

    /// Signal the loop to exit and wait up to `stop_timeout_secs` for it.
    ///
    /// A cycle already in progress runs to completion. Returns `false` if
    /// the loop did not exit in time; it is then abandoned, not aborted.
    #[tracing::instrument(skip(self))]
    pub async fn stop(&self) -> bool {
        self.inner.state.set_running(false);
        let Some(Worker { handle, shutdown }) = self.worker.lock().take() else {
            return true;
        };
        let _ = shutdown.send(true);

        let limit = self.inner.config_rx.borrow().stop_timeout();
        match timeout(limit, handle).await {
            Ok(Ok(())) => {
                info!("Background sync stopped");
                true
            }
            Ok(Err(e)) => {
                error!(error = %e, "Background sync task failed");
                true
            }
            Err(_) => {
                warn!(timeout = ?limit, "Background sync did not stop in time, abandoning it");
                false
            }
        }
    }
}

impl Inner {
    pub(super) async fn run_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut config_rx = self.config_rx.clone();

        'cycles: loop {
            if *shutdown.borrow() {
                break;
            }
            // Also catches a switch-off sent before this task first ran
            let config = config_rx.borrow_and_update().clone();
            if !config.auto_sync_enabled {
                info!("Auto sync switched off, stopping background loop");
                self.state.set_running(false);
                break;
            }
            let interval = config.sync_interval();
            self.background_cycle().await;

            let deadline = Instant::now() + interval;
            loop {
                tokio::select! {
                    () = sleep_until(deadline) => break,

                    _ = shutdown.changed() => break 'cycles,

                    Ok(()) = config_rx.changed() => {
                        let config = config_rx.borrow_and_update().clone();
                        if !config.auto_sync_enabled {
                            info!("Auto sync switched off, stopping background loop");
                            self.state.set_running(false);
                            break 'cycles;
                        }
                        // Takes effect from the next sleep
                        debug!(interval_secs = config.sync_interval_secs, "Sync interval updated");
                    }
                }
            }
        }
        debug!("Background loop exited");
    }

    /// One background iteration: probe, then upload if the remote answers.
    async fn background_cycle(&self) {
        let reachable = self.remote.probe().await;
        metrics::set_remote_reachable(reachable);
        if !reachable {
            let failures = self.remote.connection_state().consecutive_failures;
            warn!(remote = self.remote.name(), failures, "Remote store unreachable, skipping sync cycle");
            metrics::record_skipped_cycle();
            return;
        }

        self.run_direction(SyncDirection::Upload).await;
    }
}
