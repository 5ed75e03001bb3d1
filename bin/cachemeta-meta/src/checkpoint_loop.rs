//! Periodic checkpoint trigger
//!
//! Every interval the loop starts a checkpoint unless the node is not a
//! ready master or the previous attempt is still running. Attempts run in
//! their own tasks so a slow checkpoint never delays the ticker; failures
//! are recorded and logged, never fatal.

use crate::service::MetadataService;
use cachemeta_common::{CheckpointId, unix_millis};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info};

/// Observable loop history
#[derive(Clone, Debug, Default, Serialize)]
pub struct CheckpointLoopStats {
    pub triggered: u64,
    pub skipped: u64,
    /// Ticks that found the previous attempt still running
    pub skipped_in_flight: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub last_checkpoint: Option<CheckpointId>,
    pub last_success_ms: Option<u64>,
    pub last_error: Option<String>,
    pub last_error_ms: Option<u64>,
}

pub struct CheckpointLoop {
    service: Arc<MetadataService>,
    interval: Duration,
    in_flight: AtomicBool,
    stats: Mutex<CheckpointLoopStats>,
}

/// Clears the in-flight flag when an attempt ends, however it ends
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl CheckpointLoop {
    pub fn new(service: Arc<MetadataService>, interval: Duration) -> Self {
        Self {
            service,
            interval,
            in_flight: AtomicBool::new(false),
            stats: Mutex::new(CheckpointLoopStats::default()),
        }
    }

    #[must_use]
    pub fn stats(&self) -> CheckpointLoopStats {
        self.stats.lock().clone()
    }

    /// Tick until `shutdown` turns true (or its sender is dropped)
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("Checkpoint loop started (interval {:?})", self.interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.wait_for(|stopping| *stopping) => break,
            }
            self.tick(&shutdown);
        }
        info!("Checkpoint loop stopped");
    }

    /// Start one checkpoint attempt in the background. Returns false when
    /// the attempt was skipped: the node is not a ready master, or the
    /// previous attempt has not finished.
    pub fn tick(self: &Arc<Self>, shutdown: &watch::Receiver<bool>) -> bool {
        if self.service.force_client_retries() {
            self.stats.lock().skipped += 1;
            debug!("Skipping checkpoint: node is not a ready master");
            return false;
        }
        if self.in_flight.swap(true, Ordering::AcqRel) {
            self.stats.lock().skipped_in_flight += 1;
            debug!("Skipping checkpoint: previous attempt still running");
            return false;
        }
        self.stats.lock().triggered += 1;

        let this = Arc::clone(self);
        let mut shutdown = shutdown.clone();
        tokio::spawn(async move {
            let _in_flight = InFlight(&this.in_flight);
            tokio::select! {
                result = this.service.create_checkpoint() => match result {
                    Ok(state) => {
                        let mut stats = this.stats.lock();
                        stats.succeeded += 1;
                        stats.last_checkpoint = Some(state.checkpoint_id);
                        stats.last_success_ms = Some(unix_millis());
                    }
                    Err(e) => {
                        error!("Checkpoint failed: {}", e);
                        let mut stats = this.stats.lock();
                        stats.failed += 1;
                        stats.last_error = Some(e.to_string());
                        stats.last_error_ms = Some(unix_millis());
                    }
                },
                _ = shutdown.wait_for(|stopping| *stopping) => {
                    debug!("Checkpoint attempt abandoned at shutdown");
                }
            }
        });
        true
    }
}
