//! Metadata service core
//!
//! Ties the readiness state, the checkpoint gate, the event stream and the
//! method handlers together:
//!
//! - role updates promote the node and trigger checkpoint restore + replay
//! - [`MetadataService::execute`] gates every client request on readiness
//!   and logs state-changing requests
//! - [`MetadataService::create_checkpoint`] snapshots the store together
//!   with the log position it covers

use crate::checkpoint::{CheckpointGate, CheckpointManager, CheckpointRegistry};
use crate::handlers::MethodHandlers;
use crate::readiness::{Lifecycle, NodeStatus, ReadinessState};
use crate::replay::{ReplayDispatcher, ReplayOutcome};
use crate::request::{ServiceRequest, ServiceResponse};
use cachemeta_common::config::ServiceConfig;
use cachemeta_common::{
    CheckpointId, CheckpointState, Error, LogId, Result, Role, unix_millis,
};
use cachemeta_events::EventStream;
use cachemeta_store::{ClusterStateStore, MetadataStore, StoreCounts};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Global entry holding the last log position covered by the store
pub const LOG_CURSOR_KEY: &str = "LogCursor";

/// Collaborators the service orchestrates
pub struct ServiceComponents {
    pub store: Arc<MetadataStore>,
    pub cluster: Arc<ClusterStateStore>,
    pub events: Arc<dyn EventStream>,
    pub checkpoints: Arc<dyn CheckpointManager>,
    pub registry: Arc<dyn CheckpointRegistry>,
}

/// Summary of the last successful restore
#[derive(Clone, Debug, Serialize)]
pub struct RestoreReport {
    /// `None` when no checkpoint was registered
    pub checkpoint: Option<CheckpointId>,
    pub replay: ReplayOutcome,
    pub machines: usize,
    pub completed_at_ms: u64,
}

pub struct MetadataService {
    config: ServiceConfig,
    store: Arc<MetadataStore>,
    cluster: Arc<ClusterStateStore>,
    events: Arc<dyn EventStream>,
    checkpoints: Arc<dyn CheckpointManager>,
    registry: Arc<dyn CheckpointRegistry>,
    handlers: Arc<MethodHandlers>,
    readiness: Mutex<ReadinessState>,
    gate: CheckpointGate,
    shutdown: watch::Sender<bool>,
    last_restore: Mutex<Option<RestoreReport>>,
    last_checkpoint: Mutex<Option<CheckpointState>>,
}

impl MetadataService {
    pub fn new(config: ServiceConfig, components: ServiceComponents) -> Self {
        let handlers = Arc::new(MethodHandlers::new(
            Arc::clone(&components.store),
            Arc::clone(&components.cluster),
            &config,
        ));
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            store: components.store,
            cluster: components.cluster,
            events: components.events,
            checkpoints: components.checkpoints,
            registry: components.registry,
            handlers,
            readiness: Mutex::new(ReadinessState::new()),
            gate: CheckpointGate::new(),
            shutdown,
            last_restore: Mutex::new(None),
            last_checkpoint: Mutex::new(None),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Begin accepting role updates. The node starts as a worker with log
    /// writing disabled.
    pub fn startup(&self) {
        self.events.set_logging(false);
        self.readiness.lock().start();
        info!("Metadata service started as worker");
    }

    /// Stop serving: force retries, disable logging and cancel any restore
    /// or checkpoint in flight
    pub fn shutdown(&self) {
        {
            let mut readiness = self.readiness.lock();
            readiness.begin_shutdown();
            self.events.set_logging(false);
        }
        self.shutdown.send_replace(true);
        info!("Metadata service shutting down");
    }

    /// Resolves to `true` once shutdown has begun
    #[must_use]
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    #[must_use]
    pub fn force_client_retries(&self) -> bool {
        self.readiness
            .lock()
            .force_client_retries(Instant::now(), self.config.heartbeat_staleness())
    }

    #[must_use]
    pub fn readiness(&self) -> ReadinessState {
        self.readiness.lock().clone()
    }

    #[must_use]
    pub fn status(&self) -> NodeStatus {
        self.readiness
            .lock()
            .status(Instant::now(), self.config.heartbeat_staleness())
    }

    #[must_use]
    pub fn last_restore(&self) -> Option<RestoreReport> {
        self.last_restore.lock().clone()
    }

    #[must_use]
    pub fn last_checkpoint(&self) -> Option<CheckpointState> {
        self.last_checkpoint.lock().clone()
    }

    pub fn store_counts(&self) -> Result<StoreCounts> {
        Ok(self.store.counts()?)
    }

    /// Role callback from the election mechanism; re-delivered periodically.
    ///
    /// Ignored before startup and after shutdown begins. Otherwise refreshes
    /// the heartbeat, and while the node is a master that has not restored
    /// its checkpoint yet, attempts the restore. A failed restore
    /// leaves the node forcing retries; the next delivery tries again.
    pub async fn on_role_updated(&self, role: Role) -> Result<()> {
        let (generation, restored) = {
            let mut readiness = self.readiness.lock();
            let transition = readiness.on_role_update(role, Instant::now());
            if readiness.lifecycle() != Lifecycle::Running {
                return Ok(());
            }
            if transition.changed() || transition.needs_restore {
                self.events.set_logging(false);
            }
            (transition.generation, readiness.checkpoint_restored())
        };

        if role != Role::Master || restored {
            return Ok(());
        }

        let Some(_gate) = self.gate.try_acquire("restore") else {
            debug!("Checkpoint gate busy; restore deferred to next role update");
            return Ok(());
        };

        let mut shutdown = self.shutdown.subscribe();
        let result = tokio::select! {
            result = self.restore_checkpoint() => result,
            _ = shutdown.wait_for(|stopping| *stopping) => Err(Error::Cancelled),
        };

        match result {
            Ok(report) => {
                let accepted = {
                    let mut readiness = self.readiness.lock();
                    let accepted = readiness.mark_restored(generation);
                    if accepted {
                        self.events.set_logging(true);
                    }
                    accepted
                };
                if accepted {
                    info!(
                        "Restore complete (generation {}); serving as master from {}",
                        generation, report.replay.resume
                    );
                } else {
                    info!(
                        "Restore for generation {} superseded by a newer role change",
                        generation
                    );
                }
                *self.last_restore.lock() = Some(report);
                Ok(())
            }
            Err(Error::Cancelled) => {
                // Snapshot copies outlive the dropped restore; keep the gate
                // until they finish
                self.checkpoints.wait_idle().await;
                info!("Restore cancelled by shutdown");
                Err(Error::Cancelled)
            }
            Err(e) => {
                error!("Checkpoint restore failed: {}; clients keep retrying", e);
                Err(e)
            }
        }
    }

    /// Restore the latest checkpoint and replay everything logged after it.
    /// Callers hold the checkpoint gate.
    async fn restore_checkpoint(&self) -> Result<RestoreReport> {
        let latest = self.registry.get_latest_checkpoint_state().await?;
        let machines = match &latest {
            Some(state) => {
                info!(
                    "Restoring checkpoint {} at {}",
                    state.checkpoint_id, state.sequence_point
                );
                self.checkpoints.restore_checkpoint(state).await?;
                self.cluster.restore()?
            }
            None => {
                info!("No checkpoint registered; rebuilding from the start of the event stream");
                self.store.clear()?;
                self.cluster.reset();
                0
            }
        };

        let cursor = self.read_log_cursor()?;
        if let (Some(state), Some(cursor)) = (&latest, cursor)
            && state.sequence_point.position() != cursor
        {
            warn!(
                "Checkpoint {} is registered at {} but its log cursor is {}",
                state.checkpoint_id, state.sequence_point, cursor
            );
        }
        let from = cursor.map_or(LogId::INITIAL, LogId::next);

        let replay = ReplayDispatcher::new(
            Arc::clone(&self.handlers),
            self.config.max_event_parallelism,
            self.config.replay_queue_capacity,
        )
        .run(self.events.as_ref(), from)
        .await?;

        self.events.seal_or_rotate(replay.resume).await?;

        Ok(RestoreReport {
            checkpoint: latest.map(|s| s.checkpoint_id),
            replay,
            machines,
            completed_at_ms: unix_millis(),
        })
    }

    /// Snapshot the store together with the log position it covers. Waits
    /// for the checkpoint gate; live requests keep flowing meanwhile.
    pub async fn create_checkpoint(&self) -> Result<CheckpointState> {
        let _gate = self.gate.acquire("create").await;

        let point = self.events.before_checkpoint().await?;
        // The cursor must be inside the snapshot it describes
        self.write_log_cursor(point.position())?;
        self.cluster.checkpoint()?;
        let state = self.checkpoints.create_checkpoint(point).await?;
        self.events.after_checkpoint(point).await?;

        *self.last_checkpoint.lock() = Some(state.clone());
        Ok(state)
    }

    /// Request gateway: the only path by which client requests reach the
    /// handlers.
    pub async fn execute(&self, request: ServiceRequest) -> Result<ServiceResponse> {
        let kind = request.kind();
        if !request.replaying && self.force_client_retries() {
            debug!("Forcing retry of {:?}: node is not a ready master", kind);
            return Ok(ServiceResponse::retry(kind));
        }

        let mut response = self.handlers.dispatch(&request)?;
        if request.replaying {
            return Ok(response);
        }

        if response.persist_request {
            let payload = request.body.encode_logged(response.body.as_ref())?;
            match self.events.write_event(kind.tag(), &payload).await {
                Ok(position) => debug!("Logged {:?} at {}", kind, position),
                Err(e) => {
                    warn!("Failed to log {:?}: {}; asking client to retry", kind, e);
                    response.should_retry = true;
                }
            }
        }

        // Role may have flipped while the handler ran
        if self.force_client_retries() {
            response.should_retry = true;
        }
        Ok(response)
    }

    fn read_log_cursor(&self) -> Result<Option<LogId>> {
        match self.store.get_global(LOG_CURSOR_KEY)? {
            Some(bytes) => bincode::deserialize(&bytes)
                .map(Some)
                .map_err(|e| Error::DataCorruption(format!("log cursor: {e}"))),
            None => Ok(None),
        }
    }

    fn write_log_cursor(&self, position: LogId) -> Result<()> {
        let bytes = bincode::serialize(&position)
            .map_err(|e| Error::Serialization(format!("log cursor: {e}")))?;
        self.store.set_global(LOG_CURSOR_KEY, &bytes)?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn log_cursor(&self) -> Option<LogId> {
        self.read_log_cursor().ok().flatten()
    }
}
