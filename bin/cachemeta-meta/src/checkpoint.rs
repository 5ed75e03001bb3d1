//! Checkpoint creation, registration and restoration
//!
//! A checkpoint is a point-in-time copy of the metadata store (plus the
//! cluster state file) tagged with the event stream position it covers.
//! Checkpoints live in one directory each under a shared root:
//!
//! ```text
//! <root>/
//!   registry.json                    registered checkpoints, oldest first
//!   ckpt-<seq>-<uuid>/
//!     metadata.redb
//!     cluster_state.bin
//! ```

use async_trait::async_trait;
use cachemeta_common::{
    CheckpointId, CheckpointState, Error, EventSequencePoint, Result, unix_millis,
};
use cachemeta_store::MetadataStore;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, trace, warn};

const REGISTRY_FILE: &str = "registry.json";
const STORE_FILE: &str = "metadata.redb";
const CLUSTER_FILE: &str = "cluster_state.bin";

/// Source of the most recent registered checkpoint
#[async_trait]
pub trait CheckpointRegistry: Send + Sync {
    /// `None` when nothing has been registered yet
    async fn get_latest_checkpoint_state(&self) -> Result<Option<CheckpointState>>;
}

/// Creates and restores store snapshots
#[async_trait]
pub trait CheckpointManager: Send + Sync {
    /// Snapshot the store, register it and return its state
    async fn create_checkpoint(&self, sequence_point: EventSequencePoint)
    -> Result<CheckpointState>;

    /// Replace the store contents (and the cluster state file) with the
    /// checkpoint described by `state`
    async fn restore_checkpoint(&self, state: &CheckpointState) -> Result<()>;

    /// Wait until blocking snapshot I/O started by an abandoned call has
    /// finished
    async fn wait_idle(&self) {}
}

/// Single-holder gate shared by checkpoint creation and restoration
#[derive(Default)]
pub struct CheckpointGate {
    lock: Mutex<()>,
}

/// Held for the whole of a gated procedure
pub struct GateGuard<'a> {
    _guard: MutexGuard<'a, ()>,
    holder: &'static str,
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        trace!("Checkpoint gate released by {}", self.holder);
    }
}

impl CheckpointGate {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire without waiting; `None` if another procedure holds the gate
    pub fn try_acquire(&self, holder: &'static str) -> Option<GateGuard<'_>> {
        let guard = self.lock.try_lock().ok()?;
        trace!("Checkpoint gate acquired by {}", holder);
        Some(GateGuard {
            _guard: guard,
            holder,
        })
    }

    /// Wait for the gate
    pub async fn acquire(&self, holder: &'static str) -> GateGuard<'_> {
        let guard = self.lock.lock().await;
        trace!("Checkpoint gate acquired by {}", holder);
        GateGuard {
            _guard: guard,
            holder,
        }
    }

    #[must_use]
    pub fn is_held(&self) -> bool {
        self.lock.try_lock().is_err()
    }
}

/// Persisted list of registered checkpoints
#[derive(Debug, Default, Serialize, Deserialize)]
struct Registry {
    checkpoints: Vec<CheckpointState>,
}

/// Checkpoints stored in a local (or mounted shared) directory
pub struct LocalCheckpointManager {
    root: PathBuf,
    retained: usize,
    store: Arc<MetadataStore>,
    cluster_state_path: PathBuf,
    registry_lock: parking_lot::Mutex<()>,
    /// Held by blocking snapshot I/O until it completes, even when the
    /// calling future was dropped
    io: Arc<Mutex<()>>,
}

impl LocalCheckpointManager {
    /// Manage checkpoints of `store` under `root`, keeping the newest
    /// `retained` ones
    pub fn new(
        root: impl Into<PathBuf>,
        retained: usize,
        store: Arc<MetadataStore>,
        cluster_state_path: impl Into<PathBuf>,
    ) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        info!("Checkpoint directory {:?} (retaining {})", root, retained.max(1));
        Ok(Self {
            root,
            retained: retained.max(1),
            store,
            cluster_state_path: cluster_state_path.into(),
            registry_lock: parking_lot::Mutex::new(()),
            io: Arc::new(Mutex::new(())),
        })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Registered checkpoints, oldest first
    pub fn list(&self) -> Result<Vec<CheckpointState>> {
        Ok(self.load_registry()?.checkpoints)
    }

    fn checkpoint_dir(&self, id: &CheckpointId) -> PathBuf {
        self.root.join(id.as_str())
    }

    fn load_registry(&self) -> Result<Registry> {
        match std::fs::read(self.root.join(REGISTRY_FILE)) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| Error::Deserialization(format!("checkpoint registry: {e}"))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Registry::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn save_registry(&self, registry: &Registry) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(registry)
            .map_err(|e| Error::Serialization(format!("checkpoint registry: {e}")))?;
        let path = self.root.join(REGISTRY_FILE);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Append `state` to the registry and drop checkpoints beyond the
    /// retention limit. Returns the ids that fell out.
    fn register(&self, state: CheckpointState) -> Result<Vec<CheckpointId>> {
        let _guard = self.registry_lock.lock();
        let mut registry = self.load_registry()?;
        registry.checkpoints.push(state);
        registry
            .checkpoints
            .sort_by_key(|s| (s.sequence_point, s.created_at_ms));

        let excess = registry.checkpoints.len().saturating_sub(self.retained);
        let pruned = registry
            .checkpoints
            .drain(..excess)
            .map(|s| s.checkpoint_id)
            .collect();
        self.save_registry(&registry)?;
        Ok(pruned)
    }
}

impl LocalCheckpointManager {
    /// Run blocking snapshot I/O off the async workers
    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let io = Arc::clone(&self.io).lock_owned().await;
        tokio::task::spawn_blocking(move || {
            let _io = io;
            f()
        })
        .await
        .map_err(|e| Error::checkpoint(format!("checkpoint task failed: {e}")))?
    }
}

#[async_trait]
impl CheckpointRegistry for LocalCheckpointManager {
    async fn get_latest_checkpoint_state(&self) -> Result<Option<CheckpointState>> {
        let registry = self.load_registry()?;
        Ok(registry
            .checkpoints
            .into_iter()
            .max_by_key(|s| (s.sequence_point, s.created_at_ms)))
    }
}

#[async_trait]
impl CheckpointManager for LocalCheckpointManager {
    async fn create_checkpoint(
        &self,
        sequence_point: EventSequencePoint,
    ) -> Result<CheckpointState> {
        let checkpoint_id = CheckpointId::generate(sequence_point);
        let dir = self.checkpoint_dir(&checkpoint_id);

        let store = Arc::clone(&self.store);
        let cluster_src = self.cluster_state_path.clone();
        let target = dir.clone();
        let counts = self
            .blocking(move || {
                std::fs::create_dir_all(&target)?;
                let counts = store.snapshot_to(target.join(STORE_FILE))?;
                if cluster_src.exists() {
                    std::fs::copy(&cluster_src, target.join(CLUSTER_FILE))?;
                }
                Ok(counts)
            })
            .await?;

        let state = CheckpointState {
            checkpoint_id,
            sequence_point,
            created_at_ms: unix_millis(),
        };
        let pruned = self.register(state.clone())?;
        for id in pruned {
            let dir = self.checkpoint_dir(&id);
            match std::fs::remove_dir_all(&dir) {
                Ok(()) => debug!("Removed expired checkpoint {}", id),
                Err(e) => warn!("Failed to remove expired checkpoint {:?}: {}", dir, e),
            }
        }

        info!(
            "Created checkpoint {} at {} ({} entries)",
            state.checkpoint_id,
            state.sequence_point,
            counts.total()
        );
        Ok(state)
    }

    async fn restore_checkpoint(&self, state: &CheckpointState) -> Result<()> {
        let dir = self.checkpoint_dir(&state.checkpoint_id);
        let snapshot = dir.join(STORE_FILE);
        if !snapshot.exists() {
            return Err(Error::CheckpointNotFound(state.checkpoint_id.to_string()));
        }

        let store = Arc::clone(&self.store);
        let cluster_src = dir.join(CLUSTER_FILE);
        let cluster_dst = self.cluster_state_path.clone();
        let counts = self
            .blocking(move || {
                let counts = store.restore_from(&snapshot)?;
                if cluster_src.exists() {
                    if let Some(parent) = cluster_dst.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    std::fs::copy(&cluster_src, &cluster_dst)?;
                } else if cluster_dst.exists() {
                    std::fs::remove_file(&cluster_dst)?;
                }
                Ok(counts)
            })
            .await?;

        info!(
            "Restored checkpoint {} at {} ({} entries)",
            state.checkpoint_id,
            state.sequence_point,
            counts.total()
        );
        Ok(())
    }

    async fn wait_idle(&self) {
        drop(self.io.lock().await);
    }
}
