//! Cluster management store.
//!
//! Tracks machine membership and lifecycle as reported through heartbeats.
//! The state lives in memory and is checkpointed to its own file, in
//! lockstep with metadata store checkpoints.

use crate::store::StoreResult;
use cachemeta_common::{MachineId, MachineLocation, MachineState};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// A machine known to the cluster
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineRecord {
    pub id: MachineId,
    pub location: MachineLocation,
    pub state: MachineState,
    pub last_heartbeat_ms: u64,
}

/// Result of recording a heartbeat
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Registration {
    pub id: MachineId,
    /// The machine was seen for the first time and given a new id
    pub is_new: bool,
}

/// Serializable cluster membership table
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterState {
    /// Last machine id handed out
    pub max_machine_id: u32,
    pub machines: BTreeMap<MachineId, MachineRecord>,
}

impl ClusterState {
    fn insert(
        &mut self,
        id: MachineId,
        location: &MachineLocation,
        state: MachineState,
        now_ms: u64,
    ) {
        self.machines.insert(
            id,
            MachineRecord {
                id,
                location: location.clone(),
                state,
                last_heartbeat_ms: now_ms,
            },
        );
    }

    fn find_by_location(&self, location: &MachineLocation) -> Option<MachineId> {
        self.machines
            .values()
            .find(|m| &m.location == location)
            .map(|m| m.id)
    }
}

/// Cluster membership store with file-backed checkpoints
pub struct ClusterStateStore {
    checkpoint_path: PathBuf,
    state: RwLock<ClusterState>,
}

impl ClusterStateStore {
    /// Create an empty store checkpointing to `checkpoint_path`
    pub fn new(checkpoint_path: impl Into<PathBuf>) -> Self {
        Self {
            checkpoint_path: checkpoint_path.into(),
            state: RwLock::new(ClusterState::default()),
        }
    }

    #[must_use]
    pub fn checkpoint_path(&self) -> &Path {
        &self.checkpoint_path
    }

    /// Record a heartbeat. Machines are identified by location; a machine
    /// seen for the first time is assigned the next free id.
    pub fn heartbeat(
        &self,
        location: &MachineLocation,
        state: MachineState,
        now_ms: u64,
    ) -> Registration {
        let mut cluster = self.state.write();
        let registration = match cluster.find_by_location(location) {
            Some(id) => Registration { id, is_new: false },
            None => {
                cluster.max_machine_id += 1;
                let id = MachineId::new(cluster.max_machine_id);
                info!("Registered {} at {}", id, location);
                Registration { id, is_new: true }
            }
        };
        cluster.insert(registration.id, location, state, now_ms);
        registration
    }

    /// Re-apply a registration whose id was assigned earlier. Later
    /// assignments never reuse `id`.
    pub fn register_with_id(
        &self,
        id: MachineId,
        location: &MachineLocation,
        state: MachineState,
        now_ms: u64,
    ) {
        let mut cluster = self.state.write();
        if let Some(previous) = cluster.find_by_location(location)
            && previous != id
        {
            cluster.machines.remove(&previous);
        }
        cluster.max_machine_id = cluster.max_machine_id.max(id.value());
        cluster.insert(id, location, state, now_ms);
        debug!("Re-registered {} at {}", id, location);
    }

    /// Machines that are closed, dead, or silent for longer than `threshold_ms`
    pub fn inactive_machines(&self, now_ms: u64, threshold_ms: u64) -> Vec<MachineId> {
        self.state
            .read()
            .machines
            .values()
            .filter(|m| {
                m.state != MachineState::Open
                    || now_ms.saturating_sub(m.last_heartbeat_ms) > threshold_ms
            })
            .map(|m| m.id)
            .collect()
    }

    #[must_use]
    pub fn snapshot(&self) -> ClusterState {
        self.state.read().clone()
    }

    pub fn reset(&self) {
        *self.state.write() = ClusterState::default();
    }

    /// Write the current state to the checkpoint file (tmp + rename)
    pub fn checkpoint(&self) -> StoreResult<()> {
        let bytes = bincode::serialize(&*self.state.read())?;
        if let Some(parent) = self.checkpoint_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.checkpoint_path.with_extension("tmp");
        std::fs::write(&tmp, &bytes)?;
        std::fs::rename(&tmp, &self.checkpoint_path)?;
        debug!(
            "Checkpointed cluster state ({} bytes) to {:?}",
            bytes.len(),
            self.checkpoint_path
        );
        Ok(())
    }

    /// Replace the in-memory state with the checkpoint file. A missing file
    /// restores the empty state. Returns the number of machines restored.
    pub fn restore(&self) -> StoreResult<usize> {
        let restored = match std::fs::read(&self.checkpoint_path) {
            Ok(bytes) => bincode::deserialize::<ClusterState>(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => ClusterState::default(),
            Err(e) => return Err(e.into()),
        };
        let count = restored.machines.len();
        *self.state.write() = restored;
        info!("Restored cluster state with {} machines", count);
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_heartbeat_assigns_stable_ids() {
        let store = ClusterStateStore::new("/nonexistent/cluster.bin");
        let a = MachineLocation::new("grpc://a:7089");
        let b = MachineLocation::new("grpc://b:7089");

        let first_a = store.heartbeat(&a, MachineState::Open, 1);
        let id_b = store.heartbeat(&b, MachineState::Open, 1).id;
        assert!(first_a.is_new);
        assert_ne!(first_a.id, id_b);

        let again = store.heartbeat(&a, MachineState::Open, 2);
        assert_eq!(again.id, first_a.id);
        assert!(!again.is_new);
        assert!(first_a.id.is_valid() && id_b.is_valid());
    }

    #[test]
    fn test_register_with_id_reserves_the_id() {
        let store = ClusterStateStore::new("/nonexistent/cluster.bin");
        let late = MachineLocation::new("grpc://late:7089");
        store.register_with_id(MachineId::new(5), &late, MachineState::Open, 1);

        let new = MachineLocation::new("grpc://new:7089");
        let fresh = store.heartbeat(&new, MachineState::Open, 2);
        assert_eq!(fresh.id, MachineId::new(6));

        let again = store.heartbeat(&late, MachineState::Open, 3);
        assert_eq!(again.id, MachineId::new(5));
        assert!(!again.is_new);
    }

    #[test]
    fn test_inactive_machines() {
        let store = ClusterStateStore::new("/nonexistent/cluster.bin");
        let fresh = store
            .heartbeat(&MachineLocation::new("fresh"), MachineState::Open, 1_000)
            .id;
        let stale = store
            .heartbeat(&MachineLocation::new("stale"), MachineState::Open, 0)
            .id;
        let closed = store
            .heartbeat(&MachineLocation::new("closed"), MachineState::Closed, 1_000)
            .id;

        let inactive = store.inactive_machines(1_000, 500);
        assert!(!inactive.contains(&fresh));
        assert!(inactive.contains(&stale));
        assert!(inactive.contains(&closed));
    }

    #[test]
    fn test_checkpoint_restore() {
        let dir = tempdir().unwrap();
        let store = ClusterStateStore::new(dir.path().join("cluster.bin"));

        // Nothing checkpointed yet
        assert_eq!(store.restore().unwrap(), 0);

        store.heartbeat(&MachineLocation::new("a"), MachineState::Open, 5);
        store.checkpoint().unwrap();
        store.heartbeat(&MachineLocation::new("b"), MachineState::Open, 6);
        assert_eq!(store.snapshot().machines.len(), 2);

        assert_eq!(store.restore().unwrap(), 1);
        let restored = store.snapshot();
        assert_eq!(restored.max_machine_id, 1);

        // Ids keep increasing after a restore
        let next = store.heartbeat(&MachineLocation::new("c"), MachineState::Open, 7);
        assert_eq!(next.id, MachineId::new(2));
    }
}
