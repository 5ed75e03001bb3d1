//! Stored types for metadata persistence.
//!
//! These types are serialized to redb via bincode.

use cachemeta_common::MachineId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Where a piece of content can be fetched from
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentLocationEntry {
    pub size: u64,
    pub machines: BTreeSet<MachineId>,
    pub last_touched_ms: u64,
}

impl ContentLocationEntry {
    /// Union `machine` into the entry. Returns true if the entry changed.
    pub fn add_machine(&mut self, machine: MachineId, size: u64, touched_ms: u64) -> bool {
        let added = self.machines.insert(machine);
        let resized = self.size != size && size != 0;
        if resized {
            self.size = size;
        }
        // Max keeps replay order-insensitive
        self.last_touched_ms = self.last_touched_ms.max(touched_ms);
        added || resized
    }
}

/// Compare-exchange metadata record for a strong fingerprint
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataEntry {
    /// Serialized content hash list
    pub content_hash_list: Vec<u8>,
    /// Token a writer must present to replace this entry
    pub replacement_token: String,
    pub last_update_ms: u64,
}

/// Result of storing a blob body
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PutBlobOutcome {
    Stored,
    AlreadyExists,
    TooLarge { size: usize, max: usize },
}

/// Result of a compare-exchange
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompareExchangeOutcome {
    pub exchanged: bool,
    /// Entry stored under the key after the operation
    pub current: Option<MetadataEntry>,
}
