//! Persistent metadata store backed by redb.
//!
//! Holds content locations, blob bodies, compare-exchange metadata records
//! and the global-entries namespace. Every mutation is a single write
//! transaction; reads use read transactions and therefore see a consistent
//! snapshot, which is what lets checkpoints run next to live traffic.

use crate::tables;
use crate::types::{CompareExchangeOutcome, ContentLocationEntry, MetadataEntry, PutBlobOutcome};
use cachemeta_common::{ContentHash, Fingerprint, MachineId, Selector, StrongFingerprint};
use redb::{Database, ReadableTable, TableError};
use std::path::Path;
use tracing::{debug, info, warn};

/// Error type for metadata store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("redb error: {0}")]
    Redb(#[from] redb::DatabaseError),
    #[error("redb storage error: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("redb table error: {0}")]
    Table(#[from] redb::TableError),
    #[error("redb transaction error: {0}")]
    Transaction(Box<redb::TransactionError>),
    #[error("redb commit error: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("snapshot target already exists: {0}")]
    SnapshotExists(String),
}

impl From<redb::TransactionError> for StoreError {
    fn from(e: redb::TransactionError) -> Self {
        Self::Transaction(Box::new(e))
    }
}

impl From<StoreError> for cachemeta_common::Error {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Io(io) => Self::DiskIo(io),
            StoreError::Bincode(e) => Self::Deserialization(e.to_string()),
            other => Self::Storage(other.to_string()),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Entry counts per table, reported by snapshots and the status endpoint
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct StoreCounts {
    pub content_locations: u64,
    pub blobs: u64,
    pub metadata: u64,
    pub global_entries: u64,
}

impl StoreCounts {
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.content_locations + self.blobs + self.metadata + self.global_entries
    }
}

/// Persistent metadata store backed by redb.
pub struct MetadataStore {
    db: Database,
}

impl MetadataStore {
    /// Open (or create) the redb database at the given path.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;

        // Create all tables eagerly so later read txns don't fail
        let write_txn = db.begin_write()?;
        for def in tables::ALL {
            let _t = write_txn.open_table(def)?;
        }
        write_txn.commit()?;

        info!("Opened metadata store at {:?}", path);
        Ok(Self { db })
    }

    // ---- Content locations (bincode) ----

    /// Register `machine` as a location of every listed hash in one
    /// transaction. Returns the number of entries that changed.
    pub fn register_locations(
        &self,
        machine: MachineId,
        hashes: &[(ContentHash, u64)],
        touched_ms: u64,
    ) -> StoreResult<usize> {
        let write_txn = self.db.begin_write()?;
        let mut changed = 0;
        {
            let mut table = write_txn.open_table(tables::CONTENT_LOCATIONS)?;
            for (hash, size) in hashes {
                let key = hash.to_hex();
                let mut entry: ContentLocationEntry = match table.get(key.as_str())? {
                    Some(val) => bincode::deserialize(val.value())?,
                    None => ContentLocationEntry::default(),
                };
                if entry.add_machine(machine, *size, touched_ms) {
                    let bytes = bincode::serialize(&entry)?;
                    table.insert(key.as_str(), bytes.as_slice())?;
                    changed += 1;
                }
            }
        }
        write_txn.commit()?;
        Ok(changed)
    }

    pub fn get_locations(
        &self,
        hashes: &[ContentHash],
    ) -> StoreResult<Vec<(ContentHash, Option<ContentLocationEntry>)>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(tables::CONTENT_LOCATIONS)?;
        let mut result = Vec::with_capacity(hashes.len());
        for hash in hashes {
            let entry = match table.get(hash.to_hex().as_str())? {
                Some(val) => Some(bincode::deserialize(val.value())?),
                None => None,
            };
            result.push((*hash, entry));
        }
        Ok(result)
    }

    // ---- Blobs (raw bytes) ----

    pub fn put_blob(&self, hash: &ContentHash, data: &[u8], max_size: usize) -> StoreResult<PutBlobOutcome> {
        if data.len() > max_size {
            return Ok(PutBlobOutcome::TooLarge {
                size: data.len(),
                max: max_size,
            });
        }

        let key = hash.to_hex();
        let write_txn = self.db.begin_write()?;
        let stored = {
            let mut table = write_txn.open_table(tables::BLOBS)?;
            let exists = table.get(key.as_str())?.is_some();
            if !exists {
                table.insert(key.as_str(), data)?;
            }
            !exists
        };
        if stored {
            write_txn.commit()?;
            Ok(PutBlobOutcome::Stored)
        } else {
            Ok(PutBlobOutcome::AlreadyExists)
        }
    }

    pub fn get_blob(&self, hash: &ContentHash) -> StoreResult<Option<Vec<u8>>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(tables::BLOBS)?;
        Ok(table.get(hash.to_hex().as_str())?.map(|v| v.value().to_vec()))
    }

    // ---- Metadata records (bincode, composite key) ----

    /// Replace the entry under `key` only if its current replacement token
    /// equals `expected_token`. `None` means the key must be absent.
    pub fn compare_exchange(
        &self,
        key: &StrongFingerprint,
        expected_token: Option<&str>,
        replacement: MetadataEntry,
    ) -> StoreResult<CompareExchangeOutcome> {
        let storage_key = key.storage_key();
        let write_txn = self.db.begin_write()?;
        let outcome = {
            let mut table = write_txn.open_table(tables::METADATA)?;
            // Read and compare, then drop the guard before mutating
            let current: Option<MetadataEntry> = match table.get(storage_key.as_str())? {
                Some(val) => Some(bincode::deserialize(val.value())?),
                None => None,
            };
            let matches = match (&current, expected_token) {
                (None, None) => true,
                (Some(entry), Some(token)) => entry.replacement_token == token,
                _ => false,
            };
            if matches {
                let bytes = bincode::serialize(&replacement)?;
                table.insert(storage_key.as_str(), bytes.as_slice())?;
                CompareExchangeOutcome {
                    exchanged: true,
                    current: Some(replacement),
                }
            } else {
                CompareExchangeOutcome {
                    exchanged: false,
                    current,
                }
            }
        };
        if outcome.exchanged {
            write_txn.commit()?;
        }
        Ok(outcome)
    }

    pub fn get_metadata(&self, key: &StrongFingerprint) -> StoreResult<Option<MetadataEntry>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(tables::METADATA)?;
        match table.get(key.storage_key().as_str())? {
            Some(val) => Ok(Some(bincode::deserialize(val.value())?)),
            None => Ok(None),
        }
    }

    /// Selectors recorded under `weak`, most recently updated first.
    /// Returns the requested page and whether more pages follow.
    pub fn get_selectors(
        &self,
        weak: &Fingerprint,
        offset: usize,
        limit: usize,
    ) -> StoreResult<(Vec<(Selector, MetadataEntry)>, bool)> {
        let prefix = StrongFingerprint::weak_prefix(weak);
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(tables::METADATA)?;

        let mut found = Vec::new();
        for entry in table.range::<&str>(prefix.as_str()..)? {
            let (key, value) = entry?;
            let Some(selector_hex) = key.value().strip_prefix(prefix.as_str()) else {
                break;
            };
            let Some(selector) = Selector::from_hex(selector_hex) else {
                warn!("Skipping malformed metadata key '{}'", key.value());
                continue;
            };
            let entry: MetadataEntry = bincode::deserialize(value.value())?;
            found.push((selector, entry));
        }

        found.sort_by(|a, b| {
            b.1.last_update_ms
                .cmp(&a.1.last_update_ms)
                .then_with(|| a.0.as_bytes().cmp(b.0.as_bytes()))
        });
        let has_more = found.len() > offset.saturating_add(limit);
        let page = found.into_iter().skip(offset).take(limit).collect();
        Ok((page, has_more))
    }

    // ---- Global entries ----

    pub fn get_global(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(tables::GLOBAL_ENTRIES)?;
        Ok(table.get(key)?.map(|v| v.value().to_vec()))
    }

    pub fn set_global(&self, key: &str, value: &[u8]) -> StoreResult<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(tables::GLOBAL_ENTRIES)?;
            table.insert(key, value)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    // ---- Snapshots ----

    /// Copy every table into a fresh database at `path`, reading through a
    /// single read transaction so the copy is point-in-time consistent.
    pub fn snapshot_to(&self, path: impl AsRef<Path>) -> StoreResult<StoreCounts> {
        let path = path.as_ref();
        if path.exists() {
            return Err(StoreError::SnapshotExists(path.display().to_string()));
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let target = Database::create(path)?;
        let read_txn = self.db.begin_read()?;
        let write_txn = target.begin_write()?;
        let mut counts = [0u64; 4];
        for (i, def) in tables::ALL.into_iter().enumerate() {
            let source = read_txn.open_table(def)?;
            let mut dest = write_txn.open_table(def)?;
            for entry in source.iter()? {
                let (key, value) = entry?;
                dest.insert(key.value(), value.value())?;
                counts[i] += 1;
            }
        }
        write_txn.commit()?;

        let counts = StoreCounts {
            content_locations: counts[0],
            blobs: counts[1],
            metadata: counts[2],
            global_entries: counts[3],
        };
        debug!("Snapshot of {} entries written to {:?}", counts.total(), path);
        Ok(counts)
    }

    /// Replace the whole store content with the snapshot at `path`, in a
    /// single write transaction.
    pub fn restore_from(&self, path: impl AsRef<Path>) -> StoreResult<StoreCounts> {
        let path = path.as_ref();
        let source = Database::open(path)?;
        let read_txn = source.begin_read()?;
        let write_txn = self.db.begin_write()?;
        let mut counts = [0u64; 4];
        for (i, def) in tables::ALL.into_iter().enumerate() {
            write_txn.delete_table(def)?;
            let mut dest = write_txn.open_table(def)?;
            let src = match read_txn.open_table(def) {
                Ok(src) => src,
                Err(TableError::TableDoesNotExist(_)) => continue,
                Err(e) => return Err(e.into()),
            };
            for entry in src.iter()? {
                let (key, value) = entry?;
                dest.insert(key.value(), value.value())?;
                counts[i] += 1;
            }
        }
        write_txn.commit()?;

        let counts = StoreCounts {
            content_locations: counts[0],
            blobs: counts[1],
            metadata: counts[2],
            global_entries: counts[3],
        };
        info!("Restored {} entries from {:?}", counts.total(), path);
        Ok(counts)
    }

    /// Drop every entry (restore to the empty state)
    pub fn clear(&self) -> StoreResult<()> {
        let write_txn = self.db.begin_write()?;
        for def in tables::ALL {
            write_txn.delete_table(def)?;
            let _t = write_txn.open_table(def)?;
        }
        write_txn.commit()?;
        info!("Cleared metadata store");
        Ok(())
    }

    pub fn counts(&self) -> StoreResult<StoreCounts> {
        let read_txn = self.db.begin_read()?;
        let mut counts = [0u64; 4];
        for (i, def) in tables::ALL.into_iter().enumerate() {
            let table = read_txn.open_table(def)?;
            for entry in table.iter()? {
                entry?;
                counts[i] += 1;
            }
        }
        Ok(StoreCounts {
            content_locations: counts[0],
            blobs: counts[1],
            metadata: counts[2],
            global_entries: counts[3],
        })
    }
}
