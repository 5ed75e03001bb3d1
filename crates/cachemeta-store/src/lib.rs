//! cachemeta Metadata Store - durable local state of the metadata service
//!
//! This crate holds the redb-backed store of content locations, blobs and
//! compare-exchange metadata records, the global-entries namespace used for
//! scalar bookkeeping, and the cluster management store.

pub mod cluster;
pub mod store;
pub mod tables;
pub mod types;

// Re-exports
pub use cluster::{ClusterState, ClusterStateStore, MachineRecord, Registration};
pub use store::{MetadataStore, StoreCounts, StoreError, StoreResult};
pub use types::{CompareExchangeOutcome, ContentLocationEntry, MetadataEntry, PutBlobOutcome};
