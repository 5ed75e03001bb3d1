//! Redb table definitions for persistent metadata storage.

use redb::TableDefinition;

// Key: hex content hash, Value: bincode-encoded ContentLocationEntry
pub const CONTENT_LOCATIONS: TableDefinition<&str, &[u8]> =
    TableDefinition::new("content_locations");
// Key: hex content hash, Value: raw blob body
pub const BLOBS: TableDefinition<&str, &[u8]> = TableDefinition::new("blobs");
// Key: "<weak hex>:<selector hex>", Value: bincode-encoded MetadataEntry
pub const METADATA: TableDefinition<&str, &[u8]> = TableDefinition::new("metadata");
// Scalar bookkeeping values (log cursor)
pub const GLOBAL_ENTRIES: TableDefinition<&str, &[u8]> = TableDefinition::new("global_entries");

/// Every table, in the order snapshots copy them
pub const ALL: [TableDefinition<&str, &[u8]>; 4] =
    [CONTENT_LOCATIONS, BLOBS, METADATA, GLOBAL_ENTRIES];
