//! Core type definitions for cachemeta
//!
//! This module defines the identifiers, content hashes, fingerprints and
//! log positions shared by the store, the event stream and the service.

use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Milliseconds since the Unix epoch
#[must_use]
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// SHA-256 hash identifying a piece of content
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    /// Wrap raw hash bytes
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Hash the given content
    #[must_use]
    pub fn compute(data: &[u8]) -> Self {
        Self(Sha256::digest(data).into())
    }

    /// Parse a hex-encoded hash
    pub fn from_hex(s: &str) -> Result<Self, ContentHashError> {
        let bytes = hex::decode(s).map_err(|_| ContentHashError::InvalidHex)?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|v: Vec<u8>| ContentHashError::InvalidLength(v.len()))?;
        Ok(Self(arr))
    }

    /// Get as bytes
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Hex representation, used as the storage key
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", &self.to_hex()[..12])
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Content hash parsing errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContentHashError {
    #[error("content hash is not valid hex")]
    InvalidHex,
    #[error("content hash must be 32 bytes, got {0}")]
    InvalidLength(usize),
}

/// Identifier of a cache machine inside the cluster
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display, From, Into,
)]
#[display("machine-{_0}")]
pub struct MachineId(u32);

impl MachineId {
    /// Reserved id meaning "not yet assigned"
    pub const INVALID: Self = Self(0);

    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn value(self) -> u32 {
        self.0
    }

    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }
}

/// Network location a machine advertises (e.g. `grpc://host:port`)
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display)]
#[display("{_0}")]
pub struct MachineLocation(String);

impl MachineLocation {
    pub fn new(location: impl Into<String>) -> Self {
        Self(location.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Lifecycle state a machine reports in its heartbeat
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, Display)]
pub enum MachineState {
    #[default]
    Unknown,
    Open,
    DeadUnavailable,
    Closed,
}

/// Weak fingerprint of a build step (groups selectors)
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize, From)]
pub struct Fingerprint(Vec<u8>);

impl Fingerprint {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.to_hex())
    }
}

/// Selector distinguishing strong fingerprints under one weak fingerprint
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize, From)]
pub struct Selector(Vec<u8>);

impl Selector {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        hex::decode(s).ok().map(Self)
    }
}

impl fmt::Debug for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Selector({})", self.to_hex())
    }
}

/// Key of a compare-exchange metadata record
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StrongFingerprint {
    pub weak: Fingerprint,
    pub selector: Selector,
}

impl StrongFingerprint {
    #[must_use]
    pub const fn new(weak: Fingerprint, selector: Selector) -> Self {
        Self { weak, selector }
    }

    /// Storage key: `"<weak hex>:<selector hex>"`. All selectors of one weak
    /// fingerprint share the `"<weak hex>:"` prefix.
    #[must_use]
    pub fn storage_key(&self) -> String {
        format!("{}{}", Self::weak_prefix(&self.weak), self.selector.to_hex())
    }

    #[must_use]
    pub fn weak_prefix(weak: &Fingerprint) -> String {
        format!("{}:", weak.to_hex())
    }
}

/// Position of an entry in the event stream
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display,
)]
#[display("{_0}")]
pub struct LogId(u64);

impl LogId {
    /// Position before the first entry; a cursor at `ORIGIN` reflects nothing.
    pub const ORIGIN: Self = Self(0);
    /// Position of the first entry ever written.
    pub const INITIAL: Self = Self(1);

    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// Successor position
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

/// A log position a checkpoint is anchored to
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display)]
#[display("seq@{_0}")]
pub struct EventSequencePoint(LogId);

impl EventSequencePoint {
    #[must_use]
    pub const fn new(position: LogId) -> Self {
        Self(position)
    }

    #[must_use]
    pub const fn position(self) -> LogId {
        self.0
    }
}

/// Identifier of a checkpoint
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[display("{_0}")]
pub struct CheckpointId(String);

impl CheckpointId {
    /// Generate a new id that sorts by log position
    #[must_use]
    pub fn generate(sequence_point: EventSequencePoint) -> Self {
        Self(format!(
            "ckpt-{:020}-{}",
            sequence_point.position().value(),
            Uuid::new_v4().simple()
        ))
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A registered checkpoint: immutable once created
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointState {
    pub checkpoint_id: CheckpointId,
    pub sequence_point: EventSequencePoint,
    pub created_at_ms: u64,
}

/// This node's designation in the cluster
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Master,
    Worker,
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "master" => Ok(Self::Master),
            "worker" => Ok(Self::Worker),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_id_ordering() {
        assert_eq!(LogId::ORIGIN.next(), LogId::INITIAL);
        assert!(LogId::new(5) < LogId::new(5).next());
        assert_eq!(LogId::new(41).next().value(), 42);
    }

    #[test]
    fn test_content_hash_hex() {
        let hash = ContentHash::compute(b"hello");
        let parsed = ContentHash::from_hex(&hash.to_hex()).unwrap();
        assert_eq!(hash, parsed);
        assert_eq!(
            ContentHash::from_hex("abcd"),
            Err(ContentHashError::InvalidLength(2))
        );
        assert_eq!(ContentHash::from_hex("zz"), Err(ContentHashError::InvalidHex));
    }

    #[test]
    fn test_strong_fingerprint_key_shares_weak_prefix() {
        let weak = Fingerprint::new(vec![0xAB, 0xCD]);
        let a = StrongFingerprint::new(weak.clone(), Selector::new(vec![1]));
        let b = StrongFingerprint::new(weak.clone(), Selector::new(vec![2]));
        let prefix = StrongFingerprint::weak_prefix(&weak);
        assert!(a.storage_key().starts_with(&prefix));
        assert!(b.storage_key().starts_with(&prefix));
        assert_ne!(a.storage_key(), b.storage_key());
    }

    #[test]
    fn test_checkpoint_ids_sort_by_position() {
        let early = CheckpointId::generate(EventSequencePoint::new(LogId::new(9)));
        let late = CheckpointId::generate(EventSequencePoint::new(LogId::new(10)));
        assert!(early.as_str() < late.as_str());
    }

    #[test]
    fn test_role_parse() {
        assert_eq!("Master".parse::<Role>(), Ok(Role::Master));
        assert_eq!("worker".parse::<Role>(), Ok(Role::Worker));
        assert!("leader".parse::<Role>().is_err());
    }

    #[test]
    fn test_machine_id_validity() {
        assert!(!MachineId::INVALID.is_valid());
        assert!(MachineId::new(rand::random::<u16>() as u32 + 1).is_valid());
    }
}
