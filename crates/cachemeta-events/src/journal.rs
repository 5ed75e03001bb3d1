//! On-disk format of event log segments
//!
//! A segment starts with a fixed header naming the position of its first
//! entry, followed by length-prefixed, CRC32C-protected entries.

use crate::error::{EventStreamError, EventStreamResult};

use bytes::Bytes;
use cachemeta_common::LogId;
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

/// Magic number for segment file header
const SEGMENT_MAGIC: u64 = 0x4D45_5441_5F45_5654; // "META_EVT"

/// Segment file version
const SEGMENT_VERSION: u32 = 1;

/// Header size: magic (8) + version (4) + first position (8)
pub const SEGMENT_HEADER_LEN: u64 = 20;

/// Entry framing: position (8) + kind (1) + length (4) + crc (4)
const ENTRY_OVERHEAD: u64 = 17;

/// Largest payload a single entry may carry
pub const MAX_PAYLOAD_LEN: usize = 64 * 1024 * 1024;

const SEGMENT_PREFIX: &str = "events-";
const SEGMENT_SUFFIX: &str = ".log";

/// One logged write request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventEntry {
    /// Position in the log
    pub position: LogId,
    /// Method tag of the logged request
    pub kind: u8,
    /// Serialized request
    pub payload: Bytes,
}

impl EventEntry {
    pub fn new(position: LogId, kind: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            position,
            kind,
            payload: payload.into(),
        }
    }

    /// Compute CRC32 checksum
    fn compute_checksum(position: LogId, kind: u8, payload: &[u8]) -> u32 {
        let mut crc = crc32c::crc32c(&position.value().to_le_bytes());
        crc = crc32c::crc32c_append(crc, &[kind]);
        crc32c::crc32c_append(crc, payload)
    }

    /// Bytes this entry occupies in a segment
    #[must_use]
    pub fn encoded_len(&self) -> u64 {
        ENTRY_OVERHEAD + self.payload.len() as u64
    }

    /// Serialize to bytes
    #[must_use]
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len() as usize);
        buf.extend_from_slice(&self.position.value().to_le_bytes());
        buf.push(self.kind);
        buf.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.payload);
        let checksum = Self::compute_checksum(self.position, self.kind, &self.payload);
        buf.extend_from_slice(&checksum.to_le_bytes());
        buf
    }

    /// Read the next entry. `Ok(None)` at a clean end of segment or at a torn
    /// tail (an entry cut short by a crash mid-append).
    pub fn deserialize<R: Read>(reader: &mut R) -> EventStreamResult<Option<Self>> {
        let mut pos_buf = [0u8; 8];
        match read_full(reader, &mut pos_buf)? {
            0 => return Ok(None),
            8 => {}
            _ => return Ok(None),
        }
        let position = LogId::new(u64::from_le_bytes(pos_buf));

        let mut kind_buf = [0u8; 1];
        if read_full(reader, &mut kind_buf)? < 1 {
            return Ok(None);
        }

        let mut len_buf = [0u8; 4];
        if read_full(reader, &mut len_buf)? < 4 {
            return Ok(None);
        }
        let len = u32::from_le_bytes(len_buf) as usize;
        if len > MAX_PAYLOAD_LEN {
            return Err(EventStreamError::Corrupt(format!(
                "entry at position {position} declares {len} payload bytes"
            )));
        }

        let mut payload = vec![0u8; len];
        if read_full(reader, &mut payload)? < len {
            return Ok(None);
        }

        let mut crc_buf = [0u8; 4];
        if read_full(reader, &mut crc_buf)? < 4 {
            return Ok(None);
        }
        let checksum = u32::from_le_bytes(crc_buf);
        if checksum != Self::compute_checksum(position, kind_buf[0], &payload) {
            return Err(EventStreamError::Corrupt(format!(
                "checksum mismatch at position {position}"
            )));
        }

        Ok(Some(Self {
            position,
            kind: kind_buf[0],
            payload: Bytes::from(payload),
        }))
    }
}

/// Fill `buf` as far as the reader allows; returns the bytes read
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> EventStreamResult<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}

/// Write segment header
pub fn write_header<W: Write>(writer: &mut W, first: LogId) -> EventStreamResult<()> {
    writer.write_all(&SEGMENT_MAGIC.to_le_bytes())?;
    writer.write_all(&SEGMENT_VERSION.to_le_bytes())?;
    writer.write_all(&first.value().to_le_bytes())?;
    writer.flush()?;
    Ok(())
}

/// Read segment header, returning the first position it holds
pub fn read_header<R: Read>(reader: &mut R) -> EventStreamResult<LogId> {
    let mut magic_buf = [0u8; 8];
    reader
        .read_exact(&mut magic_buf)
        .map_err(|e| EventStreamError::Corrupt(format!("failed to read magic: {e}")))?;
    if u64::from_le_bytes(magic_buf) != SEGMENT_MAGIC {
        return Err(EventStreamError::Corrupt("invalid segment magic".to_string()));
    }

    let mut version_buf = [0u8; 4];
    reader
        .read_exact(&mut version_buf)
        .map_err(|e| EventStreamError::Corrupt(format!("failed to read version: {e}")))?;
    let version = u32::from_le_bytes(version_buf);
    if version != SEGMENT_VERSION {
        return Err(EventStreamError::Corrupt(format!(
            "unsupported segment version: {version}"
        )));
    }

    let mut first_buf = [0u8; 8];
    reader
        .read_exact(&mut first_buf)
        .map_err(|e| EventStreamError::Corrupt(format!("failed to read first position: {e}")))?;
    Ok(LogId::new(u64::from_le_bytes(first_buf)))
}

/// Path of the segment whose first entry is `first`
#[must_use]
pub fn segment_path(dir: &Path, first: LogId) -> PathBuf {
    dir.join(format!("{SEGMENT_PREFIX}{:020}{SEGMENT_SUFFIX}", first.value()))
}

/// First position encoded in a segment file name
#[must_use]
pub fn parse_segment_name(name: &str) -> Option<LogId> {
    name.strip_prefix(SEGMENT_PREFIX)?
        .strip_suffix(SEGMENT_SUFFIX)?
        .parse::<u64>()
        .ok()
        .map(LogId::new)
}

/// Segments in `dir`, ordered by first position
pub fn list_segments(dir: &Path) -> EventStreamResult<Vec<(LogId, PathBuf)>> {
    let mut segments = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        if let Some(first) = name.to_str().and_then(parse_segment_name) {
            segments.push((first, entry.path()));
        }
    }
    segments.sort_by_key(|(first, _)| *first);
    Ok(segments)
}
