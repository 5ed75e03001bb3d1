//! Event stream error types

use cachemeta_common::LogId;
use thiserror::Error;

/// Event stream error
#[derive(Error, Debug)]
pub enum EventStreamError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Segment or entry failed validation
    #[error("Corrupt event log: {0}")]
    Corrupt(String),

    /// Positions in the log are not contiguous
    #[error("Log gap: expected position {expected}, found {found}")]
    Gap { expected: LogId, found: LogId },

    /// Payload exceeds the per-entry limit
    #[error("Event payload of {size} bytes exceeds the {max} byte limit")]
    EntryTooLarge { size: usize, max: usize },

    /// Writes are rejected while logging is disabled
    #[error("Event logging is disabled")]
    LoggingDisabled,
}

/// Result type for event stream operations
pub type EventStreamResult<T> = Result<T, EventStreamError>;

impl From<EventStreamError> for cachemeta_common::Error {
    fn from(e: EventStreamError) -> Self {
        match e {
            EventStreamError::LoggingDisabled => Self::LogWritingDisabled,
            EventStreamError::Io(io) => Self::EventStream(io.to_string()),
            too_large @ EventStreamError::EntryTooLarge { .. } => {
                Self::EventStream(too_large.to_string())
            }
            EventStreamError::Corrupt(msg) => Self::DataCorruption(msg),
            gap @ EventStreamError::Gap { .. } => Self::DataCorruption(gap.to_string()),
        }
    }
}
