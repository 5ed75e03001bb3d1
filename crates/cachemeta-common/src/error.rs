//! Error types for cachemeta
//!
//! This module defines the common error type shared by the service, the
//! checkpoint machinery and the replay pipeline.

use thiserror::Error;

/// Common result type for cachemeta operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for cachemeta
#[derive(Debug, Error)]
pub enum Error {
    // Storage errors
    #[error("disk I/O error: {0}")]
    DiskIo(#[from] std::io::Error),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("data corruption detected: {0}")]
    DataCorruption(String),

    // Event stream errors
    #[error("event stream error: {0}")]
    EventStream(String),

    #[error("event log writing is disabled")]
    LogWritingDisabled,

    // Checkpoint errors
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    #[error("checkpoint not found: {0}")]
    CheckpointNotFound(String),

    // Dispatch errors
    #[error("unknown method kind {0} in dispatch")]
    UnknownMethod(u8),

    // Lifecycle errors
    #[error("operation cancelled")]
    Cancelled,

    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    // Internal errors
    #[error("internal error: {0}")]
    Internal(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),
}

impl Error {
    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create an event stream error
    pub fn event_stream(msg: impl Into<String>) -> Self {
        Self::EventStream(msg.into())
    }

    /// Create a checkpoint error
    pub fn checkpoint(msg: impl Into<String>) -> Self {
        Self::Checkpoint(msg.into())
    }

    /// Check if this is a retryable error
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::LogWritingDisabled | Self::ServiceUnavailable(_) | Self::EventStream(_)
        )
    }

    /// Programming errors must never be turned into a retry signal
    #[must_use]
    pub fn is_programming_error(&self) -> bool {
        matches!(self, Self::UnknownMethod(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_retryable() {
        assert!(Error::LogWritingDisabled.is_retryable());
        assert!(Error::event_stream("append failed").is_retryable());
        assert!(!Error::UnknownMethod(42).is_retryable());
        assert!(!Error::Cancelled.is_retryable());
    }

    #[test]
    fn test_error_programming() {
        assert!(Error::UnknownMethod(9).is_programming_error());
        assert!(!Error::checkpoint("boom").is_programming_error());
    }

    #[test]
    fn test_error_display() {
        assert_eq!(
            Error::UnknownMethod(200).to_string(),
            "unknown method kind 200 in dispatch"
        );
        assert_eq!(Error::storage("x").to_string(), "storage error: x");
    }
}
