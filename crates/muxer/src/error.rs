//! Muxer error types
//!
//! The caller-facing error set. Connection-level errors live in
//! [`crate::connection::IndexerError`]; these are what the public API
//! surfaces.

use thiserror::Error;

/// Result type for muxer operations
pub type Result<T> = std::result::Result<T, MuxerError>;

/// Errors surfaced by the muxer public API
#[derive(Debug, Error)]
pub enum MuxerError {
    /// Every connection is down and no cache is running
    #[error("all connections down")]
    AllConnsDown,

    /// The muxer is not in the running state
    #[error("not running")]
    NotRunning,

    /// Start called on a muxer that is not in the empty state
    #[error("not ready to start")]
    NotReady,

    /// Tag name is not in the tag table
    #[error("tag not found")]
    TagNotFound,

    /// The tag table is empty or inconsistent
    #[error("tag map invalid")]
    TagMapInvalid,

    /// No destinations were specified
    #[error("no connections specified")]
    NoTargets,

    /// No connection went hot within the allowed window
    #[error("connection timeout")]
    ConnectionTimeout,

    /// A connection-level sync did not complete in time
    #[error("sync timeout")]
    SyncTimeout,

    /// Uniform configuration carries an empty shared secret
    #[error("ingest secret is empty")]
    EmptyAuth,

    /// The emergency queue is at capacity
    #[error("emergency list overflow")]
    EmergencyListOverflow,

    /// Timed out waiting for the channels to drain
    #[error("timed out waiting for ingesters")]
    Timeout,

    /// Timed out waiting to enqueue an entry
    #[error("timed out waiting to write entry")]
    WriteTimeout,

    /// The operation was cancelled by the caller's token
    #[error("operation cancelled")]
    Cancelled,

    /// Every destination reported a terminal failure
    #[error("all connections failed: {0}")]
    AllConnsFailed(String),

    /// No connection could report a usable source address
    #[error("no usable source address")]
    SourceUnavailable,

    /// A tag name failed validation
    #[error(transparent)]
    InvalidTag(#[from] ingest_entry::TagError),

    /// The cache collaborator reported a failure
    #[error("cache error: {0}")]
    Cache(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(MuxerError::AllConnsDown.to_string(), "all connections down");
        assert_eq!(MuxerError::NotRunning.to_string(), "not running");
        assert_eq!(MuxerError::NotReady.to_string(), "not ready to start");
        assert_eq!(MuxerError::TagNotFound.to_string(), "tag not found");
        assert_eq!(MuxerError::NoTargets.to_string(), "no connections specified");
        assert_eq!(
            MuxerError::EmergencyListOverflow.to_string(),
            "emergency list overflow"
        );
        assert!(MuxerError::AllConnsFailed("refused".into())
            .to_string()
            .contains("refused"));
    }

    #[test]
    fn test_error_from_tag_error() {
        let err: MuxerError = ingest_entry::TagError::Empty.into();
        assert!(matches!(err, MuxerError::InvalidTag(_)));
    }
}
