//! Indexer connection interface
//!
//! The wire protocol to a single indexer (authentication, framing, tag
//! negotiation, batch writes, sync) lives behind [`IndexerConnection`];
//! dialing and socket setup live behind [`ConnectionFactory`]. The muxer
//! only ever talks to these traits, which is also what lets the tests run
//! against in-memory fakes.

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

use ingest_entry::{Entry, EntryTag};

use crate::config::TlsConfig;

/// A single destination indexer
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Target {
    /// Destination address, e.g. `tcp://indexer0:4023`
    pub address: String,

    /// Shared ingest secret for this destination
    pub secret: String,
}

/// Record of a destination that entered a terminal failure state
#[derive(Debug, Clone)]
pub struct TargetError {
    /// The failed destination address
    pub address: String,

    /// Description of the terminal error
    pub error: String,
}

/// Everything a factory needs to dial one destination
#[derive(Debug, Clone)]
pub struct ConnectParams {
    /// Destination to dial
    pub target: Target,

    /// Tag names to negotiate during the handshake
    pub tags: Vec<String>,

    /// TLS material
    pub tls: TlsConfig,

    /// Token-bucket rate limit in bytes per second, if configured
    pub rate_limit_bps: Option<i64>,
}

/// Errors from the connection layer
///
/// The fatal variants are configuration-level: retrying the same dial can
/// never succeed, so the owning connection task records the destination as
/// failed and exits. Everything else is transient and retried with backoff.
#[derive(Debug, Error)]
pub enum IndexerError {
    /// Destination string could not be parsed
    #[error("malformed destination: {0}")]
    MalformedDestination(String),

    /// Destination scheme is not a supported connection type
    #[error("invalid connection type: {0}")]
    InvalidConnectionType(String),

    /// Authentication hash generation failed
    #[error("failed to generate auth hash")]
    AuthHashGen,

    /// The indexer refused a tag name
    #[error("forbidden tag: {0}")]
    ForbiddenTag(String),

    /// The local interface address could not be parsed
    #[error("failed to parse local IP")]
    LocalIpParse,

    /// An empty tag name was offered during negotiation
    #[error("empty tag")]
    EmptyTag,

    /// The connection is not in a running state
    #[error("connection not running")]
    NotRunning,

    /// An operation did not complete in time
    #[error("connection operation timed out")]
    Timeout,

    /// A tag was not present in the connection's negotiated set
    #[error("tag not negotiated: {0}")]
    TagNotFound(String),

    /// Socket-level failure
    #[error("connection i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Any other transient failure
    #[error("{0}")]
    Other(String),
}

impl IndexerError {
    /// Whether this error can never be fixed by reconnecting
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::MalformedDestination(_)
                | Self::InvalidConnectionType(_)
                | Self::AuthHashGen
                | Self::ForbiddenTag(_)
                | Self::LocalIpParse
                | Self::EmptyTag
        )
    }
}

/// An authenticated session with one indexer
///
/// Write ordering within one connection is FIFO; `sync` forces an
/// end-to-end flush and acknowledgement. `outstanding_entries` drains the
/// entries the connection accepted but has not yet confirmed, so a dying
/// connection's in-flight data can be recycled.
#[async_trait]
pub trait IndexerConnection: Send + Sync {
    /// Send the ingester identification triple
    async fn identify(&self, name: &str, version: &str, uuid: &str) -> Result<(), IndexerError>;

    /// Whether the indexer is ready to accept entries
    async fn ingest_ok(&self) -> Result<bool, IndexerError>;

    /// Negotiate a tag name, returning the indexer-assigned remote id
    async fn negotiate_tag(&self, name: &str) -> Result<EntryTag, IndexerError>;

    /// Look up a tag negotiated during the handshake
    async fn get_tag(&self, name: &str) -> Option<EntryTag>;

    /// Write a single entry; the tag must already be remote
    async fn write_entry(&self, e: &Entry) -> Result<(), IndexerError>;

    /// Write a batch of entries; tags must already be remote
    async fn write_batch(&self, b: &[Entry]) -> Result<(), IndexerError>;

    /// Flush and wait for acknowledgement of everything written so far
    async fn sync(&self) -> Result<(), IndexerError>;

    /// Tear down the session; idempotent
    async fn close(&self) -> Result<(), IndexerError>;

    /// Drain entries accepted but not yet confirmed by the indexer
    async fn outstanding_entries(&self) -> Vec<Entry>;

    /// Local address this connection egresses from
    async fn source_ip(&self) -> Result<IpAddr, IndexerError>;
}

/// Dials destinations and performs the authentication handshake
///
/// The factory owns socket setup: TLS, keep-alive, and wrapping the stream
/// in a token bucket when `rate_limit_bps` is set.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// Establish an authenticated session with one destination
    async fn connect(
        &self,
        params: &ConnectParams,
    ) -> Result<Arc<dyn IndexerConnection>, IndexerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(IndexerError::MalformedDestination("x".into()).is_fatal());
        assert!(IndexerError::InvalidConnectionType("udp".into()).is_fatal());
        assert!(IndexerError::AuthHashGen.is_fatal());
        assert!(IndexerError::ForbiddenTag("$".into()).is_fatal());
        assert!(IndexerError::LocalIpParse.is_fatal());
        assert!(IndexerError::EmptyTag.is_fatal());
    }

    #[test]
    fn test_transient_classification() {
        assert!(!IndexerError::NotRunning.is_fatal());
        assert!(!IndexerError::Timeout.is_fatal());
        assert!(!IndexerError::TagNotFound("default".into()).is_fatal());
        assert!(!IndexerError::Io(std::io::Error::other("refused")).is_fatal());
        assert!(!IndexerError::Other("handshake stall".into()).is_fatal());
    }
}
