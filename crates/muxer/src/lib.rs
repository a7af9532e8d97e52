//! Ingest Muxer
//!
//! A client-side fan-out multiplexer that accepts tagged entries from an
//! application and reliably delivers each to one of a set of remote
//! indexers over persistent authenticated connections.
//!
//! # Architecture
//!
//! Producers push onto two shared bounded channels (single entries and
//! batches). One writer task per destination competes for that work,
//! translates tags into the destination's remote id space, and writes to
//! its connection. A paired connection task owns the reconnect loop and
//! hands fresh connections to the writer. When a connection dies holding
//! unconfirmed entries, they are recycled back onto the channels, spilling
//! into a bounded emergency queue if the channels will not take them within
//! a second. When no connection is hot at all, an optional spool cache
//! consumes the same channels until one comes back.
//!
//! ```text
//! [producers] --> entry/batch channels --+--> writer <-> connection task --> indexer
//!                                        +--> writer <-> connection task --> indexer
//!                                        `--> spool cache (no hot connections only)
//! ```
//!
//! # Guarantees
//!
//! - Entries are load-balanced across destinations; ordering holds only
//!   within a single connection.
//! - Full channels block producers. There are no silent drops at the API
//!   boundary; an entry is dropped only when it carries a tag the muxer
//!   never issued, or when the emergency queue overflows (both logged).
//! - With a file-backed cache, everything still in flight is spooled on
//!   close.
//!
//! # Quick start
//!
//! ```ignore
//! use ingest_muxer::{Muxer, MuxerConfig};
//!
//! let config = MuxerConfig::uniform(addresses, secret)?
//!     .with_tags(vec!["default".into()])
//!     .with_identity("my-ingester", "1.0.0", uuid);
//! let muxer = Muxer::new(config, factory, None).await?;
//! muxer.start()?;
//! muxer.wait_for_hot(Some(Duration::from_secs(5))).await?;
//! let tag = muxer.get_tag("default")?;
//! muxer.write(Utc::now(), tag, payload).await?;
//! muxer.close().await?;
//! ```

pub mod cache;
pub mod config;
pub mod connection;
pub mod emergency;
pub mod error;
pub mod metrics;
pub mod testutil;
pub mod translator;

mod cache_task;
mod conn_task;
mod muxer;
mod writer;

pub use cache::{CacheConfig, CacheError, IngestCache};
pub use config::{LogLevel, MuxerConfig, TlsConfig, DEFAULT_CHANNEL_SIZE};
pub use connection::{
    ConnectParams, ConnectionFactory, IndexerConnection, IndexerError, Target, TargetError,
};
pub use emergency::{EmergencyQueue, MAX_EMERGENCY_LIST_SIZE};
pub use error::{MuxerError, Result};
pub use metrics::{MetricsSnapshot, MuxerMetrics};
pub use muxer::Muxer;
pub use translator::TagTranslator;

// Re-export the entry types producers need
pub use ingest_entry::{check_tag, Entry, EntryTag, Timestamp, RESERVED_TAG_ID};
