//! Spool cache interface
//!
//! The disk-backed spool is an external collaborator. When no connection is
//! hot, the cache controller points it at the same entry and batch channels
//! the writer tasks normally consume; when a connection comes back, the
//! controller stops it and pumps its stored blocks out again.

use std::path::PathBuf;

use async_trait::async_trait;
use crossfire::MAsyncRx;
use serde::Deserialize;
use thiserror::Error;

use ingest_entry::Entry;

/// Configuration for the spool cache
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Backing file path; `None` keeps the cache memory-only
    pub file_backing_location: Option<PathBuf>,

    /// Maximum cache size in bytes; zero means unbounded
    pub max_cache_size: u64,
}

impl CacheConfig {
    /// Whether the cache persists to disk
    pub fn is_file_backed(&self) -> bool {
        self.file_backing_location.is_some()
    }
}

/// Errors from the spool cache
#[derive(Debug, Error)]
pub enum CacheError {
    /// Backing-file failure
    #[error("cache i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The cache hit its configured size limit
    #[error("cache full")]
    Full,

    /// Operation on a closed cache
    #[error("cache closed")]
    Closed,

    /// Any other cache failure
    #[error("{0}")]
    Other(String),
}

/// A spool that consumes the producer channels while no connection is hot
///
/// `start` hands the cache clones of the shared channel receivers; it
/// consumes from them until `stop`. Stored entries come back out in blocks
/// via `pop_block`. All methods may be called from multiple tasks.
#[async_trait]
pub trait IngestCache: Send + Sync {
    /// Begin consuming from the producer channels
    async fn start(
        &self,
        entry_rx: MAsyncRx<Entry>,
        batch_rx: MAsyncRx<Vec<Entry>>,
    ) -> Result<(), CacheError>;

    /// Stop consuming; stored data stays put
    async fn stop(&self) -> Result<(), CacheError>;

    /// Pop the oldest stored block, or `None` when the cache is empty
    async fn pop_block(&self) -> Result<Option<Vec<Entry>>, CacheError>;

    /// Store a single entry directly
    async fn add_entry(&self, e: Entry) -> Result<(), CacheError>;

    /// Store a block directly (used to put back a block that could not be
    /// delivered mid-unload)
    async fn add_block(&self, block: Vec<Entry>) -> Result<(), CacheError>;

    /// Number of entries currently stored
    async fn count(&self) -> usize;

    /// The tag list persisted alongside the stored entries
    async fn get_tag_list(&self) -> Result<Vec<String>, CacheError>;

    /// Persist the tag list so stored entries stay interpretable
    async fn update_stored_tag_list(&self, tags: &[String]) -> Result<(), CacheError>;

    /// Flush stored data to the backing file, if any
    async fn sync(&self) -> Result<(), CacheError>;

    /// Stop and release the cache; idempotent
    async fn close(&self) -> Result<(), CacheError>;
}
