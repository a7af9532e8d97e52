//! Per-connection tag translation
//!
//! Each indexer assigns its own remote ids during tag negotiation, so every
//! connection carries a translator: a dense map from the muxer's local tag
//! ids to that connection's remote ids. Translators are shared between the
//! connection task that builds them, the writer task that uses them on the
//! hot path, and `negotiate_tag` which appends to them while live.

use parking_lot::RwLock;
use thiserror::Error;

use ingest_entry::{EntryTag, RESERVED_TAG_ID};

/// Error from registering a tag at the wrong position
///
/// A failed registration means the translator no longer mirrors the muxer
/// tag table; the only recovery is closing the connection so a fresh,
/// fully-populated translator gets built on reconnect.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("cannot register tag, local tag out of sync with translator")]
pub struct OutOfSync;

/// Dense local-to-remote tag map for one connection
///
/// Index `i` holds the remote id this connection's indexer returned for the
/// muxer tag table entry `i`. Always built densely up through the table
/// length at the moment of connection.
#[derive(Debug, Default)]
pub struct TagTranslator {
    remote: RwLock<Vec<EntryTag>>,
}

impl TagTranslator {
    /// Build a translator from a densely-ordered remote id list
    pub fn from_remote(remote: Vec<EntryTag>) -> Self {
        Self {
            remote: RwLock::new(remote),
        }
    }

    /// Number of translated tags
    pub fn len(&self) -> usize {
        self.remote.read().len()
    }

    /// Whether no tags are translated
    pub fn is_empty(&self) -> bool {
        self.remote.read().is_empty()
    }

    /// Translate a local tag id to this connection's remote id
    ///
    /// The reserved diagnostics tag passes through unchanged. An id beyond
    /// the translated range returns `(first remote id, false)`: the caller
    /// must treat it as a failure and renegotiate, and the fallback id keeps
    /// an uninitialized value from ever reaching the indexer.
    pub fn translate(&self, local: EntryTag) -> (EntryTag, bool) {
        if local == RESERVED_TAG_ID {
            return (local, true);
        }
        let remote = self.remote.read();
        match remote.get(local as usize) {
            Some(&r) => (r, true),
            None => (remote.first().copied().unwrap_or(0), false),
        }
    }

    /// Append a newly negotiated remote id
    ///
    /// Registration is strictly append-at-end: `local` must equal the
    /// current translator length.
    pub fn register_tag(&self, local: EntryTag, remote_tag: EntryTag) -> Result<(), OutOfSync> {
        let mut remote = self.remote.write();
        if local as usize != remote.len() {
            return Err(OutOfSync);
        }
        remote.push(remote_tag);
        Ok(())
    }

    /// Translate a remote id back to the local id
    ///
    /// Only used on the slow path, when entries pulled out of a dying
    /// connection carry already-translated tags. Linear scan; `None` means
    /// the remote id was never issued by this connection and the entry
    /// cannot be relabeled safely.
    pub fn reverse(&self, remote_tag: EntryTag) -> Option<EntryTag> {
        if remote_tag == RESERVED_TAG_ID {
            return Some(remote_tag);
        }
        self.remote
            .read()
            .iter()
            .position(|&r| r == remote_tag)
            .map(|i| i as EntryTag)
    }
}

#[cfg(test)]
#[path = "translator_test.rs"]
mod translator_test;
