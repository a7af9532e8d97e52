//! The `Entry` record
//!
//! Entries are deliberately small and cheap to clone: the payload is a
//! reference-counted [`Bytes`] buffer, everything else is `Copy`.

use std::net::IpAddr;

use bytes::Bytes;
use chrono::{DateTime, Utc};

/// Tag identifier, local or remote depending on context
pub type EntryTag = u16;

/// Timestamp carried by every entry
pub type Timestamp = DateTime<Utc>;

/// Reserved tag for the ingester's own diagnostic entries
///
/// Tag translators pass this id through unchanged in both directions; it is
/// outside the dense id space the muxer hands out.
pub const RESERVED_TAG_ID: EntryTag = 0xFFFF;

/// A single tagged record bound for an indexer
///
/// `src` is filled in by the writer path with the connection's source address
/// when the producer leaves it empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// When the record was generated
    pub ts: Timestamp,

    /// Local tag id (muxer tag-table index) until the writer translates it
    pub tag: EntryTag,

    /// Originating address, if the producer knows it
    pub src: Option<IpAddr>,

    /// Opaque payload bytes
    pub data: Bytes,
}

impl Entry {
    /// Create an entry with an explicit timestamp
    pub fn new(ts: Timestamp, tag: EntryTag, data: impl Into<Bytes>) -> Self {
        Self {
            ts,
            tag,
            src: None,
            data: data.into(),
        }
    }

    /// Create an entry stamped with the current time
    pub fn now(tag: EntryTag, data: impl Into<Bytes>) -> Self {
        Self::new(Utc::now(), tag, data)
    }

    /// Set the source address
    #[must_use]
    pub fn with_src(mut self, src: IpAddr) -> Self {
        self.src = Some(src);
        self
    }

    /// Payload size in bytes
    #[inline]
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_entry_new() {
        let ts = Utc::now();
        let e = Entry::new(ts, 3, b"payload".as_ref());
        assert_eq!(e.ts, ts);
        assert_eq!(e.tag, 3);
        assert_eq!(e.src, None);
        assert_eq!(e.size(), 7);
    }

    #[test]
    fn test_entry_with_src() {
        let src = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        let e = Entry::now(0, b"x".as_ref()).with_src(src);
        assert_eq!(e.src, Some(src));
    }

    #[test]
    fn test_entry_clone_is_shallow() {
        let e = Entry::now(1, vec![0u8; 4096]);
        let c = e.clone();
        // Bytes clones share the same backing buffer
        assert_eq!(e.data.as_ptr(), c.data.as_ptr());
    }

    #[test]
    fn test_reserved_tag_outside_dense_space() {
        assert_eq!(RESERVED_TAG_ID, u16::MAX);
    }
}
