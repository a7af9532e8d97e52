//! Ingest Entry Types
//!
//! The leaf crate of the ingest multiplexer workspace: the `Entry` record
//! that flows from producers to indexers, the tag-id types, and tag-name
//! validation.
//!
//! # Tags
//!
//! An entry carries a *local* tag id: a dense small integer assigned by the
//! muxer's tag table. Indexers assign their own *remote* ids during tag
//! negotiation; both live in the same `EntryTag` integer space and are told
//! apart by position (local ids index the muxer table, remote ids are only
//! meaningful on one connection). [`RESERVED_TAG_ID`] is carved out for the
//! ingester's own diagnostic stream and is never translated.
//!
//! # Example
//!
//! ```
//! use ingest_entry::{check_tag, Entry};
//!
//! check_tag("syslog").unwrap();
//! let e = Entry::now(0, b"starting up".as_ref());
//! assert_eq!(e.size(), 11);
//! ```

mod entry;
mod tag;

pub use entry::{Entry, EntryTag, Timestamp, RESERVED_TAG_ID};
pub use tag::{check_tag, TagError, MAX_TAG_LENGTH};
