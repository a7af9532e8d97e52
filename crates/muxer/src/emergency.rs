//! Emergency overflow queue
//!
//! Last-ditch parking for entries that could not be recycled onto the
//! producer channels within the recycle window. This only fills up under
//! heavy load with no indexer connections: the channels are full, a
//! connection died holding entries, and nothing can eat them. Writer tasks
//! drain this queue ahead of the channels whenever they get a working
//! connection, which is what breaks the recycle deadlock.

use parking_lot::Mutex;
use std::collections::VecDeque;

use ingest_entry::Entry;

use crate::connection::IndexerConnection;
use crate::error::MuxerError;
use crate::translator::TagTranslator;

/// Maximum number of parked items before pushes overflow
pub const MAX_EMERGENCY_LIST_SIZE: usize = 256;

/// One parked item
///
/// Both fields may be populated: that is how a partially-translated batch is
/// parked alongside the single entry that triggered the park.
#[derive(Debug, Default)]
pub struct EmergencyItem {
    /// A single parked entry, tag in local space
    pub entry: Option<Entry>,

    /// A parked batch, tags in local space
    pub batch: Option<Vec<Entry>>,
}

impl EmergencyItem {
    fn is_empty(&self) -> bool {
        self.entry.is_none() && self.batch.as_ref().map_or(true, |b| b.is_empty())
    }
}

/// Bounded FIFO of parked entries and batches
#[derive(Debug, Default)]
pub struct EmergencyQueue {
    items: Mutex<VecDeque<EmergencyItem>>,
}

impl EmergencyQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of parked items
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// Whether the queue is empty
    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Park an entry and/or batch at the tail
    ///
    /// # Errors
    ///
    /// Returns `EmergencyListOverflow` when the queue is at capacity.
    pub fn push(&self, entry: Option<Entry>, batch: Option<Vec<Entry>>) -> Result<(), MuxerError> {
        let item = EmergencyItem { entry, batch };
        if item.is_empty() {
            return Ok(());
        }
        let mut items = self.items.lock();
        if items.len() >= MAX_EMERGENCY_LIST_SIZE {
            return Err(MuxerError::EmergencyListOverflow);
        }
        items.push_back(item);
        Ok(())
    }

    /// Pop the oldest parked item
    pub fn pop(&self) -> Option<EmergencyItem> {
        self.items.lock().pop_front()
    }

    /// Drain the queue onto a connection, translating tags as it goes
    ///
    /// Items are written in FIFO order. On any translation or write failure
    /// the in-flight item is pushed back at the tail with its tags restored
    /// to local space and `false` is returned so the caller can trigger a
    /// reconnect. Returns `true` once the queue is empty.
    pub async fn clear(&self, conn: &dyn IndexerConnection, tt: &TagTranslator) -> bool {
        loop {
            let Some(item) = self.pop() else {
                return true;
            };
            let EmergencyItem {
                mut entry,
                mut batch,
            } = item;

            if let Some(mut e) = entry.take() {
                let (remote, ok) = tt.translate(e.tag);
                if !ok {
                    self.push_back_parked(Some(e), batch);
                    return false;
                }
                let local = e.tag;
                e.tag = remote;
                if let Err(err) = conn.write_entry(&e).await {
                    tracing::debug!(error = %err, "emergency drain write failed");
                    e.tag = local;
                    self.push_back_parked(Some(e), batch);
                    return false;
                }
                // delivered; it stays out of the item if the batch below fails
            }

            if let Some(mut b) = batch.take() {
                // SRC is fixed up when entries come off the channels, so only
                // tags need attention here
                let mut i = 0;
                while i < b.len() {
                    let (remote, ok) = tt.translate(b[i].tag);
                    if !ok {
                        reverse_prefix(&mut b, i, tt);
                        self.push_back_parked(entry.take(), Some(b));
                        return false;
                    }
                    b[i].tag = remote;
                    i += 1;
                }
                if let Err(err) = conn.write_batch(&b).await {
                    tracing::debug!(error = %err, "emergency drain batch write failed");
                    let len = b.len();
                    reverse_prefix(&mut b, len, tt);
                    self.push_back_parked(entry.take(), Some(b));
                    return false;
                }
            }
        }
    }

    /// Re-park an item at the tail, logging if the queue overflowed meanwhile
    fn push_back_parked(&self, entry: Option<Entry>, batch: Option<Vec<Entry>>) {
        if self.push(entry, batch).is_err() {
            tracing::warn!("emergency queue overflowed while re-parking, dropping item");
        }
    }
}

/// Restore the first `translated` tags of a batch to local space
///
/// Entries whose remote id the translator no longer knows cannot be
/// relabeled safely and are dropped with a log line.
pub(crate) fn reverse_prefix(batch: &mut Vec<Entry>, translated: usize, tt: &TagTranslator) {
    let mut i = 0;
    let mut boundary = translated;
    while i < boundary {
        match tt.reverse(batch[i].tag) {
            Some(local) => {
                batch[i].tag = local;
                i += 1;
            }
            None => {
                tracing::error!(tag = batch[i].tag, "cannot reverse remote tag, dropping entry");
                batch.remove(i);
                boundary -= 1;
            }
        }
    }
}

#[cfg(test)]
#[path = "emergency_test.rs"]
mod emergency_test;
