//! Muxer metrics
//!
//! Lock-free counters updated by the writer and connection tasks. Take a
//! [`MetricsSnapshot`] for reporting; the handle stays valid for the life
//! of the muxer.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for the whole muxer
#[derive(Debug, Default)]
pub struct MuxerMetrics {
    /// Entries delivered to an indexer connection
    pub entries_written: AtomicU64,

    /// Batches delivered to an indexer connection
    pub batches_written: AtomicU64,

    /// Entries recycled off a failing connection
    pub entries_recycled: AtomicU64,

    /// Items parked in the emergency queue
    pub emergency_pushes: AtomicU64,

    /// Emergency parks rejected at capacity
    pub emergency_overflows: AtomicU64,

    /// Entries dropped (unknown tag, or irrecoverable reversal)
    pub entries_dropped: AtomicU64,

    /// Successful reconnections after the initial connect
    pub reconnects: AtomicU64,

    /// Times the spool cache took over the channels
    pub cache_activations: AtomicU64,
}

impl MuxerMetrics {
    /// Create new metrics with all counters at zero
    pub const fn new() -> Self {
        Self {
            entries_written: AtomicU64::new(0),
            batches_written: AtomicU64::new(0),
            entries_recycled: AtomicU64::new(0),
            emergency_pushes: AtomicU64::new(0),
            emergency_overflows: AtomicU64::new(0),
            entries_dropped: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            cache_activations: AtomicU64::new(0),
        }
    }

    #[inline]
    pub(crate) fn record_entry_written(&self) {
        self.entries_written.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_batch_written(&self, entries: u64) {
        self.batches_written.fetch_add(1, Ordering::Relaxed);
        self.entries_written.fetch_add(entries, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_recycled(&self, entries: u64) {
        self.entries_recycled.fetch_add(entries, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_emergency_push(&self) {
        self.emergency_pushes.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_emergency_overflow(&self) {
        self.emergency_overflows.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_dropped(&self, entries: u64) {
        self.entries_dropped.fetch_add(entries, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_cache_activation(&self) {
        self.cache_activations.fetch_add(1, Ordering::Relaxed);
    }

    /// Get a snapshot of current values
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            entries_written: self.entries_written.load(Ordering::Relaxed),
            batches_written: self.batches_written.load(Ordering::Relaxed),
            entries_recycled: self.entries_recycled.load(Ordering::Relaxed),
            emergency_pushes: self.emergency_pushes.load(Ordering::Relaxed),
            emergency_overflows: self.emergency_overflows.load(Ordering::Relaxed),
            entries_dropped: self.entries_dropped.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            cache_activations: self.cache_activations.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time snapshot of muxer metrics
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsSnapshot {
    pub entries_written: u64,
    pub batches_written: u64,
    pub entries_recycled: u64,
    pub emergency_pushes: u64,
    pub emergency_overflows: u64,
    pub entries_dropped: u64,
    pub reconnects: u64,
    pub cache_activations: u64,
}
