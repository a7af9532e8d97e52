//! In-memory fakes for tests and benches
//!
//! A scriptable [`MockIndexer`] plus its [`MockFactory`], and a
//! [`MemoryCache`] spool. The muxer only ever sees the capability traits,
//! so these stand in for a real indexer fleet: kill and revive
//! destinations, fail negotiations, delay readiness, and inspect exactly
//! what each indexer confirmed.
//!
//! # Example
//!
//! ```ignore
//! let factory = Arc::new(MockFactory::new());
//! let muxer = Muxer::new(config, factory.clone(), None).await?;
//! muxer.start()?;
//! muxer.wait_for_hot(Some(Duration::from_secs(5))).await?;
//! // ...
//! factory.kill("tcp://a:4023");   // writes start failing, dials refused
//! factory.revive("tcp://a:4023"); // dials succeed again
//! ```

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use crossfire::MAsyncRx;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use ingest_entry::{Entry, EntryTag};

use crate::cache::{CacheError, IngestCache};
use crate::connection::{ConnectParams, ConnectionFactory, IndexerConnection, IndexerError};

/// In-memory indexer connection with scriptable failure modes
///
/// Written entries sit unconfirmed until `sync`, which moves them into the
/// delivered set; `outstanding_entries` drains the unconfirmed ones, just
/// like a dying real connection hands back its in-flight data.
pub struct MockIndexer {
    address: String,
    source: IpAddr,
    remote_base: EntryTag,
    tags: Mutex<HashMap<String, EntryTag>>,
    unacked: Mutex<Vec<Entry>>,
    delivered: Mutex<Vec<Entry>>,
    identity: Mutex<Option<(String, String, String)>>,
    closed: AtomicBool,
    fail_writes: AtomicBool,
    fail_sync: AtomicBool,
    fail_negotiate: AtomicBool,
    not_ready_polls: AtomicU32,
    sync_count: AtomicU64,
}

impl MockIndexer {
    /// Create an indexer whose remote tag ids start at `remote_base`
    ///
    /// Give each destination a different base so tests can tell the remote
    /// id spaces apart.
    pub fn new(address: impl Into<String>, source: IpAddr, remote_base: EntryTag) -> Self {
        Self {
            address: address.into(),
            source,
            remote_base,
            tags: Mutex::new(HashMap::new()),
            unacked: Mutex::new(Vec::new()),
            delivered: Mutex::new(Vec::new()),
            identity: Mutex::new(None),
            closed: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            fail_sync: AtomicBool::new(false),
            fail_negotiate: AtomicBool::new(false),
            not_ready_polls: AtomicU32::new(0),
            sync_count: AtomicU64::new(0),
        }
    }

    /// The destination address this indexer answers for
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Make every write and sync fail until cleared
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Release);
    }

    /// Make only sync fail until cleared
    pub fn set_fail_sync(&self, fail: bool) {
        self.fail_sync.store(fail, Ordering::Release);
    }

    /// Make the next tag negotiation fail
    pub fn set_fail_negotiate(&self, fail: bool) {
        self.fail_negotiate.store(fail, Ordering::Release);
    }

    /// Report not-ready for the next `n` readiness polls
    pub fn set_not_ready_polls(&self, n: u32) {
        self.not_ready_polls.store(n, Ordering::Release);
    }

    /// Entries confirmed by sync
    pub fn delivered(&self) -> Vec<Entry> {
        self.delivered.lock().clone()
    }

    /// Entries written but not yet confirmed
    pub fn unacked(&self) -> Vec<Entry> {
        self.unacked.lock().clone()
    }

    /// The remote id this indexer assigned to a tag name
    pub fn remote_tag(&self, name: &str) -> Option<EntryTag> {
        self.tags.lock().get(name).copied()
    }

    /// The identification triple received, if any
    pub fn identity(&self) -> Option<(String, String, String)> {
        self.identity.lock().clone()
    }

    /// How many syncs completed
    pub fn sync_count(&self) -> u64 {
        self.sync_count.load(Ordering::Acquire)
    }

    /// Reset session-level state for a fresh dial
    fn reopen(&self, tags: &[String]) {
        self.closed.store(false, Ordering::Release);
        self.fail_writes.store(false, Ordering::Release);
        self.fail_sync.store(false, Ordering::Release);
        let mut map = self.tags.lock();
        for name in tags {
            let next = self.remote_base + map.len() as EntryTag;
            map.entry(name.clone()).or_insert(next);
        }
    }

    fn broken(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.fail_writes.load(Ordering::Acquire)
    }
}

#[async_trait]
impl IndexerConnection for MockIndexer {
    async fn identify(&self, name: &str, version: &str, uuid: &str) -> Result<(), IndexerError> {
        if self.broken() {
            return Err(IndexerError::NotRunning);
        }
        *self.identity.lock() = Some((name.into(), version.into(), uuid.into()));
        Ok(())
    }

    async fn ingest_ok(&self) -> Result<bool, IndexerError> {
        if self.broken() {
            return Err(IndexerError::NotRunning);
        }
        let remaining = self.not_ready_polls.load(Ordering::Acquire);
        if remaining > 0 {
            self.not_ready_polls.store(remaining - 1, Ordering::Release);
            return Ok(false);
        }
        Ok(true)
    }

    async fn negotiate_tag(&self, name: &str) -> Result<EntryTag, IndexerError> {
        if self.broken() {
            return Err(IndexerError::NotRunning);
        }
        if self.fail_negotiate.load(Ordering::Acquire) {
            return Err(IndexerError::Other("negotiation refused".into()));
        }
        let mut map = self.tags.lock();
        let next = self.remote_base + map.len() as EntryTag;
        Ok(*map.entry(name.to_string()).or_insert(next))
    }

    async fn get_tag(&self, name: &str) -> Option<EntryTag> {
        self.tags.lock().get(name).copied()
    }

    async fn write_entry(&self, e: &Entry) -> Result<(), IndexerError> {
        if self.broken() {
            return Err(IndexerError::Io(std::io::Error::other("write failed")));
        }
        self.unacked.lock().push(e.clone());
        Ok(())
    }

    async fn write_batch(&self, b: &[Entry]) -> Result<(), IndexerError> {
        if self.broken() {
            return Err(IndexerError::Io(std::io::Error::other("write failed")));
        }
        self.unacked.lock().extend_from_slice(b);
        Ok(())
    }

    async fn sync(&self) -> Result<(), IndexerError> {
        if self.broken() || self.fail_sync.load(Ordering::Acquire) {
            return Err(IndexerError::NotRunning);
        }
        let mut unacked = self.unacked.lock();
        self.delivered.lock().append(&mut unacked);
        self.sync_count.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    async fn close(&self) -> Result<(), IndexerError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    async fn outstanding_entries(&self) -> Vec<Entry> {
        std::mem::take(&mut *self.unacked.lock())
    }

    async fn source_ip(&self) -> Result<IpAddr, IndexerError> {
        Ok(self.source)
    }
}

/// Factory handing out [`MockIndexer`] sessions per destination address
///
/// The same indexer instance is reused across reconnects so confirmed
/// entries survive connection churn, which is what the delivery assertions
/// need.
#[derive(Default)]
pub struct MockFactory {
    indexers: Mutex<HashMap<String, Arc<MockIndexer>>>,
    down: Mutex<HashSet<String>>,
    connect_counts: Mutex<HashMap<String, usize>>,
    fatal: Mutex<HashSet<String>>,
}

impl MockFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// The indexer bound to an address, creating it on first use
    pub fn indexer(&self, address: &str) -> Arc<MockIndexer> {
        let mut indexers = self.indexers.lock();
        let count = indexers.len() as EntryTag;
        indexers
            .entry(address.to_string())
            .or_insert_with(|| {
                // distinct remote id spaces and sources per destination
                let base = 100 * (count + 1);
                let source: IpAddr = format!("10.0.0.{}", count + 1).parse().unwrap();
                Arc::new(MockIndexer::new(address, source, base))
            })
            .clone()
    }

    /// Kill a destination: current session starts failing, new dials are
    /// refused until [`revive`](Self::revive)
    pub fn kill(&self, address: &str) {
        self.down.lock().insert(address.to_string());
        if let Some(ix) = self.indexers.lock().get(address) {
            ix.set_fail_writes(true);
        }
    }

    /// Allow dials to a destination again
    pub fn revive(&self, address: &str) {
        self.down.lock().remove(address);
    }

    /// Make dials to a destination fail fatally (configuration-level)
    pub fn set_fatal(&self, address: &str) {
        self.fatal.lock().insert(address.to_string());
    }

    /// How many successful dials an address has seen
    pub fn connect_count(&self, address: &str) -> usize {
        self.connect_counts.lock().get(address).copied().unwrap_or(0)
    }

    /// Entries confirmed across every indexer
    pub fn all_delivered(&self) -> Vec<Entry> {
        let indexers = self.indexers.lock();
        let mut out = Vec::new();
        for ix in indexers.values() {
            out.extend(ix.delivered());
        }
        out
    }
}

#[async_trait]
impl ConnectionFactory for MockFactory {
    async fn connect(
        &self,
        params: &ConnectParams,
    ) -> Result<Arc<dyn IndexerConnection>, IndexerError> {
        let address = &params.target.address;
        if self.fatal.lock().contains(address) {
            return Err(IndexerError::MalformedDestination(address.clone()));
        }
        if self.down.lock().contains(address) {
            return Err(IndexerError::Io(std::io::Error::other(
                "connection refused",
            )));
        }
        if params.tags.is_empty() {
            return Err(IndexerError::EmptyTag);
        }
        let ix = self.indexer(address);
        ix.reopen(&params.tags);
        *self
            .connect_counts
            .lock()
            .entry(address.clone())
            .or_insert(0) += 1;
        Ok(ix)
    }
}

/// In-memory spool cache
///
/// Consumes the shared channels into a block list while started. Stored
/// data and the persisted tag list survive stop/start cycles, standing in
/// for the file backing of the real spool.
#[derive(Default)]
pub struct MemoryCache {
    state: Arc<CacheState>,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    cancel: Mutex<Option<CancellationToken>>,
}

#[derive(Default)]
struct CacheState {
    blocks: Mutex<VecDeque<Vec<Entry>>>,
    tags: Mutex<Vec<String>>,
    running: AtomicBool,
    closed: AtomicBool,
    sync_count: AtomicU64,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed stored entries before handing the cache to a muxer
    pub fn preload(&self, block: Vec<Entry>) {
        self.state.blocks.lock().push_back(block);
    }

    /// Seed the persisted tag list
    pub fn preload_tags(&self, tags: Vec<String>) {
        *self.state.tags.lock() = tags;
    }

    /// Every stored entry, oldest block first
    pub fn stored(&self) -> Vec<Entry> {
        self.state
            .blocks
            .lock()
            .iter()
            .flat_map(|b| b.iter().cloned())
            .collect()
    }

    /// The persisted tag list
    pub fn stored_tags(&self) -> Vec<String> {
        self.state.tags.lock().clone()
    }

    /// Whether the cache is currently consuming the channels
    pub fn is_running(&self) -> bool {
        self.state.running.load(Ordering::Acquire)
    }

    /// How many syncs completed
    pub fn sync_count(&self) -> u64 {
        self.state.sync_count.load(Ordering::Acquire)
    }
}

#[async_trait]
impl IngestCache for MemoryCache {
    async fn start(
        &self,
        entry_rx: MAsyncRx<Entry>,
        batch_rx: MAsyncRx<Vec<Entry>>,
    ) -> Result<(), CacheError> {
        if self.state.closed.load(Ordering::Acquire) {
            return Err(CacheError::Closed);
        }
        let cancel = CancellationToken::new();
        let state = Arc::clone(&self.state);
        state.running.store(true, Ordering::Release);
        let consumer_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = consumer_cancel.cancelled() => break,
                    r = entry_rx.recv() => match r {
                        Ok(e) => state.blocks.lock().push_back(vec![e]),
                        Err(_) => break,
                    },
                    r = batch_rx.recv() => match r {
                        Ok(b) => state.blocks.lock().push_back(b),
                        Err(_) => break,
                    },
                }
            }
        });
        *self.cancel.lock() = Some(cancel);
        *self.task.lock().await = Some(handle);
        Ok(())
    }

    async fn stop(&self) -> Result<(), CacheError> {
        if let Some(cancel) = self.cancel.lock().take() {
            cancel.cancel();
        }
        if let Some(handle) = self.task.lock().await.take() {
            let _ = handle.await;
        }
        self.state.running.store(false, Ordering::Release);
        Ok(())
    }

    async fn pop_block(&self) -> Result<Option<Vec<Entry>>, CacheError> {
        Ok(self.state.blocks.lock().pop_front())
    }

    async fn add_entry(&self, e: Entry) -> Result<(), CacheError> {
        self.state.blocks.lock().push_back(vec![e]);
        Ok(())
    }

    async fn add_block(&self, block: Vec<Entry>) -> Result<(), CacheError> {
        // put-back semantics: the block goes back where it was popped from
        self.state.blocks.lock().push_front(block);
        Ok(())
    }

    async fn count(&self) -> usize {
        self.state.blocks.lock().iter().map(|b| b.len()).sum()
    }

    async fn get_tag_list(&self) -> Result<Vec<String>, CacheError> {
        Ok(self.state.tags.lock().clone())
    }

    async fn update_stored_tag_list(&self, tags: &[String]) -> Result<(), CacheError> {
        *self.state.tags.lock() = tags.to_vec();
        Ok(())
    }

    async fn sync(&self) -> Result<(), CacheError> {
        self.state.sync_count.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    async fn close(&self) -> Result<(), CacheError> {
        self.stop().await?;
        self.state.closed.store(true, Ordering::Release);
        Ok(())
    }
}

/// Build an entry with a recognizable payload
pub fn test_entry(tag: EntryTag, seq: usize) -> Entry {
    Entry::now(tag, format!("entry-{seq}").into_bytes())
}

/// Poll a condition until it holds or the timeout elapses
///
/// Delivery runs on background tasks, so assertions about what reached an
/// indexer need a grace period rather than a fixed sleep.
pub async fn eventually<F: Fn() -> bool>(cond: F, timeout: std::time::Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
}
