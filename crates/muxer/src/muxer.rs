//! Ingest muxer core
//!
//! The muxer owns the destination list, the master tag table, the shared
//! entry/batch channels, lifecycle state, and the per-destination connection
//! and translator slots. One connection task and one writer task run per
//! destination; a cache controller runs when the spool is enabled.
//!
//! ```text
//! producer --> [entry chan]--+--> writer 0 --> indexer 0
//!          --> [batch chan]--+--> writer 1 --> indexer 1
//!                            `--> spool cache (only while no conn is hot)
//! ```
//!
//! Entries are load-balanced, not ordered, across destinations. Within one
//! connection, writes are FIFO.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossfire::{MAsyncRx, MAsyncTx, TrySendError};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use ingest_entry::{check_tag, Entry, EntryTag, Timestamp, RESERVED_TAG_ID};

use crate::cache::IngestCache;
use crate::config::{LogLevel, MuxerConfig, TlsConfig};
use crate::connection::{ConnectionFactory, IndexerConnection, IndexerError, Target, TargetError};
use crate::emergency::{reverse_prefix, EmergencyQueue};
use crate::error::{MuxerError, Result};
use crate::metrics::{MetricsSnapshot, MuxerMetrics};
use crate::translator::TagTranslator;

/// How long recycling tries the channels before parking in the emergency
/// queue, so a reconnect never wedges behind full channels
pub(crate) const RECYCLE_TIMEOUT: Duration = Duration::from_secs(1);

/// Base polling interval for `wait_for_hot`
const WAIT_TICK: Duration = Duration::from_millis(50);

/// Sleep increment while `sync` waits for the channels to drain
const SYNC_POLL: Duration = Duration::from_millis(10);

/// Retry increment for bounded channel pushes that must not lose the item
const SEND_POLL: Duration = Duration::from_millis(10);

/// Lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MuxState {
    Empty,
    Running,
    Closed,
}

/// A live connection plus everything the writer needs to use it
pub(crate) struct ConnSet {
    pub(crate) conn: Arc<dyn IndexerConnection>,
    pub(crate) tt: Arc<TagTranslator>,
    pub(crate) dest: String,
    pub(crate) src: IpAddr,
}

/// State guarded by the muxer lock
pub(crate) struct Shared {
    pub(crate) state: MuxState,
    pub(crate) tags: Vec<String>,
    pub(crate) tag_map: HashMap<String, EntryTag>,
    pub(crate) conns: Vec<Option<Arc<dyn IndexerConnection>>>,
    pub(crate) translators: Vec<Option<Arc<TagTranslator>>>,
    pub(crate) err_dests: Vec<TargetError>,
    pub(crate) tasks: Vec<JoinHandle<()>>,
    pub(crate) cache_task: Option<JoinHandle<()>>,
}

pub(crate) struct MuxerInner {
    pub(crate) dests: Vec<Target>,
    pub(crate) tls: TlsConfig,
    pub(crate) rate_limit_bps: Option<i64>,
    pub(crate) retry_interval: Duration,
    pub(crate) name: String,
    pub(crate) version: String,
    pub(crate) uuid: String,
    pub(crate) log_level: LogLevel,

    // hot-path counters, read and written outside the muxer lock
    pub(crate) conn_hot: AtomicI32,
    pub(crate) conn_dead: AtomicI32,

    pub(crate) shared: RwLock<Shared>,

    // shared producer channels; tasks clone the receivers they consume from
    pub(crate) entry_tx: MAsyncTx<Entry>,
    pub(crate) entry_rx: MAsyncRx<Entry>,
    pub(crate) batch_tx: MAsyncTx<Vec<Entry>>,
    pub(crate) batch_rx: MAsyncRx<Vec<Entry>>,

    pub(crate) eq: EmergencyQueue,
    pub(crate) cancel: CancellationToken,

    // capacity-1 signal channels; senders never block
    pub(crate) up_tx: mpsc::Sender<bool>,
    pub(crate) up_rx: tokio::sync::Mutex<mpsc::Receiver<bool>>,
    pub(crate) err_tx: mpsc::Sender<String>,
    pub(crate) err_rx: tokio::sync::Mutex<mpsc::Receiver<String>>,

    pub(crate) factory: Arc<dyn ConnectionFactory>,

    pub(crate) cache: Option<Arc<dyn IngestCache>>,
    pub(crate) cache_enabled: bool,
    pub(crate) cache_file_backed: bool,
    pub(crate) cache_running: AtomicBool,
    pub(crate) cache_error: Mutex<Option<String>>,
    pub(crate) cache_signal_tx: mpsc::Sender<bool>,
    pub(crate) cache_signal_rx: tokio::sync::Mutex<mpsc::Receiver<bool>>,
    pub(crate) cache_cancel: CancellationToken,

    // serializes tag negotiations across their await points
    pub(crate) negotiate_lock: tokio::sync::Mutex<()>,

    pub(crate) metrics: Arc<MuxerMetrics>,
}

/// Fan-out ingest multiplexer
///
/// Accepts tagged entries from any number of producer tasks and delivers
/// each to exactly one of the configured indexers, reconnecting and
/// recycling in-flight entries as connections churn. Cheap to clone-by-ref:
/// all methods take `&self`.
///
/// # Example
///
/// ```ignore
/// let config = MuxerConfig::uniform(addresses, secret)?
///     .with_tags(vec!["default".into()]);
/// let muxer = Muxer::new(config, factory, None).await?;
/// muxer.start()?;
/// muxer.wait_for_hot(Some(Duration::from_secs(5))).await?;
/// muxer.write_entry(Entry::now(tag, data)).await?;
/// muxer.sync(Duration::from_secs(5)).await?;
/// muxer.close().await?;
/// ```
#[derive(Clone)]
pub struct Muxer {
    inner: Arc<MuxerInner>,
}

impl Muxer {
    /// Create a muxer from a configuration, a connection factory, and an
    /// optional spool cache
    ///
    /// A cache must be supplied exactly when `config.enable_cache` is set.
    /// If the cache already holds entries, its stored tag list seeds the tag
    /// table so stored entries stay interpretable; configured tags are
    /// appended after it and the merged list is persisted back.
    ///
    /// # Errors
    ///
    /// Returns `NoTargets` for an empty destination list, a tag validation
    /// error for a bad tag name, and `Cache` for reconciliation failures.
    pub async fn new(
        config: MuxerConfig,
        factory: Arc<dyn ConnectionFactory>,
        cache: Option<Arc<dyn IngestCache>>,
    ) -> Result<Self> {
        if config.destinations.is_empty() {
            return Err(MuxerError::NoTargets);
        }
        for name in &config.tags {
            check_tag(name)?;
        }

        let mut local_tags = config.tags.clone();

        let cache = if config.enable_cache {
            let cache = cache.ok_or_else(|| {
                MuxerError::Cache("cache enabled but no cache supplied".into())
            })?;
            // If the cache already holds entries, its stored tag list wins
            // the front of the table; configured tags follow.
            if cache.count().await > 0 {
                let mut stored = cache
                    .get_tag_list()
                    .await
                    .map_err(|e| MuxerError::Cache(e.to_string()))?;
                if !stored.is_empty() {
                    let uniques: Vec<&String> = stored
                        .iter()
                        .filter(|ct| !local_tags.contains(ct))
                        .collect();
                    if !uniques.is_empty() {
                        tracing::warn!(
                            tags = ?uniques,
                            "cache holds entries; negotiating stored tags the \
                             configuration no longer names"
                        );
                    }
                    for lt in local_tags {
                        if !stored.contains(&lt) {
                            stored.push(lt);
                        }
                    }
                    local_tags = stored;
                }
            }
            cache
                .update_stored_tag_list(&local_tags)
                .await
                .map_err(|e| MuxerError::Cache(e.to_string()))?;
            Some(cache)
        } else {
            None
        };

        let tag_map: HashMap<String, EntryTag> = local_tags
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i as EntryTag))
            .collect();

        let chan_size = config.effective_channel_size();
        let (entry_tx, entry_rx) = crossfire::mpmc::bounded_async::<Entry>(chan_size);
        let (batch_tx, batch_rx) = crossfire::mpmc::bounded_async::<Vec<Entry>>(chan_size);

        let (up_tx, up_rx) = mpsc::channel(1);
        let (err_tx, err_rx) = mpsc::channel(config.destinations.len());
        let (cache_signal_tx, cache_signal_rx) = mpsc::channel(1);

        let cache_file_backed = config.enable_cache && config.cache_config.is_file_backed();

        Ok(Self {
            inner: Arc::new(MuxerInner {
                dests: config.destinations,
                tls: config.tls,
                rate_limit_bps: (config.rate_limit_bps > 0).then_some(config.rate_limit_bps),
                retry_interval: config.retry_interval,
                name: config.ingester_name,
                version: config.ingester_version,
                uuid: config.ingester_uuid,
                log_level: config.log_level,
                conn_hot: AtomicI32::new(0),
                conn_dead: AtomicI32::new(0),
                shared: RwLock::new(Shared {
                    state: MuxState::Empty,
                    tags: local_tags,
                    tag_map,
                    conns: Vec::new(),
                    translators: Vec::new(),
                    err_dests: Vec::new(),
                    tasks: Vec::new(),
                    cache_task: None,
                }),
                entry_tx,
                entry_rx,
                batch_tx,
                batch_rx,
                eq: EmergencyQueue::new(),
                cancel: CancellationToken::new(),
                up_tx,
                up_rx: tokio::sync::Mutex::new(up_rx),
                err_tx,
                err_rx: tokio::sync::Mutex::new(err_rx),
                factory,
                cache_enabled: cache.is_some(),
                cache,
                cache_file_backed,
                cache_running: AtomicBool::new(false),
                cache_error: Mutex::new(None),
                cache_signal_tx,
                cache_signal_rx: tokio::sync::Mutex::new(cache_signal_rx),
                cache_cancel: CancellationToken::new(),
                negotiate_lock: tokio::sync::Mutex::new(()),
                metrics: Arc::new(MuxerMetrics::new()),
            }),
        })
    }

    /// Start the connection process
    ///
    /// Returns immediately; connections are not yet hot. Call
    /// [`wait_for_hot`](Self::wait_for_hot) to wait for readiness.
    ///
    /// # Errors
    ///
    /// Returns `NotReady` if the muxer is not in the empty state.
    pub fn start(&self) -> Result<()> {
        let inner = &self.inner;
        let mut sh = inner.shared.write();
        if sh.state != MuxState::Empty || !sh.conns.is_empty() {
            return Err(MuxerError::NotReady);
        }
        if inner.cache_enabled {
            inner.cache_running.store(true, Ordering::Release);
            sh.cache_task = Some(tokio::spawn(inner.clone().cache_controller_task()));
        }
        let n = inner.dests.len();
        sh.conns = vec![None; n];
        sh.translators = vec![None; n];
        inner.conn_dead.store(n as i32, Ordering::Release);
        for idx in 0..n {
            sh.tasks.push(tokio::spawn(inner.clone().connection_task(idx)));
        }
        sh.state = MuxState::Running;
        Ok(())
    }

    /// Shut the muxer down
    ///
    /// Issues a best-effort one-second sync, signals every task to stop, and
    /// waits for them. With a file-backed cache, everything still in flight
    /// (unconfirmed connection entries, both channels, the emergency queue)
    /// is written into the cache before it is closed; without one, remaining
    /// items are discarded. Idempotent after the first call.
    pub async fn close(&self) -> Result<()> {
        let inner = &self.inner;
        inner.diag_info(format!("ingester {} exiting", inner.name));
        let _ = self.sync(Duration::from_secs(1)).await;

        {
            let mut sh = inner.shared.write();
            if sh.state == MuxState::Closed {
                return Ok(());
            }
            sh.state = MuxState::Closed;
            inner.cancel.cancel();

            if inner.hot_count() == 0 && !inner.cache_running.load(Ordering::Acquire) {
                // nothing can drain the channels; closing is going to pitch
                // whatever is left in them
                while inner.entry_rx.try_recv().is_ok() {}
                while inner.batch_rx.try_recv().is_ok() {}
            }
        }

        // the lock must be free while tasks wind down: a failing connection
        // still needs it to record its TargetError
        let tasks: Vec<JoinHandle<()>> = inner.shared.write().tasks.drain(..).collect();
        for t in tasks {
            let _ = t.await;
        }

        let cache_task = inner.shared.write().cache_task.take();
        if let Some(t) = cache_task {
            inner.cache_cancel.cancel();
            let _ = t.await;
        }

        if let Some(cache) = inner.cache.clone() {
            if inner.cache_file_backed {
                let conns: Vec<Arc<dyn IndexerConnection>> = {
                    let sh = inner.shared.read();
                    sh.conns.iter().flatten().cloned().collect()
                };
                for conn in conns {
                    for e in conn.outstanding_entries().await {
                        cache
                            .add_entry(e)
                            .await
                            .map_err(|e| MuxerError::Cache(e.to_string()))?;
                    }
                }
                while let Ok(e) = inner.entry_rx.try_recv() {
                    cache
                        .add_entry(e)
                        .await
                        .map_err(|e| MuxerError::Cache(e.to_string()))?;
                }
                while let Ok(b) = inner.batch_rx.try_recv() {
                    for e in b {
                        cache
                            .add_entry(e)
                            .await
                            .map_err(|e| MuxerError::Cache(e.to_string()))?;
                    }
                }
                while let Some(item) = inner.eq.pop() {
                    if let Some(e) = item.entry {
                        cache
                            .add_entry(e)
                            .await
                            .map_err(|e| MuxerError::Cache(e.to_string()))?;
                    }
                    if let Some(b) = item.batch {
                        for e in b {
                            cache
                                .add_entry(e)
                                .await
                                .map_err(|e| MuxerError::Cache(e.to_string()))?;
                        }
                    }
                }
                cache
                    .sync()
                    .await
                    .map_err(|e| MuxerError::Cache(e.to_string()))?;
            }
            let tags = inner.shared.read().tags.clone();
            cache
                .update_stored_tag_list(&tags)
                .await
                .map_err(|e| MuxerError::Cache(e.to_string()))?;
            cache
                .close()
                .await
                .map_err(|e| MuxerError::Cache(e.to_string()))?;
        }
        Ok(())
    }

    /// Queue an entry for delivery by the first available writer
    ///
    /// If every connection is down this blocks once the channel fills; that
    /// is the natural backpressure mechanism, there are no silent drops at
    /// the API boundary.
    ///
    /// # Errors
    ///
    /// Returns `NotRunning` outside the running state.
    pub async fn write_entry(&self, e: Entry) -> Result<()> {
        self.inner.check_running()?;
        self.inner
            .entry_tx
            .send(e)
            .await
            .map_err(|_| MuxerError::NotRunning)
    }

    /// Queue an entry, giving up when the token is cancelled
    pub async fn write_entry_cancel(&self, cancel: &CancellationToken, e: Entry) -> Result<()> {
        self.inner.check_running()?;
        tokio::select! {
            r = self.inner.entry_tx.send(e) => r.map_err(|_| MuxerError::NotRunning),
            _ = cancel.cancelled() => Err(MuxerError::Cancelled),
        }
    }

    /// Queue an entry, giving up after a timeout
    ///
    /// Opportunistic and comparatively expensive; prefer
    /// [`write_entry`](Self::write_entry) for normal writes.
    pub async fn write_entry_timeout(&self, e: Entry, timeout: Duration) -> Result<()> {
        self.inner.check_running()?;
        match tokio::time::timeout(timeout, self.inner.entry_tx.send(e)).await {
            Ok(r) => r.map_err(|_| MuxerError::NotRunning),
            Err(_) => Err(MuxerError::WriteTimeout),
        }
    }

    /// Queue a batch for delivery by a single writer
    ///
    /// The consuming writer takes the whole slice, so very large batches all
    /// land on one indexer. An empty batch is a no-op.
    pub async fn write_batch(&self, b: Vec<Entry>) -> Result<()> {
        if b.is_empty() {
            return Ok(());
        }
        self.inner.check_running()?;
        self.inner
            .batch_tx
            .send(b)
            .await
            .map_err(|_| MuxerError::NotRunning)
    }

    /// Queue a batch, giving up when the token is cancelled
    pub async fn write_batch_cancel(
        &self,
        cancel: &CancellationToken,
        b: Vec<Entry>,
    ) -> Result<()> {
        if b.is_empty() {
            return Ok(());
        }
        self.inner.check_running()?;
        tokio::select! {
            r = self.inner.batch_tx.send(b) => r.map_err(|_| MuxerError::NotRunning),
            _ = cancel.cancelled() => Err(MuxerError::Cancelled),
        }
    }

    /// Build an entry from parts and queue it
    pub async fn write(
        &self,
        ts: Timestamp,
        tag: EntryTag,
        data: impl Into<bytes::Bytes>,
    ) -> Result<()> {
        self.write_entry(Entry::new(ts, tag, data)).await
    }

    /// [`write`](Self::write) with caller-side cancellation
    pub async fn write_cancel(
        &self,
        cancel: &CancellationToken,
        ts: Timestamp,
        tag: EntryTag,
        data: impl Into<bytes::Bytes>,
    ) -> Result<()> {
        self.write_entry_cancel(cancel, Entry::new(ts, tag, data))
            .await
    }

    /// Look up the local id for a tag name
    ///
    /// # Errors
    ///
    /// Returns `TagNotFound` if the name was never negotiated.
    pub fn get_tag(&self, name: &str) -> Result<EntryTag> {
        self.inner
            .shared
            .read()
            .tag_map
            .get(name)
            .copied()
            .ok_or(MuxerError::TagNotFound)
    }

    /// Reverse a local tag id into its name
    pub fn lookup_tag(&self, tag: EntryTag) -> Option<String> {
        self.inner.lookup_tag(tag)
    }

    /// Negotiate a tag name with every live connection
    ///
    /// Idempotent: an already-known name returns its existing id without
    /// touching any connection. Otherwise the name is appended to the tag
    /// table (new id = prior length), persisted to a file-backed cache, and
    /// negotiated with each live connection, registering the returned remote
    /// id into that connection's translator. A connection that fails
    /// negotiation or registration is closed so its task rebuilds a fresh,
    /// fully-populated translator.
    pub async fn negotiate_tag(&self, name: &str) -> Result<EntryTag> {
        check_tag(name)?;
        let inner = &self.inner;
        let _serialized = inner.negotiate_lock.lock().await;

        if let Some(&tag) = inner.shared.read().tag_map.get(name) {
            return Ok(tag);
        }

        let (tag, tags_snapshot, live) = {
            let mut sh = inner.shared.write();
            let tag = sh.tags.len() as EntryTag;
            sh.tags.push(name.to_string());
            sh.tag_map.insert(name.to_string(), tag);
            let live: Vec<(Arc<dyn IndexerConnection>, Option<Arc<TagTranslator>>)> = sh
                .conns
                .iter()
                .zip(sh.translators.iter())
                .filter_map(|(c, t)| c.clone().map(|c| (c, t.clone())))
                .collect();
            (tag, sh.tags.clone(), live)
        };

        if inner.cache_file_backed {
            if let Some(cache) = &inner.cache {
                cache
                    .update_stored_tag_list(&tags_snapshot)
                    .await
                    .map_err(|e| MuxerError::Cache(e.to_string()))?;
            }
        }

        for (conn, tt) in live {
            match conn.negotiate_tag(name).await {
                Ok(remote) => match tt {
                    Some(tt) => {
                        if tt.register_tag(tag, remote).is_err() {
                            // translator drifted from the tag table; force a
                            // reconnect to rebuild it
                            let _ = conn.close().await;
                        }
                    }
                    None => {
                        let _ = conn.close().await;
                    }
                },
                Err(err) => {
                    tracing::warn!(tag = name, error = %err, "tag negotiation failed, closing connection");
                    let _ = conn.close().await;
                }
            }
        }
        Ok(tag)
    }

    /// Wait until both channels are empty, then flush every live connection
    ///
    /// # Errors
    ///
    /// Returns `AllConnsDown` if no connection is hot and the cache is not
    /// running, and `Timeout` if the channels do not drain in time.
    pub async fn sync(&self, timeout: Duration) -> Result<()> {
        self.sync_cancel(&CancellationToken::new(), timeout).await
    }

    /// [`sync`](Self::sync) with caller-side cancellation
    pub async fn sync_cancel(&self, cancel: &CancellationToken, timeout: Duration) -> Result<()> {
        let inner = &self.inner;
        if inner.hot_count() == 0 && !inner.cache_running.load(Ordering::Acquire) {
            return Err(MuxerError::AllConnsDown);
        }
        let start = Instant::now();
        while !inner.entry_tx.is_empty() || !inner.batch_tx.is_empty() {
            if cancel.is_cancelled() {
                return Err(MuxerError::Cancelled);
            }
            tokio::time::sleep(SYNC_POLL).await;
            if inner.hot_count() == 0 {
                return Err(MuxerError::AllConnsDown);
            }
            if start.elapsed() > timeout {
                return Err(MuxerError::Timeout);
            }
        }

        let (conns, total) = {
            let sh = inner.shared.read();
            (
                sh.conns.iter().flatten().cloned().collect::<Vec<_>>(),
                sh.conns.len(),
            )
        };
        let mut not_running = 0usize;
        for conn in &conns {
            if let Err(IndexerError::NotRunning) = conn.sync().await {
                not_running += 1;
            }
        }
        if not_running == total {
            return Err(MuxerError::AllConnsDown);
        }
        Ok(())
    }

    /// Wait until at least one connection is hot
    ///
    /// `None` waits indefinitely. If the timeout elapses while a file-backed
    /// cache is running without error, this still returns success: entries
    /// are landing somewhere safe.
    pub async fn wait_for_hot(&self, timeout: Option<Duration>) -> Result<()> {
        self.wait_for_hot_cancel(&CancellationToken::new(), timeout)
            .await
    }

    /// [`wait_for_hot`](Self::wait_for_hot) with caller-side cancellation
    pub async fn wait_for_hot_cancel(
        &self,
        cancel: &CancellationToken,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let inner = &self.inner;
        if self.hot()? > 0 {
            return Ok(());
        }

        let mut base_tick = WAIT_TICK;
        if let Some(to) = timeout {
            if to < base_tick {
                base_tick = to;
            }
        }
        let start = Instant::now();
        let mut up_rx = inner.up_rx.lock().await;
        let mut err_rx = inner.err_rx.lock().await;

        loop {
            // jitter keeps a fleet of waiters from polling in lockstep
            let tick = base_tick + Duration::from_millis(rand::rng().random_range(0..25));
            tokio::select! {
                _ = cancel.cancelled() => return Err(MuxerError::Cancelled),
                _ = up_rx.recv() => {
                    inner.diag_info(format!("ingester {} has gone hot", inner.name));
                    return Ok(());
                }
                _ = tokio::time::sleep(tick) => {
                    if self.hot()? > 0 {
                        return Ok(());
                    }
                    match timeout {
                        None => continue,
                        Some(to) if start.elapsed() < to => continue,
                        Some(_) => {}
                    }
                    if inner.cache_running.load(Ordering::Acquire)
                        && inner.cache_error.lock().is_none()
                        && inner.cache_file_backed
                    {
                        return Ok(());
                    }
                    return Err(MuxerError::ConnectionTimeout);
                }
                e = err_rx.recv() => {
                    if let Some(msg) = e {
                        let sh = inner.shared.read();
                        if sh.err_dests.len() == inner.dests.len() {
                            return Err(MuxerError::AllConnsFailed(msg));
                        }
                    }
                }
            }
        }
    }

    /// Number of hot connections
    pub fn hot(&self) -> Result<usize> {
        self.inner.check_running()?;
        Ok(self.inner.hot_count())
    }

    /// Number of dead connections
    pub fn dead(&self) -> Result<usize> {
        self.inner.check_running()?;
        Ok(self.inner.conn_dead.load(Ordering::Acquire).max(0) as usize)
    }

    /// Total number of configured destinations
    pub fn size(&self) -> Result<usize> {
        self.inner.check_running()?;
        Ok(self.inner.dests.len())
    }

    /// First non-loopback source address reported by a connection
    ///
    /// Falls back to loopback when every connection reports it; errors only
    /// when no connection can report at all.
    pub async fn source_ip(&self) -> Result<IpAddr> {
        let inner = &self.inner;
        let conns: Vec<Arc<dyn IndexerConnection>> = {
            let sh = inner.shared.read();
            if inner.hot_count() == 0 || sh.conns.is_empty() {
                return Err(MuxerError::AllConnsDown);
            }
            sh.conns.iter().flatten().cloned().collect()
        };
        let mut found = None;
        let mut was_err = false;
        for conn in conns {
            match conn.source_ip().await {
                Err(_) => was_err = true,
                Ok(ip) if ip.is_loopback() => {}
                Ok(ip) => found = Some(ip),
            }
        }
        if let Some(ip) = found {
            return Ok(ip);
        }
        if !was_err {
            // every connection is local; that can happen
            return Ok(IpAddr::V4(Ipv4Addr::LOCALHOST));
        }
        Err(MuxerError::SourceUnavailable)
    }

    /// Snapshot of the muxer counters
    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }
}

impl MuxerInner {
    pub(crate) fn check_running(&self) -> Result<()> {
        if self.shared.read().state == MuxState::Running {
            Ok(())
        } else {
            Err(MuxerError::NotRunning)
        }
    }

    pub(crate) fn hot_count(&self) -> usize {
        self.conn_hot.load(Ordering::Acquire).max(0) as usize
    }

    /// Reverse a local id into its name; `None` means the producer handed us
    /// a tag the muxer never issued
    pub(crate) fn lookup_tag(&self, tag: EntryTag) -> Option<String> {
        self.shared.read().tags.get(tag as usize).cloned()
    }

    /// Flip this destination dead -> hot
    pub(crate) fn go_hot(&self) {
        self.conn_dead.fetch_sub(1, Ordering::AcqRel);
        if self.conn_hot.fetch_add(1, Ordering::AcqRel) + 1 == 1 {
            // first hot connection: tell the cache controller to wind down
            self.signal_cache(false);
        }
        let _ = self.up_tx.try_send(true);
    }

    /// Flip this destination hot -> dead
    pub(crate) fn go_dead(&self) {
        if self.conn_hot.fetch_sub(1, Ordering::AcqRel) - 1 == 0 {
            // last hot connection gone: tell the cache controller to take over
            self.signal_cache(true);
        }
        self.conn_dead.fetch_add(1, Ordering::AcqRel);
    }

    /// Best-effort nudge to the cache controller; a dropped edge is fine
    /// because the controller re-checks the hot count on every wakeup
    fn signal_cache(&self, conn_died: bool) {
        if self.cache_running.load(Ordering::Acquire) {
            let _ = self.cache_signal_tx.try_send(conn_died);
        }
    }

    /// Record a destination's terminal failure
    pub(crate) fn conn_failed(&self, address: &str, error: String) {
        self.shared.write().err_dests.push(TargetError {
            address: address.to_string(),
            error: error.clone(),
        });
        let _ = self.err_tx.try_send(error);
    }

    /// Whether a writer should yield after a successful write so its
    /// siblings get a turn; only worth it with multiple destinations and
    /// idle channels
    pub(crate) fn should_sched(&self) -> bool {
        self.dests.len() > 1 && self.entry_tx.is_empty() && self.batch_tx.is_empty()
    }

    /// Re-inject entries carried by a failing connection
    ///
    /// Tags are restored to local space first when `reverse_tags` is set.
    /// Each item gets up to the shared one-second window on its channel;
    /// whatever the channels will not take is parked in the emergency queue
    /// instead of blocking the reconnect path.
    pub(crate) async fn recycle_entries(
        &self,
        mut entry: Option<Entry>,
        mut batch: Option<Vec<Entry>>,
        tt: &TagTranslator,
        reverse_tags: bool,
    ) {
        let count =
            entry.is_some() as u64 + batch.as_ref().map_or(0, |b| b.len()) as u64;
        if count == 0 {
            return;
        }
        self.metrics.record_recycled(count);

        if reverse_tags {
            if let Some(mut e) = entry.take() {
                match tt.reverse(e.tag) {
                    Some(local) => {
                        e.tag = local;
                        entry = Some(e);
                    }
                    None => {
                        tracing::error!(tag = e.tag, "cannot reverse remote tag, dropping entry");
                        self.metrics.record_dropped(1);
                    }
                }
            }
            if let Some(b) = batch.as_mut() {
                let len = b.len();
                reverse_prefix(b, len, tt);
            }
        }

        let deadline = Instant::now() + RECYCLE_TIMEOUT;
        if let Some(e) = entry.take() {
            if let Err(e) = send_until(&self.entry_tx, e, deadline).await {
                self.park(Some(e), batch.take());
                return;
            }
        }
        if let Some(b) = batch.take() {
            if !b.is_empty() {
                if let Err(b) = send_until(&self.batch_tx, b, deadline).await {
                    self.park(None, Some(b));
                }
            }
        }
    }

    /// Park items in the emergency queue, dropping on overflow
    fn park(&self, entry: Option<Entry>, batch: Option<Vec<Entry>>) {
        let count = entry.is_some() as u64 + batch.as_ref().map_or(0, |b| b.len()) as u64;
        match self.eq.push(entry, batch) {
            Ok(()) => self.metrics.record_emergency_push(),
            Err(_) => {
                self.metrics.record_emergency_overflow();
                self.metrics.record_dropped(count);
                tracing::error!(entries = count, "emergency queue overflow, dropping entries");
            }
        }
    }

    // Diagnostic stream: always goes to tracing, and when the configured
    // level permits, also into the muxer itself under the reserved tag so
    // the ingester's own lifecycle lands at the indexers.

    pub(crate) fn diag_error(&self, msg: String) {
        tracing::error!(ingester = %self.name, "{msg}");
        self.diag_inject(LogLevel::Error, &msg);
    }

    pub(crate) fn diag_warn(&self, msg: String) {
        tracing::warn!(ingester = %self.name, "{msg}");
        self.diag_inject(LogLevel::Warn, &msg);
    }

    pub(crate) fn diag_info(&self, msg: String) {
        tracing::info!(ingester = %self.name, "{msg}");
        self.diag_inject(LogLevel::Info, &msg);
    }

    /// Inject a diagnostic entry, never blocking: a full channel drops the
    /// diagnostic rather than wedging the task that produced it
    fn diag_inject(&self, level: LogLevel, msg: &str) {
        if self.log_level < level {
            return;
        }
        if self.shared.read().state != MuxState::Running {
            return;
        }
        let ts = chrono::Utc::now();
        let line = format!("{} {} {}", ts.to_rfc3339(), level, msg);
        let _ = self
            .entry_tx
            .try_send(Entry::new(ts, RESERVED_TAG_ID, line.into_bytes()));
    }
}

/// Push onto a bounded channel without losing the item, up to a deadline
///
/// `try_send` keeps ownership on failure, which is what lets the caller park
/// the item instead of dropping it.
async fn send_until<T>(tx: &MAsyncTx<T>, mut item: T, deadline: Instant) -> std::result::Result<(), T>
where
    T: Send + Unpin + 'static,
{
    loop {
        match tx.try_send(item) {
            Ok(()) => return Ok(()),
            Err(TrySendError::Full(it)) => item = it,
            Err(TrySendError::Disconnected(it)) => return Err(it),
        }
        if Instant::now() >= deadline {
            return Err(item);
        }
        tokio::time::sleep(SEND_POLL).await;
    }
}

#[cfg(test)]
#[path = "muxer_test.rs"]
mod muxer_test;
