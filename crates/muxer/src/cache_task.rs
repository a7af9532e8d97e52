//! Cache controller task
//!
//! Coordinates the spool cache with the hot-connection count. The cache
//! always starts consuming when the controller comes up, so entries have a
//! consumer before the first connection lands. Edge notifications arrive on
//! a capacity-1 boolean channel fed by best-effort sends from the hot/dead
//! transitions; coalesced edges are fine because the controller re-checks
//! the authoritative hot count on every wakeup.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use crossfire::TrySendError;
use tokio::sync::mpsc;

use crate::cache::{CacheError, IngestCache};
use crate::muxer::MuxerInner;

/// Retry increment while a popped block waits for channel capacity
const UNLOAD_POLL: Duration = Duration::from_millis(10);

impl MuxerInner {
    /// Controller loop; runs for the life of the muxer when the cache is
    /// enabled
    pub(crate) async fn cache_controller_task(self: Arc<Self>) {
        let Some(cache) = self.cache.clone() else {
            self.cache_running.store(false, Ordering::Release);
            return;
        };

        // start consuming immediately so entries always have somewhere to go
        if let Err(err) = cache
            .start(self.entry_rx.clone(), self.batch_rx.clone())
            .await
        {
            self.set_cache_error(err);
            self.cache_running.store(false, Ordering::Release);
            return;
        }
        self.metrics.record_cache_activation();
        let mut active = true;

        let mut sig_rx = self.cache_signal_rx.lock().await;

        'main: loop {
            tokio::select! {
                _ = self.cache_cancel.cancelled() => break 'main,
                s = sig_rx.recv() => {
                    if s.is_none() {
                        break 'main;
                    }
                    if self.hot_count() > 0 {
                        if active {
                            // a connection went hot: stop spooling and pump
                            // the stored blocks back out
                            active = false;
                            if let Err(err) = cache.stop().await {
                                self.set_cache_error(err);
                                break 'main;
                            }
                            match self.unload_cache(cache.as_ref(), &mut sig_rx).await {
                                Err(err) => {
                                    self.set_cache_error(err);
                                    break 'main;
                                }
                                Ok(false) => {
                                    // connections died mid-unload; spool again
                                    active = true;
                                    if let Err(err) = cache
                                        .start(self.entry_rx.clone(), self.batch_rx.clone())
                                        .await
                                    {
                                        self.set_cache_error(err);
                                        break 'main;
                                    }
                                    self.metrics.record_cache_activation();
                                }
                                Ok(true) => {}
                            }
                        }
                        // already inactive and another connection came up: no-op
                    } else if !active {
                        // the last hot connection just died
                        active = true;
                        if let Err(err) = cache
                            .start(self.entry_rx.clone(), self.batch_rx.clone())
                            .await
                        {
                            self.set_cache_error(err);
                            break 'main;
                        }
                        self.metrics.record_cache_activation();
                    }
                }
            }
        }

        if active {
            if let Err(err) = cache.stop().await {
                self.set_cache_error(err);
            }
        }
        self.cache_running.store(false, Ordering::Release);
    }

    /// Pump stored blocks onto the batch channel
    ///
    /// Returns `Ok(true)` when the cache is drained. Returns `Ok(false)`
    /// when every connection died mid-unload (or the controller is shutting
    /// down); the in-flight block goes back into the cache first so nothing
    /// is lost.
    async fn unload_cache(
        &self,
        cache: &dyn IngestCache,
        sig_rx: &mut mpsc::Receiver<bool>,
    ) -> Result<bool, CacheError> {
        loop {
            let Some(mut block) = cache.pop_block().await? else {
                return Ok(true);
            };
            loop {
                block = match self.batch_tx.try_send(block) {
                    Ok(()) => break,
                    Err(TrySendError::Disconnected(b)) => {
                        cache.add_block(b).await?;
                        return Ok(false);
                    }
                    Err(TrySendError::Full(b)) => b,
                };
                let sig = sig_rx.try_recv();
                let closing = matches!(sig, Err(mpsc::error::TryRecvError::Disconnected))
                    || self.cache_cancel.is_cancelled();
                if closing || (sig.is_ok() && self.hot_count() == 0) {
                    cache.add_block(block).await?;
                    return Ok(false);
                }
                tokio::time::sleep(UNLOAD_POLL).await;
            }
        }
    }

    fn set_cache_error(&self, err: CacheError) {
        tracing::error!(error = %err, "cache controller error");
        *self.cache_error.lock() = Some(err.to_string());
    }
}
