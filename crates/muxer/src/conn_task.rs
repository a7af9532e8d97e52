//! Connection task
//!
//! One per destination. Owns the reconnect loop: dial, build the tag
//! translator, identify, poll ingest readiness, install the connection into
//! the muxer slots, and hand it to the paired writer. When the writer
//! reports trouble, the dying connection's unconfirmed entries are recycled
//! and the loop starts over. Fatal (configuration-level) errors terminate
//! the task permanently and record the destination as failed.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::connection::{ConnectParams, IndexerConnection, Target};
use crate::error::MuxerError;
use crate::muxer::{ConnSet, MuxerInner};
use crate::translator::TagTranslator;

/// How often ingest readiness is re-polled while the indexer reports not-ok
const INGEST_OK_POLL: Duration = Duration::from_secs(5);

/// Why `get_connection` gave up
enum ConnectAbort {
    /// Configuration-level failure; retrying can never succeed
    Fatal(String),
    /// The muxer is shutting down
    Closing,
}

impl MuxerInner {
    /// Reconnect loop for one destination
    pub(crate) async fn connection_task(self: Arc<Self>, idx: usize) {
        let dst = self.dests[idx].clone();
        let (csc_tx, csc_rx) = mpsc::channel::<ConnSet>(1);
        let (err_tx, mut err_rx) = mpsc::channel::<()>(1);
        let writer = tokio::spawn(self.clone().write_relay_task(csc_rx, err_tx));

        let mut cur: Option<(Arc<dyn IndexerConnection>, Arc<TagTranslator>)> = None;

        loop {
            if let Some((conn, tt)) = cur.take() {
                // block until the writer reports trouble; a closed channel
                // means the writer itself exited
                let notified = err_rx.recv().await;
                self.diag_warn(format!("reconnecting to {}", dst.address));
                let _ = conn.close().await;
                self.go_dead();
                if notified.is_none() {
                    self.conn_failed(&dst.address, "closed".into());
                    break;
                }
                {
                    let mut sh = self.shared.write();
                    sh.conns[idx] = None;
                    sh.translators[idx] = None;
                }
                // pull the dying connection's unconfirmed entries back out
                let ents = conn.outstanding_entries().await;
                if !ents.is_empty() {
                    self.recycle_entries(None, Some(ents), &tt, true).await;
                }
            }

            let (conn, tt) = match self.get_connection(&dst).await {
                Ok(v) => v,
                Err(ConnectAbort::Fatal(msg)) => {
                    self.conn_failed(&dst.address, msg);
                    break;
                }
                Err(ConnectAbort::Closing) => break,
            };

            let src = match conn.source_ip().await {
                Ok(src) => src,
                Err(err) => {
                    let _ = conn.close().await;
                    self.conn_failed(&dst.address, err.to_string());
                    break;
                }
            };

            {
                let mut sh = self.shared.write();
                sh.conns[idx] = Some(conn.clone());
                sh.translators[idx] = Some(tt.clone());
            }
            self.go_hot();

            let set = ConnSet {
                conn: conn.clone(),
                tt: tt.clone(),
                dest: dst.address.clone(),
                src,
            };
            if csc_tx.send(set).await.is_err() {
                // writer is gone; undo the hot transition and bail
                self.go_dead();
                let _ = conn.close().await;
                self.conn_failed(&dst.address, "closed".into());
                break;
            }
            cur = Some((conn, tt));
        }

        // closing the hand-off channel is what tells the writer to stop
        drop(csc_tx);
        let _ = writer.await;
    }

    /// Dial until a connection is hot-ready or the attempt must be abandoned
    ///
    /// Transient failures sleep out the retry window; translator, identify,
    /// and readiness failures restart the whole attempt so the session is
    /// never half-initialized.
    async fn get_connection(
        &self,
        dst: &Target,
    ) -> Result<(Arc<dyn IndexerConnection>, Arc<TagTranslator>), ConnectAbort> {
        'retry: loop {
            if self.cancel.is_cancelled() {
                return Err(ConnectAbort::Closing);
            }
            let params = ConnectParams {
                target: dst.clone(),
                // snapshot: the translator below covers exactly this list
                tags: self.shared.read().tags.clone(),
                tls: self.tls.clone(),
                rate_limit_bps: self.rate_limit_bps,
            };
            let conn = match self.factory.connect(&params).await {
                Ok(conn) => conn,
                Err(err) if err.is_fatal() => {
                    self.diag_error(format!(
                        "fatal connection error on {}: {err}",
                        dst.address
                    ));
                    return Err(ConnectAbort::Fatal(err.to_string()));
                }
                Err(err) => {
                    self.diag_warn(format!("connection error on {}: {err}", dst.address));
                    tokio::select! {
                        _ = tokio::time::sleep(self.retry_interval) => continue 'retry,
                        _ = self.cancel.cancelled() => return Err(ConnectAbort::Closing),
                    }
                }
            };

            let tt = match self.new_tag_translator(conn.as_ref(), &params.tags).await {
                Ok(tt) => Arc::new(tt),
                Err(err) => {
                    let _ = conn.close().await;
                    self.diag_error(format!(
                        "failed to build tag translation map for {}: {err}",
                        dst.address
                    ));
                    continue 'retry;
                }
            };

            if let Err(err) = conn.identify(&self.name, &self.version, &self.uuid).await {
                let _ = conn.close().await;
                self.diag_error(format!(
                    "failed to identify ingester on {}: {err}",
                    dst.address
                ));
                continue 'retry;
            }

            loop {
                if self.cancel.is_cancelled() {
                    let _ = conn.close().await;
                    return Err(ConnectAbort::Closing);
                }
                match conn.ingest_ok().await {
                    Err(err) => {
                        let _ = conn.close().await;
                        self.diag_error(format!(
                            "ingest readiness query failed on {}: {err}",
                            dst.address
                        ));
                        continue 'retry;
                    }
                    Ok(true) => break,
                    Ok(false) => {
                        tokio::select! {
                            _ = tokio::time::sleep(INGEST_OK_POLL) => {}
                            _ = self.cancel.cancelled() => {
                                let _ = conn.close().await;
                                return Err(ConnectAbort::Closing);
                            }
                        }
                    }
                }
            }

            self.diag_info(format!("successfully connected to {}", dst.address));
            return Ok((conn, tt));
        }
    }

    /// Build a dense translator over the given tag snapshot
    ///
    /// Every tag must already be known to the connection (it negotiated the
    /// list during the handshake); a miss aborts so the caller retries with
    /// a clean session.
    async fn new_tag_translator(
        &self,
        conn: &dyn IndexerConnection,
        tags: &[String],
    ) -> Result<TagTranslator, MuxerError> {
        if tags.is_empty() {
            return Err(MuxerError::TagMapInvalid);
        }
        let mut remote = Vec::with_capacity(tags.len());
        for name in tags {
            match conn.get_tag(name).await {
                Some(r) => remote.push(r),
                None => return Err(MuxerError::TagNotFound),
            }
        }
        Ok(TagTranslator::from_remote(remote))
    }
}
