//! Writer task
//!
//! One writer runs per destination, paired with its connection task through
//! a capacity-1 hand-off channel (new connections in) and a capacity-1
//! notification channel (trouble out). The writer pulls from the shared
//! entry and batch channels, translates tags through the connection's
//! translator, and drains the emergency queue opportunistically on a
//! jittered ticker.

use std::time::Duration;

use rand::Rng;
use tokio::sync::mpsc;
use tokio::time::Instant;

use ingest_entry::Entry;

use crate::emergency::reverse_prefix;
use crate::muxer::{ConnSet, MuxerInner};

/// Jittered period for the opportunistic drain-and-sync ticker
fn ticker_interval() -> Duration {
    Duration::from_millis(750 + rand::rng().random_range(0..500))
}

impl MuxerInner {
    /// Relay loop for one destination
    ///
    /// Runs until the die signal fires, both producer channels close, or the
    /// hand-off channel closes (the connection task gave up).
    pub(crate) async fn write_relay_task(
        self: std::sync::Arc<Self>,
        mut csc_rx: mpsc::Receiver<ConnSet>,
        err_tx: mpsc::Sender<()>,
    ) {
        // each consumer task owns its channel handles
        let entry_rx = self.entry_rx.clone();
        let batch_rx = self.batch_rx.clone();

        let mut nc = match self.get_new_conn_set(&mut csc_rx, &err_tx, true).await {
            Some(nc) => nc,
            None => return,
        };

        let mut entries_open = true;
        let mut batches_open = true;
        let mut tick_deadline = Instant::now() + ticker_interval();

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    let _ = nc.conn.sync().await;
                    let _ = nc.conn.close().await;
                    return;
                }
                r = entry_rx.recv(), if entries_open => match r {
                    Err(_) => {
                        entries_open = false;
                        if !batches_open {
                            return;
                        }
                    }
                    Ok(e) => {
                        if !self
                            .relay_entry(e, &mut nc, &mut csc_rx, &err_tx, &mut tick_deadline)
                            .await
                        {
                            return;
                        }
                    }
                },
                r = batch_rx.recv(), if batches_open => match r {
                    Err(_) => {
                        batches_open = false;
                        if !entries_open {
                            return;
                        }
                    }
                    Ok(b) => {
                        if !self
                            .relay_batch(b, &mut nc, &mut csc_rx, &err_tx, &mut tick_deadline)
                            .await
                        {
                            return;
                        }
                    }
                },
                r = csc_rx.recv() => match r {
                    // an unexpected replacement connection: just an update
                    Some(fresh) => nc = fresh,
                    None => {
                        let _ = nc.conn.sync().await;
                        let _ = nc.conn.close().await;
                        return;
                    }
                },
                _ = tokio::time::sleep_until(tick_deadline) => {
                    // periodic emergency-queue drain and sync
                    if !self.eq.clear(nc.conn.as_ref(), &nc.tt).await
                        || nc.conn.sync().await.is_err()
                    {
                        if !self.replace_conn_set(&mut nc, &mut csc_rx, &err_tx).await {
                            return;
                        }
                    }
                    tick_deadline = Instant::now() + ticker_interval();
                }
            }
        }
    }

    /// Translate and deliver one entry; `false` means the task must exit
    async fn relay_entry(
        &self,
        mut e: Entry,
        nc: &mut ConnSet,
        csc_rx: &mut mpsc::Receiver<ConnSet>,
        err_tx: &mpsc::Sender<()>,
        tick_deadline: &mut Instant,
    ) -> bool {
        let (remote, ok) = nc.tt.translate(e.tag);
        if !ok {
            match self.lookup_tag(e.tag) {
                None => {
                    // the muxer never issued this tag; nothing sane to do
                    tracing::error!(tag = e.tag, "entry carries unknown tag, dropping it");
                    self.metrics.record_dropped(1);
                    return true;
                }
                Some(name) => {
                    // a valid tag this connection has not negotiated: park
                    // the untranslated entry and force a fresh translator
                    self.diag_info(format!(
                        "entry tagged {name} ({}) needs connection renegotiation",
                        e.tag
                    ));
                    self.recycle_entries(Some(e), None, &nc.tt, false).await;
                    return self.replace_conn_set(nc, csc_rx, err_tx).await;
                }
            }
        }
        e.tag = remote;
        if e.src.is_none() {
            e.src = Some(nc.src);
        }
        if let Err(err) = nc.conn.write_entry(&e).await {
            tracing::warn!(dest = %nc.dest, error = %err, "entry write failed, recycling");
            self.recycle_entries(Some(e), None, &nc.tt, true).await;
            return self.replace_conn_set(nc, csc_rx, err_tx).await;
        }
        self.metrics.record_entry_written();
        self.maybe_yield(nc, csc_rx, err_tx, tick_deadline).await
    }

    /// Translate and deliver one batch; `false` means the task must exit
    async fn relay_batch(
        &self,
        mut b: Vec<Entry>,
        nc: &mut ConnSet,
        csc_rx: &mut mpsc::Receiver<ConnSet>,
        err_tx: &mpsc::Sender<()>,
        tick_deadline: &mut Instant,
    ) -> bool {
        let mut i = 0;
        while i < b.len() {
            let (remote, ok) = nc.tt.translate(b[i].tag);
            if !ok {
                match self.lookup_tag(b[i].tag) {
                    None => {
                        // only the offending entry is dropped, the rest of
                        // the batch is still good
                        tracing::error!(tag = b[i].tag, "batch entry carries unknown tag, dropping it");
                        self.metrics.record_dropped(1);
                        b.remove(i);
                        continue;
                    }
                    Some(name) => {
                        self.diag_info(format!(
                            "batch entry tagged {name} ({}) needs connection renegotiation",
                            b[i].tag
                        ));
                        reverse_prefix(&mut b, i, &nc.tt);
                        self.recycle_entries(None, Some(b), &nc.tt, false).await;
                        return self.replace_conn_set(nc, csc_rx, err_tx).await;
                    }
                }
            }
            b[i].tag = remote;
            if b[i].src.is_none() {
                b[i].src = Some(nc.src);
            }
            i += 1;
        }
        if b.is_empty() {
            return true;
        }
        if let Err(err) = nc.conn.write_batch(&b).await {
            tracing::warn!(dest = %nc.dest, error = %err, "batch write failed, recycling");
            self.recycle_entries(None, Some(b), &nc.tt, true).await;
            return self.replace_conn_set(nc, csc_rx, err_tx).await;
        }
        self.metrics.record_batch_written(b.len() as u64);
        self.maybe_yield(nc, csc_rx, err_tx, tick_deadline).await
    }

    /// Cooperative yield after a successful write when traffic is light
    ///
    /// With more than one destination and empty channels, drain the
    /// emergency queue, sync, reset the ticker, and give the other writers a
    /// turn so one task does not monopolize the channels.
    async fn maybe_yield(
        &self,
        nc: &mut ConnSet,
        csc_rx: &mut mpsc::Receiver<ConnSet>,
        err_tx: &mpsc::Sender<()>,
        tick_deadline: &mut Instant,
    ) -> bool {
        if !self.should_sched() {
            return true;
        }
        if !self.eq.clear(nc.conn.as_ref(), &nc.tt).await || nc.conn.sync().await.is_err() {
            if !self.replace_conn_set(nc, csc_rx, err_tx).await {
                return false;
            }
        }
        *tick_deadline = Instant::now() + ticker_interval();
        tokio::task::yield_now().await;
        true
    }

    /// Swap in a replacement connection; `false` means the hand-off channel
    /// closed and the task must exit
    async fn replace_conn_set(
        &self,
        nc: &mut ConnSet,
        csc_rx: &mut mpsc::Receiver<ConnSet>,
        err_tx: &mpsc::Sender<()>,
    ) -> bool {
        match self.get_new_conn_set(csc_rx, err_tx, false).await {
            Some(fresh) => {
                *nc = fresh;
                true
            }
            None => false,
        }
    }

    /// Receive a usable connection from the connection task
    ///
    /// Every received connection must first swallow the emergency queue and
    /// sync; one that cannot is reported broken and the wait continues.
    /// Returns `None` when the hand-off channel is closed.
    pub(crate) async fn get_new_conn_set(
        &self,
        csc_rx: &mut mpsc::Receiver<ConnSet>,
        err_tx: &mpsc::Sender<()>,
        first: bool,
    ) -> Option<ConnSet> {
        if !first {
            // best effort: the notification channel may already hold one
            let _ = err_tx.try_send(());
        }
        loop {
            let nc = csc_rx.recv().await?;
            if !self.eq.clear(nc.conn.as_ref(), &nc.tt).await || nc.conn.sync().await.is_err() {
                let _ = err_tx.try_send(());
                continue;
            }
            if first {
                self.diag_info(format!("connected to {}", nc.dest));
            } else {
                self.metrics.record_reconnect();
                self.diag_info(format!("re-connected to {}", nc.dest));
            }
            return Some(nc);
        }
    }
}
