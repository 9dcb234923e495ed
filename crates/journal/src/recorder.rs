//! Records the source's change feeds, verbatim, into a journal.
//!
//! Every kind gets its own consumer task; all of them append to one shared
//! [`JournalWriter`] so the journal holds events in arrival order. The journal
//! is rewritten after each event. A failed write is logged and recording
//! goes on.

use std::sync::Arc;

use futures::StreamExt;
use kopy_core::{sync_order, ChangeFeed, Error, FeedEvent, ObjectKind, ObjectStore, Result};
use metrics::counter;
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::journal::{Journal, JournalWriter, Record};

pub struct Recorder {
    source: Arc<dyn ObjectStore>,
    journal: Journal,
    kinds: Vec<ObjectKind>,
}

impl Recorder {
    /// Records every kind of the sync order unless [`Recorder::with_kinds`] narrows it.
    pub fn new(source: Arc<dyn ObjectStore>, journal: Journal) -> Self {
        Self { source, journal, kinds: sync_order() }
    }

    pub fn with_kinds(mut self, kinds: Vec<ObjectKind>) -> Self {
        self.kinds = kinds;
        self
    }

    /// Start an empty journal and open every feed. Returns once each feed has
    /// delivered its initial listing; recording continues until `cancel`.
    /// A feed that fails to open stops the feeds already recording.
    pub async fn run(&self, cancel: CancellationToken) -> Result<RecordHandle> {
        let writer = JournalWriter::new(self.journal.clone());
        writer.flush().await?;
        info!(path = %self.journal.path().display(), kinds = self.kinds.len(), "recording");
        let writer = Arc::new(Mutex::new(writer));

        let tracker = TaskTracker::new();
        let cancel = cancel.child_token();
        for kind in &self.kinds {
            if cancel.is_cancelled() { break; }
            let feed = match self.source.watch(kind).await {
                Ok(feed) => feed,
                Err(e) => {
                    error!(kind = %kind, error = %e, "failed to open change feed; stopping started recorders");
                    cancel.cancel();
                    tracker.close();
                    tracker.wait().await;
                    return Err(Error::Store(e));
                }
            };
            let (synced_tx, synced_rx) = oneshot::channel();
            tracker.spawn(record_feed(Arc::clone(&writer), kind.clone(), feed, synced_tx, cancel.clone()));
            tokio::select! {
                _ = cancel.cancelled() => break,
                res = synced_rx => if res.is_err() { warn!(kind = %kind, "feed closed before its initial listing completed") },
            }
        }
        tracker.close();
        Ok(RecordHandle { tracker, cancel, writer })
    }
}

pub struct RecordHandle {
    tracker: TaskTracker,
    cancel: CancellationToken,
    writer: Arc<Mutex<JournalWriter>>,
}

impl RecordHandle {
    /// Records captured so far.
    pub async fn records(&self) -> Vec<Record> { self.writer.lock().await.records().to_vec() }

    pub async fn recorded(&self) -> usize { self.writer.lock().await.len() }

    pub fn cancel(&self) { self.cancel.cancel(); }

    pub async fn wait(self) { self.tracker.wait().await; }

    /// Stop recording and make a last attempt to write anything a failed
    /// flush left behind.
    pub async fn shutdown(self) -> Result<()> {
        self.cancel.cancel();
        self.tracker.wait().await;
        let w = self.writer.lock().await;
        w.flush().await
    }
}

async fn record_feed(
    writer: Arc<Mutex<JournalWriter>>,
    kind: ObjectKind,
    mut feed: ChangeFeed,
    synced: oneshot::Sender<()>,
    cancel: CancellationToken,
) {
    let mut synced = Some(synced);
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = feed.next() => next,
        };
        let (op, obj) = match next {
            Some(Ok(FeedEvent::Synced)) => {
                if let Some(tx) = synced.take() { let _ = tx.send(()); }
                continue;
            }
            Some(Ok(ev)) => match ev.into_parts() {
                Some(parts) => parts,
                None => continue,
            },
            Some(Err(e)) => { warn!(kind = %kind, error = %e, "change feed error"); continue; }
            None => { warn!(kind = %kind, "change feed ended"); break; }
        };
        let (ns, name) = (obj.namespace().map(str::to_string), obj.name().to_string());
        let mut w = writer.lock().await;
        match w.append(Record::new(op, obj)).await {
            Ok(()) => {
                counter!("record_events_total", 1u64, "kind" => kind.to_string(), "op" => op.to_string());
                debug!(kind = %kind, namespace = ?ns, name = %name, op = %op, records = w.len(), "recorded");
            }
            Err(e) => {
                counter!("record_flush_errors_total", 1u64);
                error!(kind = %kind, namespace = ?ns, name = %name, op = %op, error = %e, "journal flush failed; event kept in memory");
            }
        }
    }
}
