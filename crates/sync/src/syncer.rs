//! Live replication from a source store's change feeds.
//!
//! Startup opens one feed per kind, in sync order, and waits for each feed's
//! initial listing to be handled before opening the next. After that every
//! kind is consumed by its own task and kinds are not ordered against each
//! other. A failed event is logged and dropped; the next update of the same
//! object is the retry.

use std::sync::Arc;

use futures::StreamExt;
use kopy_apply::Applier;
use kopy_core::{sync_order, ChangeFeed, Error, FeedEvent, Object, ObjectKind, ObjectStore, Operation, Result};
use kopy_pipeline::{Outcome, Pipeline};
use metrics::counter;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

pub struct Syncer {
    source: Arc<dyn ObjectStore>,
    worker: Arc<EventWorker>,
    kinds: Vec<ObjectKind>,
}

impl Syncer {
    pub fn new(source: Arc<dyn ObjectStore>, applier: Arc<dyn Applier>, pipeline: Pipeline) -> Self {
        Self { source, worker: Arc::new(EventWorker { applier, pipeline }), kinds: sync_order() }
    }

    /// Replace the kinds to follow. Callers keep them in dependency order.
    pub fn with_kinds(mut self, kinds: Vec<ObjectKind>) -> Self {
        self.kinds = kinds;
        self
    }

    /// Open every feed and return once all of them have delivered their
    /// initial listing. Consumption continues on the returned handle's tasks
    /// until `cancel` fires.
    /// If a feed cannot be opened, the consumers already started are stopped
    /// and joined before the error is returned.
    pub async fn run(&self, cancel: CancellationToken) -> Result<SyncHandle> {
        let tracker = TaskTracker::new();
        let cancel = cancel.child_token();
        for kind in &self.kinds {
            if cancel.is_cancelled() { break; }
            let feed = match self.source.watch(kind).await {
                Ok(feed) => feed,
                Err(e) => {
                    error!(kind = %kind, error = %e, "failed to open change feed; stopping started consumers");
                    cancel.cancel();
                    tracker.close();
                    tracker.wait().await;
                    return Err(Error::Store(e));
                }
            };
            let (synced_tx, synced_rx) = oneshot::channel();
            tracker.spawn(consume(Arc::clone(&self.worker), kind.clone(), feed, Some(synced_tx), cancel.clone()));
            tokio::select! {
                _ = cancel.cancelled() => break,
                res = synced_rx => match res {
                    Ok(()) => info!(kind = %kind, "initial listing synced"),
                    Err(_) => warn!(kind = %kind, "feed closed before its initial listing completed"),
                },
            }
        }
        tracker.close();
        Ok(SyncHandle { tracker, cancel })
    }
}

/// The running consumers of one [`Syncer::run`].
pub struct SyncHandle {
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl SyncHandle {
    pub fn cancel(&self) { self.cancel.cancel(); }

    /// Number of feed consumers still running.
    pub fn running(&self) -> usize { self.tracker.len() }

    /// Wait for every consumer to stop. Consumers only stop on cancellation
    /// or when their feed ends.
    pub async fn wait(self) { self.tracker.wait().await; }

    pub async fn shutdown(self) {
        self.cancel.cancel();
        self.tracker.wait().await;
    }
}

async fn consume(
    worker: Arc<EventWorker>,
    kind: ObjectKind,
    mut feed: ChangeFeed,
    mut synced: Option<oneshot::Sender<()>>,
    cancel: CancellationToken,
) {
    debug!(kind = %kind, "consumer started");
    loop {
        // An event already taken off the feed is handled to completion.
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = feed.next() => next,
        };
        match next {
            Some(Ok(FeedEvent::Synced)) => {
                if let Some(tx) = synced.take() { let _ = tx.send(()); }
            }
            Some(Ok(ev)) => {
                if let Some((op, obj)) = ev.into_parts() { worker.handle(&kind, op, obj).await; }
            }
            Some(Err(e)) => {
                counter!("sync_feed_errors_total", 1u64, "kind" => kind.to_string());
                warn!(kind = %kind, error = %e, "change feed error");
            }
            None => { warn!(kind = %kind, "change feed ended"); break; }
        }
    }
    debug!(kind = %kind, "consumer stopped");
}

/// What happened to one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Handled {
    Applied,
    Skipped,
}

pub(crate) struct EventWorker {
    applier: Arc<dyn Applier>,
    pipeline: Pipeline,
}

impl EventWorker {
    async fn handle(&self, kind: &ObjectKind, op: Operation, obj: Object) {
        let ns = obj.namespace().map(str::to_string);
        let name = obj.name().to_string();
        let kind_label = kind.to_string();
        match self.apply(kind, op, obj).await {
            Ok(Handled::Applied) => {
                counter!("sync_events_total", 1u64, "kind" => kind_label, "op" => op.to_string(), "outcome" => "applied");
            }
            Ok(Handled::Skipped) => {
                counter!("sync_events_total", 1u64, "kind" => kind_label, "op" => op.to_string(), "outcome" => "skipped");
            }
            Err(e) if e.is_conflict() => {
                counter!("sync_events_total", 1u64, "kind" => kind_label, "op" => op.to_string(), "outcome" => "conflict");
                debug!(kind = %kind, namespace = ?ns, name = %name, op = %op, error = %e, "benign conflict on destination");
            }
            Err(e) => {
                counter!("sync_events_total", 1u64, "kind" => kind_label, "op" => op.to_string(), "outcome" => "error");
                error!(kind = %kind, namespace = ?ns, name = %name, op = %op, error = %e, "event dropped");
            }
        }
    }

    pub(crate) async fn apply(&self, kind: &ObjectKind, op: Operation, obj: Object) -> Result<Handled> {
        if op == Operation::Delete {
            let target = if obj.kind().is_empty() { kind.clone() } else { self.applier.resolve(&obj)? };
            self.applier.delete(&target, obj.namespace(), obj.name()).await?;
            return Ok(Handled::Applied);
        }
        self.applier.resolve(&obj)?;
        match self.pipeline.process(kind, op, obj).await? {
            Outcome::Skip { .. } => Ok(Handled::Skipped),
            Outcome::Apply(out) => {
                if op == Operation::Add { self.applier.create(&out).await?; } else { self.applier.update(&out).await?; }
                Ok(Handled::Applied)
            }
        }
    }
}
