//! Kopy apply: the only path that mutates a destination store.
//!
//! One attempt per call, typed result, no retries. Retry policy belongs to
//! the caller (the syncer waits for the next event, the replayer aborts).

#![forbid(unsafe_code)]

use std::sync::Arc;

use kopy_core::{Error, KindResolver, Object, ObjectKind, ObjectStore, Result};
use metrics::{counter, histogram};
use serde_json::Value as Json;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    AlreadyExists,
}

#[async_trait::async_trait]
pub trait Applier: Send + Sync {
    /// Map the object's declared kind to the destination collection.
    fn resolve(&self, obj: &Object) -> Result<ObjectKind>;

    /// Create; `AlreadyExists` is surfaced as a conflict.
    async fn create(&self, obj: &Object) -> Result<()>;

    async fn update(&self, obj: &Object) -> Result<()>;

    async fn delete(&self, kind: &ObjectKind, namespace: Option<&str>, name: &str) -> Result<()>;

    /// Idempotent create: an object that already exists counts as success.
    async fn create_or_exists(&self, obj: &Object) -> Result<CreateOutcome> {
        match self.create(obj).await {
            Ok(()) => Ok(CreateOutcome::Created),
            Err(e) if e.is_already_exists() => Ok(CreateOutcome::AlreadyExists),
            Err(e) => Err(e),
        }
    }
}

pub struct ResourceApplier {
    store: Arc<dyn ObjectStore>,
    resolver: Arc<dyn KindResolver>,
}

impl ResourceApplier {
    pub fn new(store: Arc<dyn ObjectStore>, resolver: Arc<dyn KindResolver>) -> Self {
        Self { store, resolver }
    }
}

fn outcome<T>(r: &Result<T>) -> &'static str {
    match r {
        Ok(_) => "ok",
        Err(e) if e.is_conflict() => "conflict",
        Err(_) => "error",
    }
}

fn record(verb: &'static str, started: std::time::Instant, res: &Result<()>) {
    counter!("apply_total", 1u64, "verb" => verb, "outcome" => outcome(res));
    histogram!("apply_latency_ms", started.elapsed().as_secs_f64() * 1000.0, "verb" => verb);
}

/// Point the outgoing object at the destination's identity: the destination
/// assigned its own uid and tracks its own resourceVersion.
fn adopt_identity(next: &mut Object, current: &Object) {
    for (field, value) in [("uid", current.uid()), ("resourceVersion", current.resource_version())] {
        match value {
            Some(v) => next.set_metadata(field, Json::String(v.to_string())),
            None => {
                if let Some(meta) = next.metadata_mut() { meta.remove(field); }
            }
        }
    }
}

#[async_trait::async_trait]
impl Applier for ResourceApplier {
    fn resolve(&self, obj: &Object) -> Result<ObjectKind> {
        Ok(self.resolver.resolve_object(obj)?)
    }

    async fn create(&self, obj: &Object) -> Result<()> {
        let t0 = std::time::Instant::now();
        let kind = self.resolve(obj)?;
        let res = self.store.create(&kind, obj).await.map(|_| ()).map_err(Error::from);
        record("create", t0, &res);
        if res.is_ok() { debug!(kind = %kind, key = %obj.key(), "created on destination"); }
        res
    }

    async fn update(&self, obj: &Object) -> Result<()> {
        let t0 = std::time::Instant::now();
        let kind = self.resolve(obj)?;
        let res = async {
            let current = self.store.get(&kind, obj.namespace(), obj.name()).await?;
            let mut next = obj.clone();
            adopt_identity(&mut next, &current);
            self.store.update(&kind, &next).await?;
            Ok::<(), Error>(())
        }
        .await;
        record("update", t0, &res);
        if res.is_ok() { debug!(kind = %kind, key = %obj.key(), "updated on destination"); }
        res
    }

    async fn delete(&self, kind: &ObjectKind, namespace: Option<&str>, name: &str) -> Result<()> {
        let t0 = std::time::Instant::now();
        let res = self.store.delete(kind, namespace, name).await.map_err(Error::from);
        record("delete", t0, &res);
        if res.is_ok() { debug!(kind = %kind, ns = ?namespace, name, "deleted on destination"); }
        res
    }
}
