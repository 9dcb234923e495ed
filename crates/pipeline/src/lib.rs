//! Kopy pipeline: decides whether an observed change reaches the destination
//! and what shape it has when it does.
//!
//! Per event: filters of the kind run in registration order (first `false`
//! skips, first error fails), an `Add` then loses its server-assigned
//! identity, and the kind's mutators run in order, each one receiving the
//! previous one's output. Deletes never enter the pipeline.
//!
//! The [`PipelineRegistry`] is built once and is read-only afterwards, so one
//! `Arc` of it is shared by every feed consumer.

#![forbid(unsafe_code)]

pub mod mandatory;

use std::sync::Arc;

use anyhow::Context;
use kopy_core::{Error, Object, ObjectKind, ObjectStore, Operation, Result};
use rustc_hash::FxHashMap;
use tracing::trace;

/// Stores a filter or mutator may read. Functions must never write to `source`.
#[derive(Clone)]
pub struct Clients {
    pub source: Arc<dyn ObjectStore>,
    pub destination: Arc<dyn ObjectStore>,
}

impl Clients {
    pub fn new(source: Arc<dyn ObjectStore>, destination: Arc<dyn ObjectStore>) -> Self {
        Self { source, destination }
    }

    /// Offline use (replay): there is no source, the destination stands in for it.
    pub fn destination_only(destination: Arc<dyn ObjectStore>) -> Self {
        Self { source: Arc::clone(&destination), destination }
    }
}

#[async_trait::async_trait]
pub trait Filter: Send + Sync {
    fn name(&self) -> &str;

    /// `Ok(false)` means "do not apply this event", not a failure.
    async fn admit(&self, op: Operation, obj: &Object, clients: &Clients) -> anyhow::Result<bool>;
}

#[async_trait::async_trait]
pub trait Mutator: Send + Sync {
    fn name(&self) -> &str;

    async fn mutate(&self, op: Operation, obj: Object, clients: &Clients) -> anyhow::Result<Object>;
}

/// Filter over a plain closure, for callers that need no store access.
pub struct FnFilter<F> {
    name: String,
    f: F,
}

pub fn filter_fn<F>(name: &str, f: F) -> Arc<dyn Filter>
where
    F: Fn(Operation, &Object) -> anyhow::Result<bool> + Send + Sync + 'static,
{
    Arc::new(FnFilter { name: name.to_string(), f })
}

#[async_trait::async_trait]
impl<F> Filter for FnFilter<F>
where
    F: Fn(Operation, &Object) -> anyhow::Result<bool> + Send + Sync + 'static,
{
    fn name(&self) -> &str { &self.name }

    async fn admit(&self, op: Operation, obj: &Object, _clients: &Clients) -> anyhow::Result<bool> {
        (self.f)(op, obj)
    }
}

/// Mutator over a plain closure.
pub struct FnMutator<F> {
    name: String,
    f: F,
}

pub fn mutator_fn<F>(name: &str, f: F) -> Arc<dyn Mutator>
where
    F: Fn(Operation, Object) -> anyhow::Result<Object> + Send + Sync + 'static,
{
    Arc::new(FnMutator { name: name.to_string(), f })
}

#[async_trait::async_trait]
impl<F> Mutator for FnMutator<F>
where
    F: Fn(Operation, Object) -> anyhow::Result<Object> + Send + Sync + 'static,
{
    fn name(&self) -> &str { &self.name }

    async fn mutate(&self, op: Operation, obj: Object, _clients: &Clients) -> anyhow::Result<Object> {
        (self.f)(op, obj)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// A filter declined the event.
    Skip { filter: String },
    Apply(Object),
}

#[derive(Default)]
pub struct PipelineRegistry {
    filters: FxHashMap<ObjectKind, Vec<Arc<dyn Filter>>>,
    mutators: FxHashMap<ObjectKind, Vec<Arc<dyn Mutator>>>,
}

impl PipelineRegistry {
    /// Builder pre-loaded with the mandatory functions; caller entries run after them.
    pub fn builder() -> RegistryBuilder {
        mandatory::register(RegistryBuilder::default())
    }

    /// Builder without the mandatory functions. Callers replacing them are
    /// expected to call the `mandatory` functions from their own.
    pub fn bare() -> RegistryBuilder { RegistryBuilder::default() }

    /// Registry with only the mandatory functions.
    pub fn mandatory() -> Self { Self::builder().build() }

    pub fn filters_for(&self, kind: &ObjectKind) -> &[Arc<dyn Filter>] {
        self.filters.get(kind).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn mutators_for(&self, kind: &ObjectKind) -> &[Arc<dyn Mutator>] {
        self.mutators.get(kind).map(Vec::as_slice).unwrap_or(&[])
    }
}

#[derive(Default)]
pub struct RegistryBuilder {
    inner: PipelineRegistry,
}

impl RegistryBuilder {
    pub fn filter(mut self, kind: ObjectKind, f: Arc<dyn Filter>) -> Self {
        self.inner.filters.entry(kind).or_default().push(f);
        self
    }

    pub fn mutator(mut self, kind: ObjectKind, m: Arc<dyn Mutator>) -> Self {
        self.inner.mutators.entry(kind).or_default().push(m);
        self
    }

    pub fn build(self) -> PipelineRegistry { self.inner }
}

/// A registry bound to the stores its functions may read.
#[derive(Clone)]
pub struct Pipeline {
    registry: Arc<PipelineRegistry>,
    clients: Clients,
}

impl Pipeline {
    pub fn new(registry: Arc<PipelineRegistry>, clients: Clients) -> Self {
        Self { registry, clients }
    }

    /// Run filters and mutators for one event. A `Delete` is returned as-is
    /// without invoking anything.
    pub async fn process(&self, kind: &ObjectKind, op: Operation, obj: Object) -> Result<Outcome> {
        if op == Operation::Delete {
            return Ok(Outcome::Apply(obj));
        }
        let fail = |obj: &Object, source: anyhow::Error| Error::Pipeline { kind: kind.to_string(), key: obj.key(), source };

        for f in self.registry.filters_for(kind) {
            let admitted = f
                .admit(op, &obj, &self.clients)
                .await
                .with_context(|| format!("filter {}", f.name()))
                .map_err(|e| fail(&obj, e))?;
            if !admitted {
                trace!(kind = %kind, key = %obj.key(), op = %op, filter = f.name(), "skipped by filter");
                return Ok(Outcome::Skip { filter: f.name().to_string() });
            }
        }

        let mut obj = obj;
        if op == Operation::Add {
            obj.strip_identity();
        }

        for m in self.registry.mutators_for(kind) {
            let key = obj.key();
            obj = m
                .mutate(op, obj, &self.clients)
                .await
                .with_context(|| format!("mutator {}", m.name()))
                .map_err(|source| Error::Pipeline { kind: kind.to_string(), key, source })?;
        }
        Ok(Outcome::Apply(obj))
    }
}
