//! One-shot copy of the source's current state onto the destination.
//!
//! Kinds are imported one after another in sync order; the objects of one kind
//! are created concurrently, at most `concurrency` at a time. The first
//! failure stops the import and is returned.

use std::sync::Arc;

use kopy_apply::{Applier, CreateOutcome};
use kopy_core::{sync_order, Error, ObjectKind, ObjectStore, Operation, Result};
use kopy_pipeline::{Outcome, Pipeline};
use metrics::{counter, histogram};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info};

use crate::env_usize;

pub const DEFAULT_CONCURRENCY: usize = 16;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportSummary {
    pub listed: usize,
    pub created: usize,
    pub already_present: usize,
    pub skipped: usize,
}

pub struct Importer {
    source: Arc<dyn ObjectStore>,
    applier: Arc<dyn Applier>,
    pipeline: Pipeline,
    kinds: Vec<ObjectKind>,
    concurrency: usize,
}

impl Importer {
    /// Concurrency defaults to `KOPY_IMPORT_CONCURRENCY`, else 16.
    pub fn new(source: Arc<dyn ObjectStore>, applier: Arc<dyn Applier>, pipeline: Pipeline) -> Self {
        Self {
            source,
            applier,
            pipeline,
            kinds: sync_order(),
            concurrency: env_usize("KOPY_IMPORT_CONCURRENCY", DEFAULT_CONCURRENCY),
        }
    }

    pub fn with_kinds(mut self, kinds: Vec<ObjectKind>) -> Self {
        self.kinds = kinds;
        self
    }

    pub fn with_concurrency(mut self, n: usize) -> Self {
        self.concurrency = n.max(1);
        self
    }

    pub async fn import(&self) -> Result<ImportSummary> {
        let started = std::time::Instant::now();
        let mut summary = ImportSummary::default();
        for kind in &self.kinds {
            let objects = self.source.list(kind, None).await.map_err(Error::Store)?;
            let count = objects.len();
            debug!(kind = %kind, count, "importing kind");
            summary.listed += count;

            let sem = Arc::new(Semaphore::new(self.concurrency));
            let mut set: JoinSet<Result<Option<CreateOutcome>>> = JoinSet::new();
            for obj in objects {
                let permit = Arc::clone(&sem).acquire_owned().await.map_err(|e| Error::Store(kopy_core::StoreError::other(e)))?;
                let (applier, pipeline, kind) = (Arc::clone(&self.applier), self.pipeline.clone(), kind.clone());
                set.spawn(async move {
                    let _permit = permit;
                    match pipeline.process(&kind, Operation::Add, obj).await? {
                        Outcome::Skip { .. } => Ok(None),
                        Outcome::Apply(out) => applier.create_or_exists(&out).await.map(Some),
                    }
                });
            }
            // an early return drops the set, which aborts the rest of the kind
            while let Some(res) = set.join_next().await {
                tally(&mut summary, flatten(res)?);
            }
            counter!("import_objects_total", count as u64, "kind" => kind.to_string());
        }
        histogram!("import_duration_ms", started.elapsed().as_secs_f64() * 1000.0);
        info!(listed = summary.listed, created = summary.created, already_present = summary.already_present, skipped = summary.skipped, "import finished");
        Ok(summary)
    }
}

fn flatten(res: std::result::Result<Result<Option<CreateOutcome>>, tokio::task::JoinError>) -> Result<Option<CreateOutcome>> {
    res.map_err(|e| Error::Store(kopy_core::StoreError::other(e)))?
}

fn tally(s: &mut ImportSummary, outcome: Option<CreateOutcome>) {
    match outcome {
        Some(CreateOutcome::Created) => s.created += 1,
        Some(CreateOutcome::AlreadyExists) => s.already_present += 1,
        None => s.skipped += 1,
    }
}
