//! Re-issues a journal against a destination.
//!
//! Records are applied in file order. A run of consecutive `Add` records of
//! one kind is created through a bounded pool; everything else goes one record
//! at a time. "Already exists" on create and "not found" on update or delete
//! are expected when a journal is replayed twice and count as success. Any
//! other error stops the replay and is returned.

use std::str::FromStr;
use std::sync::Arc;

use kopy_apply::{Applier, CreateOutcome};
use kopy_core::{Error, Object, Operation, Result, StoreError};
use kopy_pipeline::{Outcome, Pipeline};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use crate::journal::{Journal, Record};

pub const DEFAULT_CONCURRENCY: usize = 16;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReplayMode {
    /// Only `Add` records are replayed.
    #[default]
    CreatesOnly,
    /// `Update` and `Delete` records are replayed too.
    Full,
}

impl FromStr for ReplayMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "creates-only" | "creates" => Ok(ReplayMode::CreatesOnly),
            "full" => Ok(ReplayMode::Full),
            other => Err(format!("unknown replay mode: {} (expect creates-only or full)", other)),
        }
    }
}

impl std::fmt::Display for ReplayMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self { ReplayMode::CreatesOnly => "creates-only", ReplayMode::Full => "full" })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayOptions {
    pub mode: ReplayMode,
    pub concurrency: usize,
}

impl Default for ReplayOptions {
    fn default() -> Self { Self { mode: ReplayMode::default(), concurrency: DEFAULT_CONCURRENCY } }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReplaySummary {
    pub records: usize,
    pub created: usize,
    pub already_present: usize,
    pub updated: usize,
    pub deleted: usize,
    /// Filtered by the pipeline, outside the replay mode, or already gone.
    pub skipped: usize,
}

pub struct Replayer {
    applier: Arc<dyn Applier>,
    pipeline: Option<Pipeline>,
    journal: Journal,
    opts: ReplayOptions,
}

impl Replayer {
    /// Without a pipeline, `Add` records only lose their server-assigned identity.
    pub fn new(applier: Arc<dyn Applier>, journal: Journal) -> Self {
        Self { applier, pipeline: None, journal, opts: ReplayOptions::default() }
    }

    pub fn with_pipeline(mut self, pipeline: Pipeline) -> Self {
        self.pipeline = Some(pipeline);
        self
    }

    pub fn with_options(mut self, opts: ReplayOptions) -> Self {
        self.opts = ReplayOptions { concurrency: opts.concurrency.max(1), ..opts };
        self
    }

    pub async fn replay(&self) -> Result<ReplaySummary> {
        let records = self.journal.load().await?;
        info!(path = %self.journal.path().display(), records = records.len(), mode = %self.opts.mode, "replaying journal");
        let mut summary = ReplaySummary { records: records.len(), ..Default::default() };

        let mut it = records.into_iter().peekable();
        while let Some(Record { event, resource }) = it.next() {
            match (event, self.opts.mode) {
                (Operation::Add, _) => {
                    let declared = declared_type(&resource);
                    let mut run = vec![resource];
                    while let Some(next) = it.next_if(|r| r.event == Operation::Add && declared_type(&r.resource) == declared) {
                        run.push(next.resource);
                    }
                    self.create_run(run, &mut summary).await?;
                }
                (op, ReplayMode::Full) => self.apply_one(op, resource, &mut summary).await?,
                (op, ReplayMode::CreatesOnly) => {
                    debug!(op = %op, key = %resource.key(), "not replayed in creates-only mode");
                    summary.skipped += 1;
                }
            }
        }
        info!(
            created = summary.created,
            already_present = summary.already_present,
            updated = summary.updated,
            deleted = summary.deleted,
            skipped = summary.skipped,
            "replay finished"
        );
        Ok(summary)
    }

    async fn create_run(&self, run: Vec<Object>, summary: &mut ReplaySummary) -> Result<()> {
        let sem = Arc::new(Semaphore::new(self.opts.concurrency));
        let mut set: JoinSet<Result<Option<CreateOutcome>>> = JoinSet::new();
        for obj in run {
            let permit = Arc::clone(&sem).acquire_owned().await.map_err(|e| Error::Store(StoreError::other(e)))?;
            let (applier, pipeline) = (Arc::clone(&self.applier), self.pipeline.clone());
            set.spawn(async move {
                let _permit = permit;
                create_one(applier.as_ref(), pipeline.as_ref(), obj).await
            });
        }
        // returning early drops the set and aborts the creates still in flight
        while let Some(res) = set.join_next().await {
            match res.map_err(|e| Error::Store(StoreError::other(e)))?? {
                Some(CreateOutcome::Created) => summary.created += 1,
                Some(CreateOutcome::AlreadyExists) => summary.already_present += 1,
                None => summary.skipped += 1,
            }
        }
        Ok(())
    }

    async fn apply_one(&self, op: Operation, obj: Object, summary: &mut ReplaySummary) -> Result<()> {
        let (ns, name) = (obj.namespace().map(str::to_string), obj.name().to_string());
        let res = match op {
            Operation::Delete => {
                let kind = self.applier.resolve(&obj)?;
                self.applier.delete(&kind, obj.namespace(), obj.name()).await.map(|_| true)
            }
            _ => match prepare(self.applier.as_ref(), self.pipeline.as_ref(), op, obj).await? {
                Some(out) => self.applier.update(&out).await.map(|_| true),
                None => Ok(false),
            },
        };
        match res {
            Ok(true) if op == Operation::Delete => summary.deleted += 1,
            Ok(true) => summary.updated += 1,
            Ok(false) => summary.skipped += 1,
            Err(e) if e.is_not_found() => {
                debug!(op = %op, namespace = ?ns, name = %name, "already gone on destination");
                summary.skipped += 1;
            }
            Err(e) => {
                counter!("replay_records_total", 1u64, "op" => op.to_string(), "outcome" => "error");
                error!(op = %op, namespace = ?ns, name = %name, error = %e, "replay aborted");
                return Err(e);
            }
        }
        counter!("replay_records_total", 1u64, "op" => op.to_string(), "outcome" => "ok");
        Ok(())
    }
}

fn declared_type(obj: &Object) -> (String, String) { (obj.api_version().to_string(), obj.kind().to_string()) }

/// Run the pipeline (or plain identity stripping) for one record.
async fn prepare(applier: &dyn Applier, pipeline: Option<&Pipeline>, op: Operation, mut obj: Object) -> Result<Option<Object>> {
    let kind = applier.resolve(&obj)?;
    match pipeline {
        Some(p) => match p.process(&kind, op, obj).await? {
            Outcome::Skip { .. } => Ok(None),
            Outcome::Apply(out) => Ok(Some(out)),
        },
        None => {
            if op == Operation::Add { obj.strip_identity(); }
            Ok(Some(obj))
        }
    }
}

async fn create_one(applier: &dyn Applier, pipeline: Option<&Pipeline>, obj: Object) -> Result<Option<CreateOutcome>> {
    let (ns, name, kind) = (obj.namespace().map(str::to_string), obj.name().to_string(), obj.kind().to_string());
    let res = match prepare(applier, pipeline, Operation::Add, obj).await {
        Ok(Some(out)) => applier.create_or_exists(&out).await.map(Some),
        other => other.map(|_| None),
    };
    match &res {
        Ok(_) => {
            counter!("replay_records_total", 1u64, "op" => "Add", "outcome" => "ok");
        }
        Err(e) => {
            counter!("replay_records_total", 1u64, "op" => "Add", "outcome" => "error");
            error!(kind = %kind, namespace = ?ns, name = %name, op = "Add", error = %e, "replay aborted");
        }
    }
    res
}
