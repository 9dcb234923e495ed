//! The journal file: one JSON array of `{event, resource}` records, written
//! whole and read whole.

use std::path::{Path, PathBuf};

use kopy_core::{Error, Object, Operation, Result};
use metrics::histogram;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::trace;

pub const DEFAULT_FILE_NAME: &str = "record.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub event: Operation,
    pub resource: Object,
}

impl Record {
    pub fn new(event: Operation, resource: Object) -> Self { Self { event, resource } }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Journal {
    path: PathBuf,
}

impl Journal {
    pub fn at(path: impl Into<PathBuf>) -> Self { Self { path: path.into() } }

    /// `record.json` inside `dir`.
    pub fn in_dir(dir: impl AsRef<Path>) -> Self { Self::at(dir.as_ref().join(DEFAULT_FILE_NAME)) }

    pub fn path(&self) -> &Path { &self.path }

    fn io(&self, source: std::io::Error) -> Error {
        Error::Io { path: self.path.display().to_string(), source }
    }

    pub async fn load(&self) -> Result<Vec<Record>> {
        let bytes = tokio::fs::read(&self.path).await.map_err(|e| self.io(e))?;
        serde_json::from_slice(&bytes).map_err(|source| Error::Journal { path: self.path.display().to_string(), source })
    }

    /// Replace the file with `records`. Written and synced to a sibling file
    /// first, then renamed over the journal, so a reader never sees a partial
    /// array.
    pub async fn store(&self, records: &[Record]) -> Result<()> {
        let started = std::time::Instant::now();
        let bytes = serde_json::to_vec(records).map_err(|source| Error::Journal { path: self.path.display().to_string(), source })?;
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir).await.map_err(|e| self.io(e))?;
        }
        let tmp = self.tmp_path();
        let mut file = tokio::fs::File::create(&tmp).await.map_err(|e| self.io(e))?;
        file.write_all(&bytes).await.map_err(|e| self.io(e))?;
        file.sync_all().await.map_err(|e| self.io(e))?;
        drop(file);
        tokio::fs::rename(&tmp, &self.path).await.map_err(|e| self.io(e))?;
        histogram!("journal_flush_ms", started.elapsed().as_secs_f64() * 1000.0);
        trace!(path = %self.path.display(), records = records.len(), bytes = bytes.len(), "journal flushed");
        Ok(())
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().map(|n| n.to_os_string()).unwrap_or_else(|| DEFAULT_FILE_NAME.into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

/// In-memory ordered buffer that rewrites the journal after every append.
#[derive(Debug)]
pub struct JournalWriter {
    journal: Journal,
    records: Vec<Record>,
}

impl JournalWriter {
    pub fn new(journal: Journal) -> Self { Self { journal, records: Vec::new() } }

    pub fn records(&self) -> &[Record] { &self.records }

    pub fn len(&self) -> usize { self.records.len() }

    pub fn is_empty(&self) -> bool { self.records.is_empty() }

    /// Buffer `record` and flush. A failed flush keeps the record buffered;
    /// the next successful flush writes it.
    pub async fn append(&mut self, record: Record) -> Result<()> {
        self.records.push(record);
        self.flush().await
    }

    pub async fn flush(&self) -> Result<()> { self.journal.store(&self.records).await }
}
