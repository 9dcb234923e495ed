//! Error taxonomy shared by every replication component.
//!
//! | Variant      | Syncer / Recorder       | Replayer / Importer |
//! |--------------|-------------------------|---------------------|
//! | `Resolution` | log, drop the event     | abort               |
//! | `Conflict`   | benign, debug log only  | benign              |
//! | `Pipeline`   | log, drop the event     | abort               |
//! | `Store`      | log, drop the event     | abort               |
//! | `Io`/`Journal` | log, keep recording   | abort               |

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// The kind declared by an object has no collection on the store.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("no resource mapping for {}", gvk_key(.group, .version, .kind))]
pub struct ResolutionError {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl ResolutionError {
    pub fn new(group: &str, version: &str, kind: &str) -> Self {
        Self { group: group.to_string(), version: version.to_string(), kind: kind.to_string() }
    }
}

fn gvk_key(group: &str, version: &str, kind: &str) -> String {
    if group.is_empty() { format!("{}/{}", version, kind) } else { format!("{}/{}/{}", group, version, kind) }
}

/// Errors reported by a store client, classified the only three ways the core cares about.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} {key} not found")]
    NotFound { kind: String, key: String },
    #[error("{kind} {key} already exists")]
    AlreadyExists { kind: String, key: String },
    #[error("{0}")]
    Other(#[source] anyhow::Error),
}

impl StoreError {
    pub fn other<E>(e: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        StoreError::Other(anyhow::Error::new(e))
    }

    pub fn msg(m: impl std::fmt::Display) -> Self {
        StoreError::Other(anyhow::anyhow!("{}", m))
    }

    pub fn is_not_found(&self) -> bool { matches!(self, StoreError::NotFound { .. }) }
    pub fn is_already_exists(&self) -> bool { matches!(self, StoreError::AlreadyExists { .. }) }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    /// `AlreadyExists` or `NotFound` on the destination: a race with another
    /// writer, never a failure.
    #[error("conflict: {0}")]
    Conflict(#[source] StoreError),

    #[error("pipeline failed for {kind} {key}: {source:#}")]
    Pipeline {
        kind: String,
        key: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("store: {0}")]
    Store(#[source] StoreError),

    #[error("journal io ({path}): {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("journal encoding ({path}): {source}")]
    Journal {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

impl From<StoreError> for Error {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound { .. } | StoreError::AlreadyExists { .. } => Error::Conflict(e),
            other => Error::Store(other),
        }
    }
}

impl Error {
    pub fn is_conflict(&self) -> bool { matches!(self, Error::Conflict(_)) }
    pub fn is_already_exists(&self) -> bool { matches!(self, Error::Conflict(e) if e.is_already_exists()) }
    pub fn is_not_found(&self) -> bool { matches!(self, Error::Conflict(e) if e.is_not_found()) }
}
