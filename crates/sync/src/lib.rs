//! Kopy sync: keeps a destination store derived from a source store.
//!
//! [`Syncer`] follows the source's change feeds for as long as it runs;
//! [`Importer`] copies what the source holds right now and returns.
//! Both walk kinds in [`kopy_core::SYNC_ORDER`] so that referenced objects
//! land before the objects that reference them.

#![forbid(unsafe_code)]

pub mod importer;
pub mod syncer;

pub use importer::{ImportSummary, Importer};
pub use syncer::{SyncHandle, Syncer};

/// Read a positive integer tunable from the environment.
pub(crate) fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key).ok().and_then(|s| s.parse().ok()).filter(|n: &usize| *n > 0).unwrap_or(default)
}
