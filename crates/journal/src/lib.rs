//! Kopy journal: records a source's change feeds to a JSON file and replays
//! that file onto a destination later.

#![forbid(unsafe_code)]

pub mod journal;
pub mod recorder;
pub mod replayer;

pub use journal::{Journal, JournalWriter, Record, DEFAULT_FILE_NAME};
pub use recorder::{RecordHandle, Recorder};
pub use replayer::{ReplayMode, ReplayOptions, ReplaySummary, Replayer};
