//! Change events and feeds.

use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::kind::ObjectKind;
use crate::object::Object;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    Add,
    Update,
    Delete,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self { Operation::Add => "Add", Operation::Update => "Update", Operation::Delete => "Delete" };
        f.write_str(s)
    }
}

/// One observed change of one object.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub kind: ObjectKind,
    pub op: Operation,
    pub object: Object,
}

/// What a change feed delivers. `Synced` is sent once, after every object of
/// the initial listing has been delivered as `Added`.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    Added(Object),
    Updated(Object),
    Deleted(Object),
    Synced,
}

impl FeedEvent {
    /// Split into operation and object; `None` for `Synced`.
    pub fn into_parts(self) -> Option<(Operation, Object)> {
        match self {
            FeedEvent::Added(o) => Some((Operation::Add, o)),
            FeedEvent::Updated(o) => Some((Operation::Update, o)),
            FeedEvent::Deleted(o) => Some((Operation::Delete, o)),
            FeedEvent::Synced => None,
        }
    }
}

/// Ordered per-kind stream of changes. Errors are transient: the feed keeps
/// going after yielding one.
pub type ChangeFeed = BoxStream<'static, Result<FeedEvent, StoreError>>;
