//! Turns kube watcher events into change-feed events.
//!
//! The watcher only says "applied", "deleted" or "here is a fresh listing".
//! [`FeedCache`] remembers what the feed has already delivered so an applied
//! object can be told apart as an add or an update, and so a relist after a
//! desync yields the adds, updates and deletes that were missed.

use kopy_core::{FeedEvent, Object};
use rustc_hash::FxHashMap;

#[derive(Debug, Default)]
pub struct FeedCache {
    known: FxHashMap<String, Object>,
    synced: bool,
}

impl FeedCache {
    pub fn new() -> Self { Self::default() }

    pub fn is_synced(&self) -> bool { self.synced }

    pub fn applied(&mut self, obj: Object) -> Vec<FeedEvent> {
        let ev = if self.known.contains_key(&obj.key()) {
            FeedEvent::Updated(obj.clone())
        } else {
            FeedEvent::Added(obj.clone())
        };
        self.known.insert(obj.key(), obj);
        vec![ev]
    }

    pub fn deleted(&mut self, obj: Object) -> Vec<FeedEvent> {
        self.known.remove(&obj.key());
        vec![FeedEvent::Deleted(obj)]
    }

    /// A full listing. The first one ends with `Synced`.
    pub fn restarted(&mut self, list: Vec<Object>) -> Vec<FeedEvent> {
        let mut out = Vec::with_capacity(list.len() + 1);
        let mut fresh: FxHashMap<String, Object> = FxHashMap::default();
        for obj in list {
            let key = obj.key();
            match self.known.get(&key) {
                None => out.push(FeedEvent::Added(obj.clone())),
                Some(prev) if prev.resource_version() != obj.resource_version() => out.push(FeedEvent::Updated(obj.clone())),
                Some(_) => {}
            }
            fresh.insert(key, obj);
        }
        let mut gone: Vec<(String, Object)> = self.known.drain().filter(|(k, _)| !fresh.contains_key(k)).collect();
        gone.sort_by(|a, b| a.0.cmp(&b.0));
        out.extend(gone.into_iter().map(|(_, o)| FeedEvent::Deleted(o)));
        self.known = fresh;
        if !self.synced {
            self.synced = true;
            out.push(FeedEvent::Synced);
        }
        out
    }
}
