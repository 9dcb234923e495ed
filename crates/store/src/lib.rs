//! Kopy in-RAM store: an [`ObjectStore`] that behaves like an API server for
//! the parts replication depends on (server-assigned identity, conflicts,
//! ordered change feeds). Used as the stand-in cluster in tests and dry runs.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Mutex;

use futures::StreamExt;
use kopy_core::{ChangeFeed, FeedEvent, Object, ObjectKind, ObjectStore, StoreError};
use rustc_hash::FxHashMap;
use serde_json::Value as Json;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Mutating verbs, as recorded in the write log and targeted by failure injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Create,
    Update,
    Delete,
}

/// One mutating call as the store received it (before server fields are assigned).
#[derive(Debug, Clone)]
pub struct Write {
    pub verb: Verb,
    pub kind: ObjectKind,
    pub object: Object,
    pub ok: bool,
}

#[derive(Default)]
struct Collection {
    items: BTreeMap<String, Object>,
    watchers: Vec<mpsc::UnboundedSender<FeedEvent>>,
}

impl Collection {
    fn notify(&mut self, ev: FeedEvent) {
        self.watchers.retain(|tx| tx.send(ev.clone()).is_ok());
    }
}

#[derive(Default)]
struct Inner {
    kinds: FxHashMap<ObjectKind, Collection>,
    next_rv: u64,
    writes: Vec<Write>,
    failures: Vec<(Verb, String)>,
}

impl Inner {
    fn bump_rv(&mut self) -> String {
        self.next_rv += 1;
        self.next_rv.to_string()
    }

    fn take_failure(&mut self, verb: Verb, name: &str) -> bool {
        match self.failures.iter().position(|(v, n)| *v == verb && n == name) {
            Some(idx) => { self.failures.remove(idx); true }
            None => false,
        }
    }

    fn log(&mut self, verb: Verb, kind: &ObjectKind, object: Object, ok: bool) {
        self.writes.push(Write { verb, kind: kind.clone(), object, ok });
    }
}

/// In-RAM object store keyed by kind and `namespace/name`.
pub struct MemoryStore {
    label: String,
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new(label: &str) -> Self {
        Self { label: label.to_string(), inner: Mutex::new(Inner::default()) }
    }

    /// Make the next `verb` on an object named `name` fail with an `Other` error.
    pub fn fail_next(&self, verb: Verb, name: &str) {
        self.lock().failures.push((verb, name.to_string()));
    }

    /// Every mutating call received so far, in arrival order.
    pub fn writes(&self) -> Vec<Write> { self.lock().writes.clone() }

    /// Current object, if present.
    pub fn peek(&self, kind: &ObjectKind, namespace: Option<&str>, name: &str) -> Option<Object> {
        let key = object_key(namespace, name);
        self.lock().kinds.get(kind).and_then(|c| c.items.get(&key).cloned())
    }

    /// Number of stored objects of a kind.
    pub fn count(&self, kind: &ObjectKind) -> usize {
        self.lock().kinds.get(kind).map(|c| c.items.len()).unwrap_or(0)
    }

    /// Sorted `namespace/name` keys of a kind.
    pub fn keys(&self, kind: &ObjectKind) -> Vec<String> {
        self.lock().kinds.get(kind).map(|c| c.items.keys().cloned().collect()).unwrap_or_default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned lock only means a test thread panicked mid-call; the map is still usable.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn object_key(namespace: Option<&str>, name: &str) -> String {
    match namespace {
        Some(ns) if !ns.is_empty() => format!("{}/{}", ns, name),
        _ => name.to_string(),
    }
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

fn injected(verb: Verb, key: &str) -> StoreError {
    StoreError::msg(format!("injected {:?} failure for {}", verb, key))
}

#[async_trait::async_trait]
impl ObjectStore for MemoryStore {
    async fn list(&self, kind: &ObjectKind, namespace: Option<&str>) -> Result<Vec<Object>, StoreError> {
        let inner = self.lock();
        let items = inner
            .kinds
            .get(kind)
            .map(|c| c.items.values().filter(|o| namespace.is_none() || o.namespace() == namespace).cloned().collect())
            .unwrap_or_default();
        Ok(items)
    }

    async fn get(&self, kind: &ObjectKind, namespace: Option<&str>, name: &str) -> Result<Object, StoreError> {
        self.peek(kind, namespace, name)
            .ok_or_else(|| StoreError::NotFound { kind: kind.to_string(), key: object_key(namespace, name) })
    }

    async fn create(&self, kind: &ObjectKind, obj: &Object) -> Result<Object, StoreError> {
        let mut inner = self.lock();
        let key = obj.key();
        if inner.take_failure(Verb::Create, obj.name()) {
            inner.log(Verb::Create, kind, obj.clone(), false);
            return Err(injected(Verb::Create, &key));
        }
        if obj.resource_version().is_some() {
            inner.log(Verb::Create, kind, obj.clone(), false);
            return Err(StoreError::msg(format!("{} {}: resourceVersion should not be set on objects to be created", kind, key)));
        }
        if inner.kinds.get(kind).map(|c| c.items.contains_key(&key)).unwrap_or(false) {
            inner.log(Verb::Create, kind, obj.clone(), false);
            return Err(StoreError::AlreadyExists { kind: kind.to_string(), key });
        }

        let mut stored = obj.clone();
        let rv = inner.bump_rv();
        stored.set_metadata("uid", Json::String(uuid::Uuid::new_v4().to_string()));
        stored.set_metadata("resourceVersion", Json::String(rv));
        stored.set_metadata("generation", Json::from(1));
        if stored.as_json().pointer("/metadata/creationTimestamp").is_none() {
            stored.set_metadata("creationTimestamp", Json::String(now_rfc3339()));
        }

        inner.log(Verb::Create, kind, obj.clone(), true);
        let coll = inner.kinds.entry(kind.clone()).or_default();
        coll.items.insert(key.clone(), stored.clone());
        coll.notify(FeedEvent::Added(stored.clone()));
        trace!(store = %self.label, kind = %kind, key = %key, "created");
        Ok(stored)
    }

    async fn update(&self, kind: &ObjectKind, obj: &Object) -> Result<Object, StoreError> {
        let mut inner = self.lock();
        let key = obj.key();
        if inner.take_failure(Verb::Update, obj.name()) {
            inner.log(Verb::Update, kind, obj.clone(), false);
            return Err(injected(Verb::Update, &key));
        }
        let Some(current) = inner.kinds.get(kind).and_then(|c| c.items.get(&key)).cloned() else {
            inner.log(Verb::Update, kind, obj.clone(), false);
            return Err(StoreError::NotFound { kind: kind.to_string(), key });
        };
        if let Some(uid) = obj.uid() {
            if Some(uid) != current.uid() {
                inner.log(Verb::Update, kind, obj.clone(), false);
                return Err(StoreError::msg(format!("{} {}: precondition failed: uid {} does not match", kind, key, uid)));
            }
        }
        if let Some(rv) = obj.resource_version() {
            if Some(rv) != current.resource_version() {
                inner.log(Verb::Update, kind, obj.clone(), false);
                return Err(StoreError::msg(format!("{} {}: the object has been modified (rv {})", kind, key, rv)));
            }
        }

        let mut stored = obj.clone();
        let rv = inner.bump_rv();
        let generation = current.generation().unwrap_or(1) + i64::from(current.as_json().get("spec") != obj.as_json().get("spec"));
        if let Some(uid) = current.uid() { stored.set_metadata("uid", Json::String(uid.to_string())); }
        if let Some(ts) = current.as_json().pointer("/metadata/creationTimestamp").cloned() { stored.set_metadata("creationTimestamp", ts); }
        stored.set_metadata("resourceVersion", Json::String(rv));
        stored.set_metadata("generation", Json::from(generation));

        inner.log(Verb::Update, kind, obj.clone(), true);
        let coll = inner.kinds.entry(kind.clone()).or_default();
        coll.items.insert(key.clone(), stored.clone());
        coll.notify(FeedEvent::Updated(stored.clone()));
        trace!(store = %self.label, kind = %kind, key = %key, "updated");
        Ok(stored)
    }

    async fn delete(&self, kind: &ObjectKind, namespace: Option<&str>, name: &str) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let key = object_key(namespace, name);
        let mut stub = Object::new(serde_json::json!({ "metadata": { "name": name } }));
        if let Some(ns) = namespace { stub.set_metadata("namespace", Json::String(ns.to_string())); }
        if inner.take_failure(Verb::Delete, name) {
            inner.log(Verb::Delete, kind, stub, false);
            return Err(injected(Verb::Delete, &key));
        }
        let removed = inner.kinds.get_mut(kind).and_then(|c| c.items.remove(&key));
        let ok = removed.is_some();
        inner.log(Verb::Delete, kind, stub, ok);
        match removed {
            Some(last) => {
                if let Some(coll) = inner.kinds.get_mut(kind) { coll.notify(FeedEvent::Deleted(last)); }
                trace!(store = %self.label, kind = %kind, key = %key, "deleted");
                Ok(())
            }
            None => Err(StoreError::NotFound { kind: kind.to_string(), key }),
        }
    }

    async fn watch(&self, kind: &ObjectKind) -> Result<ChangeFeed, StoreError> {
        let (tx, rx) = mpsc::unbounded_channel();
        // Snapshot and subscription happen under one lock so no change falls between them.
        let initial: Vec<FeedEvent> = {
            let mut inner = self.lock();
            let coll = inner.kinds.entry(kind.clone()).or_default();
            coll.watchers.push(tx);
            let mut evs: Vec<FeedEvent> = coll.items.values().cloned().map(FeedEvent::Added).collect();
            evs.push(FeedEvent::Synced);
            evs
        };
        debug!(store = %self.label, kind = %kind, initial = initial.len() - 1, "watch opened");
        let live = futures::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|ev| (ev, rx)) });
        Ok(futures::stream::iter(initial).chain(live).map(Ok).boxed())
    }
}
