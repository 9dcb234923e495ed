#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use kopy_apply::ResourceApplier;
use kopy_core::{ChangeFeed, Error, Object, ObjectKind, ObjectStore, StaticResolver, StoreError};
use kopy_pipeline::{Clients, Pipeline, PipelineRegistry};
use kopy_store::{MemoryStore, Verb};
use kopy_sync::Syncer;
use serde_json::{json, Value as Json};
use tokio_util::sync::CancellationToken;

struct Rig {
    src: Arc<MemoryStore>,
    dest: Arc<MemoryStore>,
    syncer: Syncer,
}

fn rig() -> Rig {
    let src = Arc::new(MemoryStore::new("src"));
    let dest = Arc::new(MemoryStore::new("dest"));
    let applier = Arc::new(ResourceApplier::new(dest.clone(), Arc::new(StaticResolver::builtin())));
    let pipeline = Pipeline::new(Arc::new(PipelineRegistry::mandatory()), Clients::new(src.clone(), dest.clone()));
    let syncer = Syncer::new(src.clone(), applier, pipeline);
    Rig { src, dest, syncer }
}

fn namespace(name: &str) -> Object {
    Object::new(json!({ "apiVersion": "v1", "kind": "Namespace", "metadata": { "name": name } }))
}

fn pod(name: &str) -> Object {
    Object::new(json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": { "name": name, "namespace": "default" },
        "spec": { "containers": [ { "name": "container-1", "image": "image-1" } ], "serviceAccountName": "builder" }
    }))
}

async fn eventually<F: Fn() -> bool>(what: &str, cond: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn src_pod(src: &MemoryStore, name: &str) -> Object {
    src.peek(&ObjectKind::pods(), Some("default"), name).expect("pod on source")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn namespace_and_pod_follow_the_source_until_placement() {
    let r = rig();
    let pods = ObjectKind::pods();
    r.src.create(&ObjectKind::namespaces(), &namespace("default")).await.unwrap();
    let src_pod1 = r.src.create(&pods, &pod("pod-1")).await.unwrap();

    let handle = r.syncer.run(CancellationToken::new()).await.unwrap();

    // run returns after every initial listing has been applied
    assert!(r.dest.peek(&ObjectKind::namespaces(), None, "default").is_some());
    let dest_pod1 = r.dest.peek(&pods, Some("default"), "pod-1").expect("pod-1 synced");
    assert_ne!(dest_pod1.uid(), src_pod1.uid());
    assert_eq!(dest_pod1.as_json().pointer("/spec/serviceAccountName"), Some(&json!("default")));
    for w in r.dest.writes().iter().filter(|w| w.verb == Verb::Create) {
        assert!(!w.object.has_identity(), "create carried source identity: {}", w.object.key());
    }

    // unplaced update propagates
    let mut o = src_pod(&r.src, "pod-1");
    o.set_metadata("labels", json!({ "phase": "waiting" }));
    r.src.update(&pods, &o).await.unwrap();
    eventually("unplaced update", || {
        r.dest.peek(&pods, Some("default"), "pod-1").and_then(|p| p.as_json().pointer("/metadata/labels/phase").cloned())
            == Some(json!("waiting"))
    })
    .await;

    // placement update does not
    let mut o = src_pod(&r.src, "pod-1");
    o.as_json_mut()["spec"]["nodeName"] = Json::String("node-1".into());
    o.set_metadata("labels", json!({ "phase": "placed" }));
    r.src.update(&pods, &o).await.unwrap();
    r.src.create(&pods, &pod("pod-2")).await.unwrap();
    eventually("pod-2 behind the placement update", || r.dest.peek(&pods, Some("default"), "pod-2").is_some()).await;
    let dest_pod1 = r.dest.peek(&pods, Some("default"), "pod-1").unwrap();
    assert!(dest_pod1.as_json().pointer("/spec/nodeName").is_none());
    assert_eq!(dest_pod1.as_json().pointer("/metadata/labels/phase"), Some(&json!("waiting")));

    let pod1_updates = r.dest.writes().iter().filter(|w| w.verb == Verb::Update && w.object.name() == "pod-1").count();
    assert_eq!(pod1_updates, 1);

    // delete propagates
    r.src.delete(&pods, Some("default"), "pod-1").await.unwrap();
    eventually("pod-1 deleted", || r.dest.peek(&pods, Some("default"), "pod-1").is_none()).await;

    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn bound_volume_points_at_destination_claim() {
    let r = rig();
    let claim = Object::new(json!({
        "apiVersion": "v1",
        "kind": "PersistentVolumeClaim",
        "metadata": { "name": "data", "namespace": "default" },
        "spec": { "accessModes": ["ReadWriteOnce"], "volumeName": "pv-1" }
    }));
    let src_claim = r.src.create(&ObjectKind::persistent_volume_claims(), &claim).await.unwrap();
    let pv = Object::new(json!({
        "apiVersion": "v1",
        "kind": "PersistentVolume",
        "metadata": { "name": "pv-1" },
        "spec": {
            "capacity": { "storage": "1Gi" },
            "claimRef": { "kind": "PersistentVolumeClaim", "namespace": "default", "name": "data", "uid": src_claim.uid() }
        },
        "status": { "phase": "Bound" }
    }));
    r.src.create(&ObjectKind::persistent_volumes(), &pv).await.unwrap();

    let handle = r.syncer.run(CancellationToken::new()).await.unwrap();

    let dest_claim = r.dest.peek(&ObjectKind::persistent_volume_claims(), Some("default"), "data").unwrap();
    let dest_pv = r.dest.peek(&ObjectKind::persistent_volumes(), None, "pv-1").unwrap();
    let bound_to = dest_pv.as_json().pointer("/spec/claimRef/uid").and_then(|v| v.as_str());
    assert_eq!(bound_to, dest_claim.uid());
    assert_ne!(bound_to, src_claim.uid());

    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_write_does_not_stop_the_feed() {
    let r = rig();
    let pods = ObjectKind::pods();
    let handle = r.syncer.run(CancellationToken::new()).await.unwrap();
    assert_eq!(handle.running(), 7);

    r.dest.fail_next(Verb::Create, "pod-1");
    r.src.create(&pods, &pod("pod-1")).await.unwrap();
    r.src.create(&pods, &pod("pod-2")).await.unwrap();
    eventually("pod-2 after a failed pod-1", || r.dest.peek(&pods, Some("default"), "pod-2").is_some()).await;
    assert!(r.dest.peek(&pods, Some("default"), "pod-1").is_none());
    assert_eq!(handle.running(), 7);

    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancellation_stops_every_consumer() {
    let r = rig();
    let cancel = CancellationToken::new();
    let handle = r.syncer.run(cancel.clone()).await.unwrap();

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(2), handle.wait()).await.expect("consumers did not stop");

    r.src.create(&ObjectKind::namespaces(), &namespace("late")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(r.dest.peek(&ObjectKind::namespaces(), None, "late").is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn already_cancelled_run_opens_nothing() {
    let r = rig();
    let cancel = CancellationToken::new();
    cancel.cancel();
    let handle = r.syncer.run(cancel).await.unwrap();
    assert_eq!(handle.running(), 0);
    handle.wait().await;
}

/// Source whose feed for one kind cannot be opened.
struct BrokenFeed {
    inner: Arc<MemoryStore>,
    broken: ObjectKind,
}

#[async_trait::async_trait]
impl ObjectStore for BrokenFeed {
    async fn list(&self, kind: &ObjectKind, namespace: Option<&str>) -> Result<Vec<Object>, StoreError> {
        self.inner.list(kind, namespace).await
    }
    async fn get(&self, kind: &ObjectKind, namespace: Option<&str>, name: &str) -> Result<Object, StoreError> {
        self.inner.get(kind, namespace, name).await
    }
    async fn create(&self, kind: &ObjectKind, obj: &Object) -> Result<Object, StoreError> {
        self.inner.create(kind, obj).await
    }
    async fn update(&self, kind: &ObjectKind, obj: &Object) -> Result<Object, StoreError> {
        self.inner.update(kind, obj).await
    }
    async fn delete(&self, kind: &ObjectKind, namespace: Option<&str>, name: &str) -> Result<(), StoreError> {
        self.inner.delete(kind, namespace, name).await
    }
    async fn watch(&self, kind: &ObjectKind) -> Result<ChangeFeed, StoreError> {
        if *kind == self.broken {
            return Err(StoreError::msg(format!("watch {} refused", kind)));
        }
        self.inner.watch(kind).await
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_feed_open_stops_started_consumers() {
    let src = Arc::new(MemoryStore::new("src"));
    let dest = Arc::new(MemoryStore::new("dest"));
    let applier = Arc::new(ResourceApplier::new(dest.clone(), Arc::new(StaticResolver::builtin())));
    let pipeline = Pipeline::new(Arc::new(PipelineRegistry::mandatory()), Clients::new(src.clone(), dest.clone()));
    let source = Arc::new(BrokenFeed { inner: src.clone(), broken: ObjectKind::pods() });
    src.create(&ObjectKind::namespaces(), &namespace("early")).await.unwrap();

    let cancel = CancellationToken::new();
    let res = Syncer::new(source, applier, pipeline).run(cancel.clone()).await;
    assert!(matches!(res, Err(Error::Store(_))));
    // namespaces were consumed before the pods feed failed
    assert!(dest.peek(&ObjectKind::namespaces(), None, "early").is_some());
    assert!(!cancel.is_cancelled());

    src.create(&ObjectKind::namespaces(), &namespace("late")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(dest.peek(&ObjectKind::namespaces(), None, "late").is_none());
}
