#![forbid(unsafe_code)]

use std::sync::Arc;

use kopy_apply::ResourceApplier;
use kopy_core::{Object, ObjectKind, ObjectStore, StaticResolver};
use kopy_pipeline::{Clients, Pipeline, PipelineRegistry};
use kopy_store::{MemoryStore, Verb};
use kopy_sync::{ImportSummary, Importer};
use serde_json::json;

fn importer(src: &Arc<MemoryStore>, dest: &Arc<MemoryStore>) -> Importer {
    let applier = Arc::new(ResourceApplier::new(dest.clone(), Arc::new(StaticResolver::builtin())));
    let pipeline = Pipeline::new(Arc::new(PipelineRegistry::mandatory()), Clients::new(src.clone(), dest.clone()));
    Importer::new(src.clone(), applier, pipeline).with_concurrency(4)
}

fn pod(name: &str, node: Option<&str>) -> Object {
    let mut o = Object::new(json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": { "name": name, "namespace": "default" },
        "spec": { "containers": [ { "name": "c" } ] }
    }));
    if let Some(n) = node { o.as_json_mut()["spec"]["nodeName"] = json!(n); }
    o
}

async fn seed(src: &MemoryStore) {
    src.create(&ObjectKind::namespaces(), &Object::new(json!({ "apiVersion": "v1", "kind": "Namespace", "metadata": { "name": "default" } })))
        .await
        .unwrap();
    src.create(&ObjectKind::nodes(), &Object::new(json!({ "apiVersion": "v1", "kind": "Node", "metadata": { "name": "node-1" } })))
        .await
        .unwrap();
    for i in 0..20 {
        let node = if i % 2 == 0 { Some("node-1") } else { None };
        src.create(&ObjectKind::pods(), &pod(&format!("pod-{}", i), node)).await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn imports_every_kind_in_dependency_order() {
    let src = Arc::new(MemoryStore::new("src"));
    let dest = Arc::new(MemoryStore::new("dest"));
    seed(&src).await;

    let summary = importer(&src, &dest).import().await.unwrap();
    assert_eq!(summary, ImportSummary { listed: 22, created: 22, already_present: 0, skipped: 0 });
    assert_eq!(dest.count(&ObjectKind::pods()), 20);

    // adds are never filtered: placed pods arrive with their node
    let placed = dest.peek(&ObjectKind::pods(), Some("default"), "pod-0").unwrap();
    assert_eq!(placed.as_json().pointer("/spec/nodeName"), Some(&json!("node-1")));

    let order: Vec<String> = dest.writes().iter().map(|w| w.kind.resource.clone()).collect();
    let first_pod = order.iter().position(|r| r == "pods").unwrap();
    assert!(order[..first_pod].contains(&"namespaces".to_string()));
    assert!(order[..first_pod].contains(&"nodes".to_string()));
    assert!(order[first_pod..].iter().all(|r| r == "pods"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn second_import_finds_everything_present() {
    let src = Arc::new(MemoryStore::new("src"));
    let dest = Arc::new(MemoryStore::new("dest"));
    seed(&src).await;

    let imp = importer(&src, &dest);
    imp.import().await.unwrap();
    let again = imp.import().await.unwrap();
    assert_eq!(again.created, 0);
    assert_eq!(again.already_present, 22);
    assert_eq!(dest.count(&ObjectKind::pods()), 20);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn first_failure_aborts_the_import() {
    let src = Arc::new(MemoryStore::new("src"));
    let dest = Arc::new(MemoryStore::new("dest"));
    seed(&src).await;
    dest.fail_next(Verb::Create, "node-1");

    let err = importer(&src, &dest).import().await.unwrap_err();
    assert!(!err.is_conflict());
    assert_eq!(dest.count(&ObjectKind::pods()), 0, "kinds after the failed one must not be imported");
}
