//! Functions every registry starts with.
//!
//! - [`SkipPlacedPods`]: once a pod has a node, its updates stay on the source;
//!   the destination schedules it on its own.
//! - [`ResetServiceAccount`]: the source's service account may not exist on
//!   the destination.
//! - [`RebindClaimRef`]: a bound volume must point at the claim's uid as the
//!   destination knows it.

use std::sync::Arc;

use anyhow::Context;
use k8s_openapi::api::core::v1::{PersistentVolume, Pod};
use kopy_core::{Object, ObjectKind, Operation, StoreError};
use serde_json::{Map, Value as Json};
use tracing::{debug, info};

use crate::{Clients, Filter, Mutator, RegistryBuilder};

pub const DEFAULT_SERVICE_ACCOUNT: &str = "default";

pub(crate) fn register(b: RegistryBuilder) -> RegistryBuilder {
    b.filter(ObjectKind::pods(), Arc::new(SkipPlacedPods))
        .mutator(ObjectKind::pods(), Arc::new(ResetServiceAccount))
        .mutator(ObjectKind::persistent_volumes(), Arc::new(RebindClaimRef))
}

pub struct SkipPlacedPods;

#[async_trait::async_trait]
impl Filter for SkipPlacedPods {
    fn name(&self) -> &str { "skip-placed-pods" }

    async fn admit(&self, op: Operation, obj: &Object, _clients: &Clients) -> anyhow::Result<bool> {
        if op != Operation::Update {
            return Ok(true);
        }
        let pod: Pod = serde_json::from_value(obj.as_json().clone()).context("decoding pod")?;
        let node = pod.spec.and_then(|s| s.node_name).unwrap_or_default();
        if !node.is_empty() {
            info!(pod = %obj.name(), namespace = ?obj.namespace(), node = %node, "pod is already placed; ignoring update");
            return Ok(false);
        }
        Ok(true)
    }
}

pub struct ResetServiceAccount;

#[async_trait::async_trait]
impl Mutator for ResetServiceAccount {
    fn name(&self) -> &str { "reset-service-account" }

    async fn mutate(&self, _op: Operation, mut obj: Object, _clients: &Clients) -> anyhow::Result<Object> {
        let root = obj.as_json_mut().as_object_mut().context("pod is not a JSON object")?;
        let spec = root.entry("spec").or_insert_with(|| Json::Object(Map::new()));
        let spec = spec.as_object_mut().context("pod spec is not an object")?;
        spec.insert("serviceAccountName".into(), Json::String(DEFAULT_SERVICE_ACCOUNT.into()));
        // deprecated alias; must agree with serviceAccountName when present
        if spec.contains_key("serviceAccount") {
            spec.insert("serviceAccount".into(), Json::String(DEFAULT_SERVICE_ACCOUNT.into()));
        }
        Ok(obj)
    }
}

pub struct RebindClaimRef;

impl RebindClaimRef {
    /// The claim's uid on the destination if it is there already, else the source's.
    async fn claim_uid(clients: &Clients, namespace: &str, name: &str) -> anyhow::Result<Option<String>> {
        let kind = ObjectKind::persistent_volume_claims();
        let claim = match clients.destination.get(&kind, Some(namespace), name).await {
            Ok(c) => c,
            Err(StoreError::NotFound { .. }) => {
                debug!(claim = %name, namespace = %namespace, "claim not on destination yet; using source");
                clients
                    .source
                    .get(&kind, Some(namespace), name)
                    .await
                    .with_context(|| format!("getting claim {}/{} from source", namespace, name))?
            }
            Err(e) => return Err(e).with_context(|| format!("getting claim {}/{} from destination", namespace, name)),
        };
        Ok(claim.uid().map(str::to_string))
    }
}

#[async_trait::async_trait]
impl Mutator for RebindClaimRef {
    fn name(&self) -> &str { "rebind-claim-ref" }

    async fn mutate(&self, _op: Operation, mut obj: Object, clients: &Clients) -> anyhow::Result<Object> {
        let pv: PersistentVolume = serde_json::from_value(obj.as_json().clone()).context("decoding persistent volume")?;
        let bound = pv.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Bound");
        if !bound {
            return Ok(obj);
        }
        let Some(claim) = pv.spec.and_then(|s| s.claim_ref) else {
            debug!(pv = %obj.name(), "bound volume without claimRef; leaving as is");
            return Ok(obj);
        };
        let (Some(ns), Some(name)) = (claim.namespace, claim.name) else {
            return Ok(obj);
        };
        if let Some(uid) = Self::claim_uid(clients, &ns, &name).await? {
            if let Some(r) = obj.as_json_mut().pointer_mut("/spec/claimRef").and_then(|v| v.as_object_mut()) {
                r.insert("uid".into(), Json::String(uid));
            }
        }
        Ok(obj)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kopy_core::ObjectStore;
    use kopy_store::MemoryStore;

    fn pod(node: Option<&str>) -> Object {
        let mut v = serde_json::json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": { "name": "pod-1", "namespace": "default" },
            "spec": { "containers": [ { "name": "c" } ], "serviceAccountName": "builder" }
        });
        if let Some(n) = node { v["spec"]["nodeName"] = Json::String(n.into()); }
        Object::new(v)
    }

    fn claim(name: &str) -> Object {
        Object::new(serde_json::json!({
            "apiVersion": "v1",
            "kind": "PersistentVolumeClaim",
            "metadata": { "name": name, "namespace": "default" },
            "spec": { "accessModes": ["ReadWriteOnce"] }
        }))
    }

    fn bound_pv(claim: &str, stale_uid: &str) -> Object {
        Object::new(serde_json::json!({
            "apiVersion": "v1",
            "kind": "PersistentVolume",
            "metadata": { "name": "pv-1" },
            "spec": {
                "capacity": { "storage": "1Gi" },
                "claimRef": { "kind": "PersistentVolumeClaim", "namespace": "default", "name": claim, "uid": stale_uid }
            },
            "status": { "phase": "Bound" }
        }))
    }

    fn stores() -> (Arc<MemoryStore>, Arc<MemoryStore>, Clients) {
        let src = Arc::new(MemoryStore::new("src"));
        let dest = Arc::new(MemoryStore::new("dest"));
        let c = Clients::new(src.clone(), dest.clone());
        (src, dest, c)
    }

    #[tokio::test]
    async fn placed_pod_updates_are_filtered_adds_are_not() {
        let (_, _, c) = stores();
        assert!(SkipPlacedPods.admit(Operation::Update, &pod(None), &c).await.unwrap());
        assert!(!SkipPlacedPods.admit(Operation::Update, &pod(Some("node-1")), &c).await.unwrap());
        assert!(SkipPlacedPods.admit(Operation::Add, &pod(Some("node-1")), &c).await.unwrap());
    }

    #[tokio::test]
    async fn service_account_is_forced_to_default() {
        let (_, _, c) = stores();
        let mut p = pod(None);
        p.as_json_mut()["spec"]["serviceAccount"] = Json::String("builder".into());
        let out = ResetServiceAccount.mutate(Operation::Add, p, &c).await.unwrap();
        assert_eq!(out.as_json().pointer("/spec/serviceAccountName").and_then(|v| v.as_str()), Some("default"));
        assert_eq!(out.as_json().pointer("/spec/serviceAccount").and_then(|v| v.as_str()), Some("default"));
        assert!(out.as_json().pointer("/spec/containers/0").is_some());
    }

    #[tokio::test]
    async fn bound_volume_takes_destination_claim_uid() {
        let (src, dest, c) = stores();
        let src_claim = src.create(&ObjectKind::persistent_volume_claims(), &claim("data")).await.unwrap();
        let dest_claim = dest.create(&ObjectKind::persistent_volume_claims(), &claim("data")).await.unwrap();
        assert_ne!(src_claim.uid(), dest_claim.uid());

        let out = RebindClaimRef.mutate(Operation::Add, bound_pv("data", src_claim.uid().unwrap()), &c).await.unwrap();
        assert_eq!(out.as_json().pointer("/spec/claimRef/uid").and_then(|v| v.as_str()), dest_claim.uid());
        assert_eq!(out.as_json().pointer("/spec/capacity/storage").and_then(|v| v.as_str()), Some("1Gi"));
    }

    #[tokio::test]
    async fn bound_volume_falls_back_to_source_claim() {
        let (src, _dest, c) = stores();
        let src_claim = src.create(&ObjectKind::persistent_volume_claims(), &claim("data")).await.unwrap();
        let out = RebindClaimRef.mutate(Operation::Add, bound_pv("data", "stale"), &c).await.unwrap();
        assert_eq!(out.as_json().pointer("/spec/claimRef/uid").and_then(|v| v.as_str()), src_claim.uid());
    }

    #[tokio::test]
    async fn missing_claim_everywhere_fails_and_unbound_volume_is_untouched() {
        let (_, _, c) = stores();
        assert!(RebindClaimRef.mutate(Operation::Add, bound_pv("nope", "stale"), &c).await.is_err());

        let mut pv = bound_pv("nope", "stale");
        pv.as_json_mut()["status"]["phase"] = Json::String("Available".into());
        let out = RebindClaimRef.mutate(Operation::Add, pv.clone(), &c).await.unwrap();
        assert_eq!(out, pv);
    }
}
