//! Self-describing JSON objects.
//!
//! The core never decodes an [`Object`] into a typed view; it only reads the
//! handful of metadata fields needed to address and route it.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};

/// Server-assigned metadata fields that must never be carried into a create on
/// another store.
pub const IDENTITY_FIELDS: [&str; 3] = ["uid", "generation", "resourceVersion"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Object(Json);

impl Object {
    pub fn new(raw: Json) -> Self { Self(raw) }

    pub fn as_json(&self) -> &Json { &self.0 }
    pub fn as_json_mut(&mut self) -> &mut Json { &mut self.0 }
    pub fn into_json(self) -> Json { self.0 }

    pub fn api_version(&self) -> &str { self.str_at("/apiVersion").unwrap_or("") }
    pub fn kind(&self) -> &str { self.str_at("/kind").unwrap_or("") }

    /// Split `apiVersion` into `(group, version)`; the core group is `""`.
    pub fn group_version(&self) -> (&str, &str) {
        match self.api_version().split_once('/') {
            Some((g, v)) => (g, v),
            None => ("", self.api_version()),
        }
    }

    pub fn name(&self) -> &str { self.str_at("/metadata/name").unwrap_or("") }

    /// Namespace, or `None` for cluster-scoped objects (an empty namespace counts as absent).
    pub fn namespace(&self) -> Option<&str> {
        self.str_at("/metadata/namespace").filter(|s| !s.is_empty())
    }

    pub fn uid(&self) -> Option<&str> { self.str_at("/metadata/uid") }
    pub fn resource_version(&self) -> Option<&str> { self.str_at("/metadata/resourceVersion") }
    pub fn generation(&self) -> Option<i64> { self.0.pointer("/metadata/generation").and_then(|v| v.as_i64()) }

    /// `namespace/name` for namespaced objects, `name` otherwise.
    pub fn key(&self) -> String {
        match self.namespace() {
            Some(ns) => format!("{}/{}", ns, self.name()),
            None => self.name().to_string(),
        }
    }

    /// Mutable `metadata` map, created if the object has none. `None` when
    /// the object is not a JSON object at all.
    pub fn metadata_mut(&mut self) -> Option<&mut Map<String, Json>> {
        let meta = self.0.as_object_mut()?.entry("metadata").or_insert_with(|| Json::Object(Map::new()));
        if !meta.is_object() { *meta = Json::Object(Map::new()); }
        meta.as_object_mut()
    }

    pub fn set_metadata(&mut self, field: &str, value: Json) {
        if let Some(meta) = self.metadata_mut() {
            meta.insert(field.to_string(), value);
        }
    }

    /// Remove uid, generation and resourceVersion.
    pub fn strip_identity(&mut self) {
        if let Some(meta) = self.metadata_mut() {
            for f in IDENTITY_FIELDS { meta.remove(f); }
        }
    }

    pub fn has_identity(&self) -> bool {
        IDENTITY_FIELDS.iter().any(|f| self.0.pointer(&format!("/metadata/{}", f)).is_some())
    }

    fn str_at(&self, pointer: &str) -> Option<&str> {
        self.0.pointer(pointer).and_then(|v| v.as_str())
    }
}

impl From<Json> for Object {
    fn from(v: Json) -> Self { Self(v) }
}

impl From<Object> for Json {
    fn from(o: Object) -> Self { o.0 }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pod() -> Object {
        Object::new(serde_json::json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": "pod-1",
                "namespace": "default",
                "uid": "3c5b2a4e-0000-0000-0000-000000000001",
                "generation": 3,
                "resourceVersion": "812",
                "labels": { "app": "web" }
            },
            "spec": { "containers": [ { "name": "c" } ] }
        }))
    }

    #[test]
    fn accessors_read_metadata() {
        let p = pod();
        assert_eq!(p.group_version(), ("", "v1"));
        assert_eq!(p.kind(), "Pod");
        assert_eq!(p.key(), "default/pod-1");
        assert_eq!(p.generation(), Some(3));
        assert_eq!(p.resource_version(), Some("812"));

        let pc = Object::new(serde_json::json!({
            "apiVersion": "scheduling.k8s.io/v1",
            "kind": "PriorityClass",
            "metadata": { "name": "high", "namespace": "" }
        }));
        assert_eq!(pc.group_version(), ("scheduling.k8s.io", "v1"));
        assert_eq!(pc.namespace(), None);
        assert_eq!(pc.key(), "high");
    }

    #[test]
    fn strip_identity_keeps_everything_else() {
        let mut p = pod();
        assert!(p.has_identity());
        p.strip_identity();
        assert!(!p.has_identity());
        assert_eq!(p.as_json().pointer("/metadata/labels/app").and_then(|v| v.as_str()), Some("web"));
        assert_eq!(p.name(), "pod-1");
        assert!(p.as_json().pointer("/spec/containers/0").is_some());
    }

    #[test]
    fn metadata_mut_repairs_missing_map() {
        let mut o = Object::new(serde_json::json!({ "kind": "Namespace" }));
        o.set_metadata("name", Json::String("default".into()));
        assert_eq!(o.name(), "default");

        let mut broken = Object::new(serde_json::json!({ "kind": "Namespace", "metadata": "oops" }));
        broken.set_metadata("name", Json::String("default".into()));
        assert_eq!(broken.name(), "default");

        let mut scalar = Object::new(Json::Null);
        assert!(scalar.metadata_mut().is_none());
        scalar.strip_identity();
        assert_eq!(scalar.as_json(), &Json::Null);
    }
}
