//! Object kinds, the static sync order and kind resolution.

use serde::{Deserialize, Serialize};

use crate::error::ResolutionError;
use crate::object::Object;

/// A `(group, version, resource)` triple addressing one collection on a store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKind {
    pub group: String,
    pub version: String,
    pub resource: String,
}

impl ObjectKind {
    pub fn new(group: &str, version: &str, resource: &str) -> Self {
        Self { group: group.to_string(), version: version.to_string(), resource: resource.to_string() }
    }

    pub fn core(resource: &str) -> Self { Self::new("", "v1", resource) }

    pub fn namespaces() -> Self { Self::core("namespaces") }
    pub fn nodes() -> Self { Self::core("nodes") }
    pub fn pods() -> Self { Self::core("pods") }
    pub fn persistent_volumes() -> Self { Self::core("persistentvolumes") }
    pub fn persistent_volume_claims() -> Self { Self::core("persistentvolumeclaims") }
    pub fn priority_classes() -> Self { Self::new("scheduling.k8s.io", "v1", "priorityclasses") }
    pub fn storage_classes() -> Self { Self::new("storage.k8s.io", "v1", "storageclasses") }

    /// Parse `v1/pods` or `storage.k8s.io/v1/storageclasses`.
    pub fn parse(key: &str) -> Option<Self> {
        let parts: Vec<&str> = key.split('/').collect();
        match parts.as_slice() {
            [version, resource] if !version.is_empty() && !resource.is_empty() => Some(Self::new("", version, resource)),
            [group, version, resource] if !version.is_empty() && !resource.is_empty() => Some(Self::new(group, version, resource)),
            _ => None,
        }
    }
}

impl std::fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}/{}", self.version, self.resource)
        } else {
            write!(f, "{}/{}/{}", self.group, self.version, self.resource)
        }
    }
}

impl std::str::FromStr for ObjectKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| format!("invalid kind: {} (expect v1/pods or group/v1/resource)", s))
    }
}

/// Built-in kinds in dependency order: a kind referencing another kind's
/// objects comes after it. Syncer and importer walk this table front to back.
pub const SYNC_ORDER: [(&str, &str, &str, &str); 7] = [
    // (group, version, resource, kind)
    ("", "v1", "namespaces", "Namespace"),
    ("scheduling.k8s.io", "v1", "priorityclasses", "PriorityClass"),
    ("storage.k8s.io", "v1", "storageclasses", "StorageClass"),
    ("", "v1", "persistentvolumeclaims", "PersistentVolumeClaim"),
    ("", "v1", "nodes", "Node"),
    ("", "v1", "persistentvolumes", "PersistentVolume"),
    ("", "v1", "pods", "Pod"),
];

/// The sync order as [`ObjectKind`] values.
pub fn sync_order() -> Vec<ObjectKind> {
    SYNC_ORDER.iter().map(|(g, v, r, _)| ObjectKind::new(g, v, r)).collect()
}

/// Maps a declared `(group, version, kind)` to the collection that stores it.
pub trait KindResolver: Send + Sync {
    fn resolve(&self, group: &str, version: &str, kind: &str) -> Result<ObjectKind, ResolutionError>;

    fn resolve_object(&self, obj: &Object) -> Result<ObjectKind, ResolutionError> {
        let (group, version) = obj.group_version();
        self.resolve(group, version, obj.kind())
    }
}

/// Table-backed resolver. `builtin()` knows every kind of the sync order.
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    entries: Vec<(String, String, String, String)>,
}

impl StaticResolver {
    pub fn builtin() -> Self {
        let mut me = Self::default();
        for (g, v, r, k) in SYNC_ORDER.iter() { me = me.with(g, v, k, r); }
        me
    }

    pub fn with(mut self, group: &str, version: &str, kind: &str, resource: &str) -> Self {
        self.entries.push((group.to_string(), version.to_string(), kind.to_string(), resource.to_string()));
        self
    }
}

impl KindResolver for StaticResolver {
    fn resolve(&self, group: &str, version: &str, kind: &str) -> Result<ObjectKind, ResolutionError> {
        self.entries
            .iter()
            .find(|(g, v, k, _)| g == group && v == version && k == kind)
            .map(|(g, v, _, r)| ObjectKind::new(g, v, r))
            .ok_or_else(|| ResolutionError::new(group, version, kind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display_roundtrip() {
        let k = ObjectKind::parse("storage.k8s.io/v1/storageclasses").unwrap();
        assert_eq!(k, ObjectKind::storage_classes());
        assert_eq!(k.to_string(), "storage.k8s.io/v1/storageclasses");
        assert_eq!(ObjectKind::parse("v1/pods"), Some(ObjectKind::pods()));
        assert!(ObjectKind::parse("pods").is_none());
        assert!("a/b/c/d".parse::<ObjectKind>().is_err());
    }

    #[test]
    fn sync_order_puts_dependencies_first() {
        let order = sync_order();
        let pos = |k: &ObjectKind| order.iter().position(|x| x == k).unwrap();
        assert!(pos(&ObjectKind::namespaces()) < pos(&ObjectKind::pods()));
        assert!(pos(&ObjectKind::nodes()) < pos(&ObjectKind::pods()));
        assert!(pos(&ObjectKind::persistent_volume_claims()) < pos(&ObjectKind::persistent_volumes()));
        assert_eq!(order.len(), 7);
    }

    #[test]
    fn static_resolver_maps_builtins_and_rejects_unknown() {
        let r = StaticResolver::builtin();
        assert_eq!(r.resolve("", "v1", "Pod").unwrap(), ObjectKind::pods());
        assert_eq!(r.resolve("scheduling.k8s.io", "v1", "PriorityClass").unwrap(), ObjectKind::priority_classes());
        let err = r.resolve("apps", "v1", "Deployment").unwrap_err();
        assert_eq!(err.kind, "Deployment");

        let r = r.with("apps", "v1", "Deployment", "deployments");
        assert_eq!(r.resolve("apps", "v1", "Deployment").unwrap().resource, "deployments");
    }
}
