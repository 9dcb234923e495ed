//! Discovery snapshot: which kinds a cluster serves, their plural resource
//! names and their scope. Built once per connection.

use anyhow::Result;
use kopy_core::{KindResolver, ObjectKind, ResolutionError};
use kube::{
    core::ApiResource,
    discovery::{Discovery, Scope},
    Client,
};
use rustc_hash::FxHashMap;
use serde::Serialize;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct CatalogEntry {
    pub resource: ApiResource,
    pub namespaced: bool,
}

impl CatalogEntry {
    pub fn object_kind(&self) -> ObjectKind {
        ObjectKind::new(&self.resource.group, &self.resource.version, &self.resource.plural)
    }
}

/// Row shape used by `kopyctl discover`.
#[derive(Debug, Clone, Serialize)]
pub struct DiscoveredResource {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub resource: String,
    pub namespaced: bool,
}

#[derive(Debug, Clone, Default)]
pub struct Catalog {
    by_kind: FxHashMap<ObjectKind, CatalogEntry>,
}

impl Catalog {
    /// Run discovery against every served group version (not only the preferred one).
    pub async fn discover(client: Client) -> Result<Self> {
        let discovery = Discovery::new(client).run().await?;
        let mut entries = Vec::new();
        for group in discovery.groups() {
            for version in group.versions() {
                for (ar, caps) in group.versioned_resources(version) {
                    entries.push(CatalogEntry { resource: ar, namespaced: matches!(caps.scope, Scope::Namespaced) });
                }
            }
        }
        debug!(count = entries.len(), "discovery catalog built");
        Ok(Self::from_entries(entries))
    }

    pub fn from_entries(entries: impl IntoIterator<Item = CatalogEntry>) -> Self {
        let by_kind = entries.into_iter().map(|e| (e.object_kind(), e)).collect();
        Self { by_kind }
    }

    pub fn lookup(&self, kind: &ObjectKind) -> Option<&CatalogEntry> { self.by_kind.get(kind) }

    /// Stable-ish order: group, version, kind.
    pub fn resources(&self) -> Vec<DiscoveredResource> {
        let mut out: Vec<DiscoveredResource> = self
            .by_kind
            .values()
            .map(|e| DiscoveredResource {
                group: e.resource.group.clone(),
                version: e.resource.version.clone(),
                kind: e.resource.kind.clone(),
                resource: e.resource.plural.clone(),
                namespaced: e.namespaced,
            })
            .collect();
        out.sort_by(|a, b| a.group.cmp(&b.group).then(a.version.cmp(&b.version)).then(a.kind.cmp(&b.kind)));
        out
    }
}

impl KindResolver for Catalog {
    fn resolve(&self, group: &str, version: &str, kind: &str) -> Result<ObjectKind, ResolutionError> {
        self.by_kind
            .values()
            .find(|e| e.resource.group == group && e.resource.version == version && e.resource.kind == kind)
            .map(CatalogEntry::object_kind)
            .ok_or_else(|| ResolutionError::new(group, version, kind))
    }
}
