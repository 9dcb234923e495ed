//! Kopy kubehub: cluster connections, discovery and the kube-backed object store.

#![forbid(unsafe_code)]

pub mod catalog;
pub mod feed;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::StreamExt;
use kopy_core::{ChangeFeed, FeedEvent, KindResolver, Object, ObjectKind, ObjectStore, ResolutionError, StoreError};
use kube::{
    api::{Api, DeleteParams, ListParams, PostParams},
    config::{KubeConfigOptions, Kubeconfig},
    core::{ApiResource, DynamicObject},
    runtime::{watcher, WatchStreamExt},
    Client,
};
use tracing::{debug, info, warn};

pub use catalog::{Catalog, CatalogEntry, DiscoveredResource};
pub use feed::FeedCache;

/// How to reach one cluster. `url` wins over kubeconfig settings and skips TLS
/// verification (local simulator API servers use self-signed certificates).
#[derive(Debug, Clone, Default)]
pub struct ClusterTarget {
    pub kubeconfig: Option<PathBuf>,
    pub context: Option<String>,
    pub url: Option<String>,
}

pub async fn connect(target: &ClusterTarget) -> Result<Client> {
    let config = if let Some(url) = target.url.as_deref() {
        let mut cfg = kube::Config::new(url.parse().with_context(|| format!("parsing cluster url {}", url))?);
        cfg.accept_invalid_certs = true;
        cfg
    } else {
        let opts = KubeConfigOptions { context: target.context.clone(), ..Default::default() };
        match target.kubeconfig.as_ref() {
            Some(path) => {
                let kc = Kubeconfig::read_from(path).with_context(|| format!("reading kubeconfig {}", path.display()))?;
                kube::Config::from_custom_kubeconfig(kc, &opts).await?
            }
            None if target.context.is_some() => kube::Config::from_kubeconfig(&opts).await?,
            None => kube::Config::infer().await?,
        }
    };
    info!(cluster = %config.cluster_url, "connecting");
    Client::try_from(config).context("building kube client")
}

/// [`ObjectStore`] over the dynamic API of one cluster.
pub struct KubeStore {
    label: String,
    client: Client,
    catalog: Arc<Catalog>,
}

impl KubeStore {
    pub fn new(label: &str, client: Client, catalog: Arc<Catalog>) -> Self {
        Self { label: label.to_string(), client, catalog }
    }

    /// Connect and run discovery.
    pub async fn open(label: &str, target: &ClusterTarget) -> Result<Self> {
        let client = connect(target).await.with_context(|| format!("connecting to {} cluster", label))?;
        let catalog = Catalog::discover(client.clone()).await.with_context(|| format!("discovery on {} cluster", label))?;
        Ok(Self::new(label, client, Arc::new(catalog)))
    }

    pub fn catalog(&self) -> Arc<Catalog> { Arc::clone(&self.catalog) }

    fn entry(&self, kind: &ObjectKind) -> Result<&CatalogEntry, StoreError> {
        self.catalog
            .lookup(kind)
            .ok_or_else(|| StoreError::msg(format!("{} is not served by the {} cluster", kind, self.label)))
    }

    fn api(&self, kind: &ObjectKind, namespace: Option<&str>) -> Result<Api<DynamicObject>, StoreError> {
        let entry = self.entry(kind)?;
        let api = match (entry.namespaced, namespace) {
            (true, Some(ns)) => Api::namespaced_with(self.client.clone(), ns, &entry.resource),
            _ => Api::all_with(self.client.clone(), &entry.resource),
        };
        Ok(api)
    }
}

impl KindResolver for KubeStore {
    fn resolve(&self, group: &str, version: &str, kind: &str) -> Result<ObjectKind, ResolutionError> {
        self.catalog.resolve(group, version, kind)
    }
}

fn key_of(namespace: Option<&str>, name: &str) -> String {
    match namespace {
        Some(ns) => format!("{}/{}", ns, name),
        None => name.to_string(),
    }
}

fn classify(kind: &ObjectKind, key: &str, e: kube::Error) -> StoreError {
    match &e {
        kube::Error::Api(resp) if resp.reason == "NotFound" || resp.code == 404 => {
            StoreError::NotFound { kind: kind.to_string(), key: key.to_string() }
        }
        kube::Error::Api(resp) if resp.reason == "AlreadyExists" => {
            StoreError::AlreadyExists { kind: kind.to_string(), key: key.to_string() }
        }
        _ => StoreError::other(e),
    }
}

#[cfg(feature = "strip-managed-fields")]
fn strip_managed_fields(v: &mut serde_json::Value) {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
        }
    }
}

/// List items and watch-restart listings arrive without `apiVersion`/`kind`;
/// those are filled in from the resource the object was read through.
fn to_object(d: &DynamicObject, ar: &ApiResource) -> Result<Object, StoreError> {
    let mut raw = serde_json::to_value(d).map_err(StoreError::other)?;
    if d.types.is_none() {
        if let Some(root) = raw.as_object_mut() {
            root.insert("apiVersion".to_string(), ar.api_version.clone().into());
            root.insert("kind".to_string(), ar.kind.clone().into());
        }
    }
    #[cfg(feature = "strip-managed-fields")]
    strip_managed_fields(&mut raw);
    Ok(Object::new(raw))
}

fn to_dynamic(o: &Object) -> Result<DynamicObject, StoreError> {
    serde_json::from_value(o.as_json().clone()).map_err(StoreError::other)
}

#[async_trait::async_trait]
impl ObjectStore for KubeStore {
    async fn list(&self, kind: &ObjectKind, namespace: Option<&str>) -> Result<Vec<Object>, StoreError> {
        let api = self.api(kind, namespace)?;
        let ar = &self.entry(kind)?.resource;
        let list = api.list(&ListParams::default()).await.map_err(|e| classify(kind, "*", e))?;
        list.items.iter().map(|d| to_object(d, ar)).collect()
    }

    async fn get(&self, kind: &ObjectKind, namespace: Option<&str>, name: &str) -> Result<Object, StoreError> {
        let api = self.api(kind, namespace)?;
        let obj = api.get(name).await.map_err(|e| classify(kind, &key_of(namespace, name), e))?;
        to_object(&obj, &self.entry(kind)?.resource)
    }

    async fn create(&self, kind: &ObjectKind, obj: &Object) -> Result<Object, StoreError> {
        let api = self.api(kind, obj.namespace())?;
        let created = api
            .create(&PostParams::default(), &to_dynamic(obj)?)
            .await
            .map_err(|e| classify(kind, &obj.key(), e))?;
        to_object(&created, &self.entry(kind)?.resource)
    }

    async fn update(&self, kind: &ObjectKind, obj: &Object) -> Result<Object, StoreError> {
        let api = self.api(kind, obj.namespace())?;
        let replaced = api
            .replace(obj.name(), &PostParams::default(), &to_dynamic(obj)?)
            .await
            .map_err(|e| classify(kind, &obj.key(), e))?;
        to_object(&replaced, &self.entry(kind)?.resource)
    }

    async fn delete(&self, kind: &ObjectKind, namespace: Option<&str>, name: &str) -> Result<(), StoreError> {
        let api = self.api(kind, namespace)?;
        api.delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| classify(kind, &key_of(namespace, name), e))
    }

    async fn watch(&self, kind: &ObjectKind) -> Result<ChangeFeed, StoreError> {
        let api = self.api(kind, None)?;
        let ar = self.entry(kind)?.resource.clone();
        let mut cache = FeedCache::new();
        let label = self.label.clone();
        let kind_label = kind.to_string();
        info!(cluster = %label, kind = %kind_label, "watcher started");
        let feed = watcher::watcher(api, watcher::Config::default())
            .default_backoff()
            .flat_map(move |res| {
                let out: Vec<Result<FeedEvent, StoreError>> = match res {
                    Ok(watcher::Event::Applied(o)) => lift(to_object(&o, &ar).map(|o| cache.applied(o))),
                    Ok(watcher::Event::Deleted(o)) => lift(to_object(&o, &ar).map(|o| cache.deleted(o))),
                    Ok(watcher::Event::Restarted(list)) => {
                        debug!(cluster = %label, kind = %kind_label, count = list.len(), "watch restart");
                        lift(list.iter().map(|d| to_object(d, &ar)).collect::<Result<Vec<_>, _>>().map(|l| cache.restarted(l)))
                    }
                    Err(e) => {
                        warn!(cluster = %label, kind = %kind_label, error = %e, "watch error; backing off");
                        vec![Err(StoreError::other(e))]
                    }
                };
                futures::stream::iter(out)
            })
            .boxed();
        Ok(feed)
    }
}

fn lift(r: Result<Vec<FeedEvent>, StoreError>) -> Vec<Result<FeedEvent, StoreError>> {
    match r {
        Ok(evs) => evs.into_iter().map(Ok).collect(),
        Err(e) => vec![Err(e)],
    }
}
