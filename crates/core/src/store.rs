//! The object store seam. Both the kube-backed client and the in-RAM store
//! implement [`ObjectStore`]; everything above it is written against the trait.

use crate::error::StoreError;
use crate::event::ChangeFeed;
use crate::kind::ObjectKind;
use crate::object::Object;

#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    /// List objects of a kind; `None` lists all namespaces.
    async fn list(&self, kind: &ObjectKind, namespace: Option<&str>) -> Result<Vec<Object>, StoreError>;

    async fn get(&self, kind: &ObjectKind, namespace: Option<&str>, name: &str) -> Result<Object, StoreError>;

    /// Create; the namespace is taken from the object.
    async fn create(&self, kind: &ObjectKind, obj: &Object) -> Result<Object, StoreError>;

    /// Replace the stored object of the same namespace/name.
    async fn update(&self, kind: &ObjectKind, obj: &Object) -> Result<Object, StoreError>;

    async fn delete(&self, kind: &ObjectKind, namespace: Option<&str>, name: &str) -> Result<(), StoreError>;

    /// Open an all-namespace change feed. The initial listing arrives as
    /// `Added` events followed by a single `Synced`.
    async fn watch(&self, kind: &ObjectKind) -> Result<ChangeFeed, StoreError>;
}
