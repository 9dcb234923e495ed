//! Kopy core types: objects, kinds, events and the store seam.

#![forbid(unsafe_code)]

pub mod error;
pub mod event;
pub mod kind;
pub mod object;
pub mod store;

pub use error::{Error, ResolutionError, Result, StoreError};
pub use event::{ChangeFeed, Event, FeedEvent, Operation};
pub use kind::{sync_order, KindResolver, ObjectKind, StaticResolver, SYNC_ORDER};
pub use object::Object;
pub use store::ObjectStore;

pub mod prelude {
    pub use super::{
        ChangeFeed, Error, Event, FeedEvent, KindResolver, Object, ObjectKind, ObjectStore, Operation,
        ResolutionError, StaticResolver, StoreError, SYNC_ORDER,
    };
}
