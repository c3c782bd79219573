//! Storage layer: the per-collection event log, the optional backing-store
//! seam, the `ResourceCollection` itself, and the namespace-routing
//! dispatcher in front of it.

pub mod backing_store;
pub mod collection;
pub mod dispatcher;
pub mod event_log;

pub use backing_store::{BackingStore, NullBackingStore};
pub use collection::{QueryOptions, ResourceCollection, Subscription, WatchKindStart, WatchStart};
pub use dispatcher::NamespacedDispatcher;
