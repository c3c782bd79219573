//! Namespace-routing dispatcher: lazily creates and caches one
//! [`ResourceCollection`] per `(namespace, type)` pair.
//!
//! Grounded on `storage/factory.rs`'s `RecordStoreFactory` (lazy,
//! concurrency-safe construction of one storage engine per key, cached behind
//! a concurrent map) generalized from a single global store to one per
//! `(namespace, type)`.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::debug;

use cosi_core::clock::{ClockSource, SystemClock};

use crate::config::RuntimeConfig;
use crate::storage::backing_store::{BackingStore, NullBackingStore};
use crate::storage::collection::ResourceCollection;

/// Builds the [`BackingStore`] a newly created collection should use,
/// keyed by `(namespace, type)`. The default factory hands out
/// [`NullBackingStore`] for every key.
pub trait BackingFactory: Send + Sync {
    fn build(&self, namespace: &str, type_: &str) -> Arc<dyn BackingStore>;
}

/// The default [`BackingFactory`]: every collection gets a [`NullBackingStore`].
#[derive(Debug, Clone, Copy, Default)]
pub struct NullBackingFactory;

impl BackingFactory for NullBackingFactory {
    fn build(&self, _namespace: &str, _type_: &str) -> Arc<dyn BackingStore> {
        Arc::new(NullBackingStore)
    }
}

/// Routes `(namespace, type)` to its [`ResourceCollection`], creating and
/// bootstrapping one on first access.
///
/// Construction of a given key happens at most once even under concurrent
/// access: `dashmap`'s entry API serializes the miss path per shard, so two
/// callers racing to touch a brand-new `(namespace, type)` never build two
/// collections and silently drop one.
pub struct NamespacedDispatcher {
    config: RuntimeConfig,
    backing_factory: Arc<dyn BackingFactory>,
    clock: Arc<dyn ClockSource>,
    collections: DashMap<(String, String), Arc<ResourceCollection>>,
}

impl NamespacedDispatcher {
    #[must_use]
    pub fn new(config: RuntimeConfig) -> Self {
        Self::with_backing_factory(config, Arc::new(NullBackingFactory))
    }

    #[must_use]
    pub fn with_backing_factory(config: RuntimeConfig, backing_factory: Arc<dyn BackingFactory>) -> Self {
        Self {
            config,
            backing_factory,
            clock: Arc::new(SystemClock),
            collections: DashMap::new(),
        }
    }

    /// Returns the collection for `(namespace, type)`, creating it (but not
    /// bootstrapping it) if this is the first request for that key.
    ///
    /// Bootstrapping a freshly created collection is the caller's
    /// responsibility (via [`ResourceCollection::bootstrap`]) since it is
    /// async and this lookup is not; the lazily-created-but-not-yet-bootstrapped
    /// window is intentional and matches how a controller typically warms a
    /// kind it is about to reconcile.
    pub fn collection(&self, namespace: &str, type_: &str) -> Arc<ResourceCollection> {
        let key = (namespace.to_string(), type_.to_string());
        match self.collections.entry(key) {
            Entry::Occupied(existing) => Arc::clone(existing.get()),
            Entry::Vacant(slot) => {
                let backing = self.backing_factory.build(namespace, type_);
                let created = Arc::new(ResourceCollection::with_backing(
                    namespace,
                    type_,
                    &self.config,
                    backing,
                    Arc::clone(&self.clock),
                ));
                debug!(namespace, type_, "lazily created collection");
                slot.insert(Arc::clone(&created));
                created
            }
        }
    }

    /// The `(namespace, type)` pairs with a collection already materialized.
    #[must_use]
    pub fn known_kinds(&self) -> Vec<(String, String)> {
        self.collections.iter().map(|entry| entry.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cosi_core::metadata::Metadata;
    use cosi_core::resource::{Resource, TypedSpec};

    fn dispatcher() -> NamespacedDispatcher {
        NamespacedDispatcher::new(RuntimeConfig::default())
    }

    #[test]
    fn same_key_returns_same_collection() {
        let d = dispatcher();
        let a = d.collection("default", "T");
        let b = d.collection("default", "T");
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn different_namespaces_are_isolated() {
        let d = dispatcher();
        let a = d.collection("ns-a", "T");
        let b = d.collection("ns-b", "T");
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn routed_collection_is_independently_usable() {
        let d = dispatcher();
        let c = d.collection("default", "T");
        let resource = Resource::new(Metadata::new("default", "T", "x"), Box::new(TypedSpec(())));
        c.create(resource, "o1").await.unwrap();
        assert!(d.collection("default", "T").get("x").is_ok());
    }

    #[test]
    fn known_kinds_reports_materialized_collections() {
        let d = dispatcher();
        d.collection("default", "T");
        d.collection("default", "U");
        let mut kinds = d.known_kinds();
        kinds.sort();
        assert_eq!(
            kinds,
            vec![
                ("default".to_string(), "T".to_string()),
                ("default".to_string(), "U".to_string())
            ]
        );
    }
}
