//! The optional persistent backing-store adapter seam.
//!
//! Grounded on `storage/map_data_store.rs`'s `MapDataStore` trait (object
//! seam returning `anyhow::Result`, used as `Arc<dyn BackingStore>`) and
//! `storage/datastores/null.rs`'s `NullDataStore`, trimmed to the three
//! verbs this system actually needs: `Load`, `Put`, `Destroy`.

use async_trait::async_trait;
use cosi_core::resource::{Pointer, Resource};

/// A hook a collection may call to hydrate itself at startup and to persist
/// mutations as they happen. No ordering guarantee is made beyond call order
/// within a single collection; durability is entirely delegated to the
/// implementation.
#[async_trait]
pub trait BackingStore: Send + Sync {
    /// Hydrates storage before a collection accepts writes. Each loaded
    /// resource is passed to `handler`, which the collection uses to append
    /// it while preserving whatever sort invariants its caches require.
    async fn load(&self, handler: &mut dyn FnMut(Resource)) -> anyhow::Result<()>;

    /// Persists a created or updated resource. Called under the owning
    /// collection's lock; an error aborts the in-memory mutation.
    async fn put(&self, type_: &str, resource: &Resource) -> anyhow::Result<()>;

    /// Persists a resource's removal. Called under the owning collection's
    /// lock; an error aborts the in-memory mutation.
    async fn destroy(&self, type_: &str, pointer: &Pointer) -> anyhow::Result<()>;
}

/// A backing store that does nothing: `load` yields no resources, `put` and
/// `destroy` always succeed. The default for a collection with no
/// configured persistence.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullBackingStore;

#[async_trait]
impl BackingStore for NullBackingStore {
    async fn load(&self, _handler: &mut dyn FnMut(Resource)) -> anyhow::Result<()> {
        Ok(())
    }

    async fn put(&self, _type_: &str, _resource: &Resource) -> anyhow::Result<()> {
        Ok(())
    }

    async fn destroy(&self, _type_: &str, _pointer: &Pointer) -> anyhow::Result<()> {
        Ok(())
    }
}
