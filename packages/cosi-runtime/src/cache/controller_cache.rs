//! Controller-runtime read-through cache: a sorted local mirror of one
//! `(namespace, type)` kind, fed by consuming a `WatchKind` subscription,
//! with a bootstrap gate and teardown-context signaling a controller can
//! hang its own cancellation on.
//!
//! The bootstrap flag is grounded on `network/shutdown.rs`'s `ArcSwap`-backed
//! `HealthState` (a rarely-written, often-read state flag with lock-free
//! reads); the sorted mirror and tombstone bookkeeping generalize
//! `storage/impls/default_record_store.rs`'s in-memory index structure from a
//! single store to a per-controller cache.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use cosi_core::clock::{ClockSource, SystemClock};
use cosi_core::error::{CoreError, CoreResult};
use cosi_core::event::{tombstone_resource, EventType, Tombstone, WatchEvent};
use cosi_core::metadata::Phase;
use cosi_core::resource::{Pointer, Resource};

use crate::facade::{CallerContext, OwnedFacade};

struct CacheState {
    /// Sorted by id, per the watch-kind bootstrap contract (§4.C3).
    entries: Vec<Resource>,
    tombstones: HashMap<String, Tombstone>,
}

impl CacheState {
    fn position(&self, id: &str) -> Result<usize, usize> {
        self.entries.binary_search_by(|r| r.metadata().id().cmp(id))
    }
}

/// A read-through mirror of a resource kind, built by feeding it the events
/// of a `WatchKind` subscription via [`ControllerCache::apply`].
pub struct ControllerCache {
    namespace: String,
    type_: String,
    state: Mutex<CacheState>,
    bootstrapped: ArcSwap<bool>,
    bootstrap_notify: Notify,
    teardown_waiters: Mutex<HashMap<String, Vec<CancellationToken>>>,
}

impl ControllerCache {
    #[must_use]
    pub fn new(namespace: impl Into<String>, type_: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            type_: type_.into(),
            state: Mutex::new(CacheState {
                entries: Vec::new(),
                tombstones: HashMap::new(),
            }),
            bootstrapped: ArcSwap::from_pointee(false),
            bootstrap_notify: Notify::new(),
            teardown_waiters: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    #[must_use]
    pub fn type_(&self) -> &str {
        &self.type_
    }

    /// Whether `id` is currently present (handled) in the cache.
    #[must_use]
    pub fn is_handled(&self, id: &str) -> bool {
        let state = self.state.lock();
        state.position(id).is_ok()
    }

    /// Whether the initial `Bootstrapped` sentinel has been observed.
    #[must_use]
    pub fn is_handled_bootstrapped(&self) -> bool {
        **self.bootstrapped.load()
    }

    /// Marks the cache as having finished its initial contents replay.
    pub fn mark_bootstrapped(&self) {
        self.bootstrapped.store(Arc::new(true));
        self.bootstrap_notify.notify_waiters();
        debug!(namespace = %self.namespace, type_ = %self.type_, "cache bootstrapped");
    }

    /// Waits until [`ControllerCache::is_handled_bootstrapped`] is true.
    pub async fn wait_bootstrapped(&self) {
        loop {
            let notified = self.bootstrap_notify.notified();
            tokio::pin!(notified);
            if self.is_handled_bootstrapped() {
                return;
            }
            notified.await;
        }
    }

    /// Inserts or replaces `resource` in sorted position, clearing any
    /// tombstone recorded for the same id. If `resource` has entered
    /// `TearingDown`, also fires any [`ControllerCache::context_with_teardown`]
    /// waiters registered for it -- a resource with pending finalizers can sit
    /// in `TearingDown` for a long time before `Destroyed` ever arrives, so a
    /// waiter must not depend on [`ControllerCache::cache_remove`] alone.
    pub fn cache_put(&self, resource: Resource) {
        let id = resource.metadata().id().to_string();
        let tearing_down = resource.metadata().phase() == Phase::TearingDown;
        {
            let mut state = self.state.lock();
            state.tombstones.remove(&id);
            match state.position(&id) {
                Ok(idx) => state.entries[idx] = resource,
                Err(idx) => state.entries.insert(idx, resource),
            }
        }
        if tearing_down {
            if let Some(waiters) = self.teardown_waiters.lock().remove(&id) {
                for waiter in waiters {
                    waiter.cancel();
                }
            }
        }
    }

    /// Pushes `resource` to the back of the sorted mirror without a
    /// binary-search insert, for the pre-bootstrap replay path where the
    /// `WatchKind` initial list is already delivered in ascending id order.
    /// Clears any tombstone recorded for the same id.
    ///
    /// # Panics (debug only)
    ///
    /// Panics in debug builds if `resource`'s id does not sort after every
    /// entry already present -- callers outside the bootstrap replay path
    /// should use [`ControllerCache::cache_put`] instead.
    pub fn cache_append(&self, resource: Resource) {
        let id = resource.metadata().id().to_string();
        let mut state = self.state.lock();
        debug_assert!(
            state.entries.last().is_none_or(|last| last.metadata().id() < id.as_str()),
            "cache_append requires ascending id order"
        );
        state.tombstones.remove(&id);
        state.entries.push(resource);
    }

    /// Removes `pointer`'s resource, recording a tombstone rather than a hard
    /// delete, and fires any [`ControllerCache::context_with_teardown`]
    /// waiters registered for it.
    pub fn cache_remove(&self, pointer: &Pointer, last_known: Resource, removed_at: i64) {
        let id = pointer.id().to_string();
        {
            let mut state = self.state.lock();
            if let Ok(idx) = state.position(&id) {
                state.entries.remove(idx);
            }
            state.tombstones.insert(id.clone(), Tombstone { resource: last_known, removed_at });
        }
        if let Some(waiters) = self.teardown_waiters.lock().remove(&id) {
            for waiter in waiters {
                waiter.cancel();
            }
        }
    }

    /// Drops every recorded tombstone. A controller calls this once it has
    /// finished whatever bookkeeping the tombstones existed to support (e.g.
    /// flushing derived state for resources it no longer needs to track).
    pub fn clear_tombstones(&self) {
        self.state.lock().tombstones.clear();
    }

    #[must_use]
    pub fn get(&self, id: &str) -> CoreResult<Resource> {
        let state = self.state.lock();
        match state.position(id) {
            Ok(idx) => Ok(state.entries[idx].deep_copy()),
            Err(_) => Err(CoreError::NotFound {
                namespace: self.namespace.clone(),
                type_: self.type_.clone(),
                id: id.to_string(),
            }),
        }
    }

    #[must_use]
    pub fn list(&self) -> Vec<Resource> {
        self.state.lock().entries.iter().map(Resource::deep_copy).collect()
    }

    /// A token that cancels the moment `id` is removed or enters
    /// `TearingDown` (or immediately, if it is already tombstoned, never
    /// appeared, or is already `TearingDown`).
    #[must_use]
    pub fn context_with_teardown(&self, id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        let state = self.state.lock();
        match state.position(id) {
            Err(_) => {
                drop(state);
                token.cancel();
                return token;
            }
            Ok(idx) if state.entries[idx].metadata().phase() == Phase::TearingDown => {
                drop(state);
                token.cancel();
                return token;
            }
            Ok(_) => {}
        }
        drop(state);
        self.teardown_waiters.lock().entry(id.to_string()).or_default().push(token.clone());
        token
    }

    /// Applies one event from a `WatchKind` subscription consuming this
    /// kind's resources, updating the mirror and bootstrap gate accordingly.
    pub fn apply(&self, event: WatchEvent, now_millis: i64) {
        match event.event_type {
            EventType::Created | EventType::Updated => {
                if let Some(resource) = event.resource {
                    self.cache_put(resource);
                }
            }
            EventType::Destroyed => {
                if let Some(resource) = event.resource {
                    let pointer = resource.pointer();
                    self.cache_remove(&pointer, resource, now_millis);
                }
            }
            EventType::Bootstrapped => self.mark_bootstrapped(),
            EventType::Noop | EventType::Errored => {}
        }
    }
}

/// Adapts a [`ControllerCache`] to the same narrow read shape
/// [`crate::facade::StateFacade`] exposes, so generic controller code can be
/// written once against either a live façade or a local cache.
pub trait StateReader: Send + Sync {
    fn get(&self, id: &str) -> CoreResult<Resource>;
    fn list(&self) -> Vec<Resource>;
}

/// Wraps a shared [`ControllerCache`] and its backing [`OwnedFacade`] behind
/// one handle, so a controller can read through the cache and write through
/// the façade without juggling both separately. Writes are serialized on a
/// wrapper-wide lock, delegated to the façade, and on success reflected back
/// into the cache -- so a caller that only ever goes through `WrapState`
/// never observes its own write racing the cache's own watch-fed `apply`.
pub struct WrapState {
    cache: Arc<ControllerCache>,
    facade: OwnedFacade,
    write_lock: tokio::sync::Mutex<()>,
}

impl WrapState {
    #[must_use]
    pub fn new(cache: Arc<ControllerCache>, facade: OwnedFacade) -> Self {
        Self { cache, facade, write_lock: tokio::sync::Mutex::new(()) }
    }

    pub async fn create(
        &self,
        ctx: &CallerContext,
        namespace: &str,
        type_: &str,
        resource: Resource,
    ) -> CoreResult<Resource> {
        let _guard = self.write_lock.lock().await;
        let created = self.facade.create(ctx, namespace, type_, resource).await?;
        self.cache.cache_put(created.deep_copy());
        Ok(created)
    }

    pub async fn update(
        &self,
        ctx: &CallerContext,
        namespace: &str,
        type_: &str,
        resource: Resource,
    ) -> CoreResult<Resource> {
        let _guard = self.write_lock.lock().await;
        let updated = self.facade.update(ctx, namespace, type_, resource).await?;
        self.cache.cache_put(updated.deep_copy());
        Ok(updated)
    }

    pub async fn destroy(&self, ctx: &CallerContext, pointer: &Pointer) -> CoreResult<()> {
        let _guard = self.write_lock.lock().await;
        self.facade.destroy(ctx, pointer).await?;
        let last_known = self
            .cache
            .get(pointer.id())
            .unwrap_or_else(|_| tombstone_resource(pointer.namespace(), pointer.type_(), pointer.id()));
        self.cache.cache_remove(pointer, last_known, SystemClock.now_millis());
        Ok(())
    }
}

impl StateReader for WrapState {
    fn get(&self, id: &str) -> CoreResult<Resource> {
        self.cache.get(id)
    }

    fn list(&self) -> Vec<Resource> {
        self.cache.list()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cosi_core::metadata::Metadata;
    use cosi_core::resource::TypedSpec;

    fn demo(id: &str) -> Resource {
        Resource::new(Metadata::new("default", "T", id), Box::new(TypedSpec(())))
    }

    #[test]
    fn put_then_get_round_trips() {
        let cache = ControllerCache::new("default", "T");
        cache.cache_put(demo("b"));
        cache.cache_put(demo("a"));
        let ids: Vec<_> = cache.list().iter().map(|r| r.metadata().id().to_string()).collect();
        assert_eq!(ids, vec!["a", "b"], "stays sorted by id");
    }

    #[test]
    fn remove_installs_tombstone_not_hard_delete() {
        let cache = ControllerCache::new("default", "T");
        cache.cache_put(demo("a"));
        let ptr = Pointer::new("default", "T", "a");
        cache.cache_remove(&ptr, demo("a"), 1000);
        assert!(cache.get("a").is_err());
        assert_eq!(cache.state.lock().tombstones.len(), 1);
        cache.clear_tombstones();
        assert!(cache.state.lock().tombstones.is_empty());
    }

    #[test]
    fn re_putting_after_remove_clears_tombstone() {
        let cache = ControllerCache::new("default", "T");
        cache.cache_put(demo("a"));
        let ptr = Pointer::new("default", "T", "a");
        cache.cache_remove(&ptr, demo("a"), 1000);
        cache.cache_put(demo("a"));
        assert!(cache.get("a").is_ok());
        assert!(cache.state.lock().tombstones.is_empty());
    }

    #[test]
    fn cache_append_pushes_to_back_in_order() {
        let cache = ControllerCache::new("default", "T");
        cache.cache_append(demo("a"));
        cache.cache_append(demo("b"));
        cache.cache_append(demo("c"));
        let ids: Vec<_> = cache.list().iter().map(|r| r.metadata().id().to_string()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    #[should_panic(expected = "ascending id order")]
    fn cache_append_panics_on_out_of_order_id() {
        let cache = ControllerCache::new("default", "T");
        cache.cache_append(demo("b"));
        cache.cache_append(demo("a"));
    }

    #[test]
    fn cache_put_fires_teardown_waiters_on_entering_tearing_down() {
        let cache = ControllerCache::new("default", "T");
        cache.cache_put(demo("a"));
        let token = cache.context_with_teardown("a");
        assert!(!token.is_cancelled());

        let mut tearing_down = demo("a");
        tearing_down.metadata_mut().set_phase(Phase::TearingDown);
        cache.cache_put(tearing_down);
        assert!(token.is_cancelled(), "entering TearingDown fires the waiter even before Destroyed");
    }

    #[test]
    fn context_with_teardown_on_already_tearing_down_is_already_cancelled() {
        let cache = ControllerCache::new("default", "T");
        let mut tearing_down = demo("a");
        tearing_down.metadata_mut().set_phase(Phase::TearingDown);
        cache.cache_put(tearing_down);
        let token = cache.context_with_teardown("a");
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn wait_bootstrapped_unblocks_on_mark() {
        let cache = Arc::new(ControllerCache::new("default", "T"));
        assert!(!cache.is_handled_bootstrapped());
        let waiter = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move {
                cache.wait_bootstrapped().await;
            })
        };
        cache.mark_bootstrapped();
        waiter.await.unwrap();
        assert!(cache.is_handled_bootstrapped());
    }

    #[test]
    fn context_with_teardown_fires_on_removal() {
        let cache = ControllerCache::new("default", "T");
        cache.cache_put(demo("a"));
        let token = cache.context_with_teardown("a");
        assert!(!token.is_cancelled());
        let ptr = Pointer::new("default", "T", "a");
        cache.cache_remove(&ptr, demo("a"), 1000);
        assert!(token.is_cancelled());
    }

    #[test]
    fn context_with_teardown_on_absent_id_is_already_cancelled() {
        let cache = ControllerCache::new("default", "T");
        let token = cache.context_with_teardown("missing");
        assert!(token.is_cancelled());
    }

    #[test]
    fn apply_created_then_destroyed_events() {
        let cache = ControllerCache::new("default", "T");
        cache.apply(
            WatchEvent {
                event_type: EventType::Created,
                resource: Some(demo("a")),
                old: None,
                error: None,
                bookmark: None,
            },
            1000,
        );
        assert!(cache.is_handled("a"));

        cache.apply(
            WatchEvent {
                event_type: EventType::Destroyed,
                resource: Some(demo("a")),
                old: None,
                error: None,
                bookmark: None,
            },
            2000,
        );
        assert!(!cache.is_handled("a"));
    }

    fn owned_facade() -> OwnedFacade {
        use crate::config::RuntimeConfig;
        use crate::facade::StateFacade;
        use crate::storage::dispatcher::NamespacedDispatcher;
        StateFacade::new(Arc::new(NamespacedDispatcher::new(RuntimeConfig::default()))).owned("o1")
    }

    #[test]
    fn wrap_state_delegates_reads_to_cache() {
        let cache = Arc::new(ControllerCache::new("default", "T"));
        cache.cache_put(demo("a"));
        let wrapped = WrapState::new(Arc::clone(&cache), owned_facade());
        assert_eq!(wrapped.list().len(), 1);
        assert!(wrapped.get("a").is_ok());
    }

    #[tokio::test]
    async fn wrap_state_create_reflects_into_cache() {
        let cache = Arc::new(ControllerCache::new("default", "T"));
        let wrapped = WrapState::new(Arc::clone(&cache), owned_facade());
        let ctx = CallerContext::new();
        wrapped.create(&ctx, "default", "T", demo("a")).await.unwrap();
        assert!(cache.get("a").is_ok(), "write went through the façade and landed in the cache");
        assert!(wrapped.get("a").is_ok());
    }

    #[tokio::test]
    async fn wrap_state_destroy_reflects_into_cache_as_tombstone() {
        let cache = Arc::new(ControllerCache::new("default", "T"));
        let wrapped = WrapState::new(Arc::clone(&cache), owned_facade());
        let ctx = CallerContext::new();
        wrapped.create(&ctx, "default", "T", demo("a")).await.unwrap();
        let ptr = Pointer::new("default", "T", "a");
        wrapped.destroy(&ctx, &ptr).await.unwrap();
        assert!(wrapped.get("a").is_err());
        assert_eq!(cache.state.lock().tombstones.len(), 1);
    }
}
