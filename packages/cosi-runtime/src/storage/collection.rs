//! Per-(namespace,type) resource storage, the cyclic event buffer, and the
//! watch subscription loop.
//!
//! Grounded on `storage/impls/default_record_store.rs`'s orchestration shape
//! (a storage engine plus an observer plus a backing store, wired behind a
//! single entry point), restructured around the watch protocol design floor:
//! publish under the collection lock, deliver off a `tokio::sync::Notify`.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use cosi_core::clock::{ClockSource, SystemClock};
use cosi_core::error::{CoreError, CoreResult};
use cosi_core::event::{tombstone_resource, Bookmark, EventType, WatchEvent};
use cosi_core::metadata::{Metadata, Phase};
use cosi_core::resource::{Pointer, Resource};
use cosi_core::selector::{matches_any, IdQuery, LabelQuery};

use crate::config::RuntimeConfig;
use crate::storage::backing_store::{BackingStore, NullBackingStore};
use crate::storage::event_log::EventLog;

/// `IDQuery ∧ (disjunctive LabelQuery list)`, as used by `List` and
/// `WatchKind`.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub id_query: IdQuery,
    pub label_queries: Vec<LabelQuery>,
}

impl QueryOptions {
    #[must_use]
    pub fn matches(&self, metadata: &Metadata) -> bool {
        self.id_query.matches(metadata.id()) && matches_any(&self.label_queries, metadata)
    }
}

/// How a single-resource [`ResourceCollection::watch`] subscription should
/// be primed.
#[derive(Debug, Clone, Default)]
pub enum WatchStart {
    /// Emit one synthetic initial event (`Created` or a tombstoned
    /// `Destroyed`), then proceed live.
    #[default]
    Initial,
    /// Replay up to `n` prior events for this id, clamped to the buffer's
    /// tail window.
    TailEvents(usize),
    /// Resume strictly after a previously observed bookmark.
    FromBookmark(Bookmark),
}

/// How a [`ResourceCollection::watch_kind`] subscription should be primed.
#[derive(Debug, Clone, Default)]
pub enum WatchKindStart {
    /// No replay or bootstrap: observe only events published from now on.
    #[default]
    Live,
    /// Emit one `Created` per currently matching resource (id order), then a
    /// `Bootstrapped` sentinel, then proceed live.
    BootstrapContents,
    /// Emit a single `Noop` sentinel carrying the current write position,
    /// then proceed live.
    BootstrapBookmark,
}

struct Inner {
    storage: BTreeMap<String, Resource>,
    log: EventLog,
}

struct Shared {
    namespace: String,
    type_: String,
    state: Mutex<Inner>,
    notify: Notify,
    backing: Arc<dyn BackingStore>,
    clock: Arc<dyn ClockSource>,
}

/// Per-(namespace,type) storage, event log, and watch dispatch point.
pub struct ResourceCollection {
    shared: Arc<Shared>,
}

impl ResourceCollection {
    #[must_use]
    pub fn new(namespace: impl Into<String>, type_: impl Into<String>, config: &RuntimeConfig) -> Self {
        Self::with_backing(namespace, type_, config, Arc::new(NullBackingStore), Arc::new(SystemClock))
    }

    #[must_use]
    pub fn with_backing(
        namespace: impl Into<String>,
        type_: impl Into<String>,
        config: &RuntimeConfig,
        backing: Arc<dyn BackingStore>,
        clock: Arc<dyn ClockSource>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                namespace: namespace.into(),
                type_: type_.into(),
                state: Mutex::new(Inner {
                    storage: BTreeMap::new(),
                    log: EventLog::new(
                        config.history_initial_capacity,
                        config.history_max_capacity,
                        config.history_gap,
                    ),
                }),
                notify: Notify::new(),
                backing,
                clock,
            }),
        }
    }

    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.shared.namespace
    }

    #[must_use]
    pub fn type_(&self) -> &str {
        &self.shared.type_
    }

    /// Hydrates storage from the backing store. Intended to be called once,
    /// before the collection accepts writes.
    pub async fn bootstrap(&self) -> CoreResult<()> {
        let mut loaded = Vec::new();
        self.shared
            .backing
            .load(&mut |r| loaded.push(r))
            .await
            .map_err(CoreError::BackingStore)?;
        let count = loaded.len();
        let mut inner = self.shared.state.lock();
        for resource in loaded {
            inner.storage.insert(resource.metadata().id().to_string(), resource);
        }
        info!(namespace = %self.shared.namespace, type_ = %self.shared.type_, count, "collection bootstrapped from backing store");
        Ok(())
    }

    fn not_found(&self, id: &str) -> CoreError {
        CoreError::NotFound {
            namespace: self.shared.namespace.clone(),
            type_: self.shared.type_.clone(),
            id: id.to_string(),
        }
    }

    #[must_use]
    pub fn get(&self, id: &str) -> CoreResult<Resource> {
        let inner = self.shared.state.lock();
        inner
            .storage
            .get(id)
            .map(Resource::deep_copy)
            .ok_or_else(|| self.not_found(id))
    }

    /// Resources passing `query`, sorted by id ascending (the storage map's
    /// natural iteration order), each a deep copy.
    #[must_use]
    pub fn list(&self, query: &QueryOptions) -> Vec<Resource> {
        let inner = self.shared.state.lock();
        inner
            .storage
            .values()
            .filter(|r| query.matches(r.metadata()))
            .map(Resource::deep_copy)
            .collect()
    }

    /// Builds the metadata for a new-or-updated resource: a fresh identity
    /// template plus the caller-mutable fields (labels, annotations,
    /// finalizers) carried over from `input`.
    fn carry_mutable_fields(mut template: Metadata, input: &Resource) -> Metadata {
        *template.labels_mut() = input.metadata().labels().clone();
        *template.annotations_mut() = input.metadata().annotations().clone();
        *template.finalizers_mut() = input.metadata().finalizers().clone();
        template
    }

    pub async fn create(&self, input: Resource, owner: &str) -> CoreResult<Resource> {
        let id = input.metadata().id().to_string();
        let now = self.shared.clock.now_millis();

        let mut metadata = Self::carry_mutable_fields(
            Metadata::new(self.shared.namespace.clone(), self.shared.type_.clone(), id.clone()),
            &input,
        );
        if !metadata.claim_owner(owner) {
            return Err(CoreError::OwnerConflict {
                namespace: self.shared.namespace.clone(),
                type_: self.shared.type_.clone(),
                id,
                stored: metadata.owner().to_string(),
                requested: owner.to_string(),
            });
        }
        metadata.stamp_create(now);
        let resource = Resource::new(metadata, input.spec().deep_copy());

        {
            let inner = self.shared.state.lock();
            if inner.storage.contains_key(&id) {
                return Err(CoreError::AlreadyExists {
                    namespace: self.shared.namespace.clone(),
                    type_: self.shared.type_.clone(),
                    id,
                });
            }
        }

        // Persist before mutating in-memory state: a backing-store error
        // must never leave storage inconsistent with it.
        self.shared
            .backing
            .put(&self.shared.type_, &resource)
            .await
            .map_err(CoreError::BackingStore)?;

        let mut inner = self.shared.state.lock();
        if inner.storage.contains_key(&id) {
            return Err(CoreError::AlreadyExists {
                namespace: self.shared.namespace.clone(),
                type_: self.shared.type_.clone(),
                id,
            });
        }
        inner.storage.insert(id.clone(), resource.deep_copy());
        inner.log.publish(WatchEvent {
            event_type: EventType::Created,
            resource: Some(resource.deep_copy()),
            old: None,
            error: None,
            bookmark: None,
        });
        drop(inner);
        self.shared.notify.notify_waiters();
        debug!(namespace = %self.shared.namespace, type_ = %self.shared.type_, id, "created");
        Ok(resource)
    }

    pub async fn update(
        &self,
        input: Resource,
        owner: &str,
        expected_phase: Option<Phase>,
    ) -> CoreResult<Resource> {
        let id = input.metadata().id().to_string();
        let now = self.shared.clock.now_millis();
        let expected_phase = expected_phase.unwrap_or(Phase::Running);

        let stored = {
            let inner = self.shared.state.lock();
            inner.storage.get(&id).map(Resource::deep_copy).ok_or_else(|| self.not_found(&id))?
        };

        if stored.metadata().owner() != owner {
            return Err(CoreError::OwnerConflict {
                namespace: self.shared.namespace.clone(),
                type_: self.shared.type_.clone(),
                id,
                stored: stored.metadata().owner().to_string(),
                requested: owner.to_string(),
            });
        }
        if input.metadata().version() != stored.metadata().version() {
            return Err(CoreError::VersionConflict {
                namespace: self.shared.namespace.clone(),
                type_: self.shared.type_.clone(),
                id,
                expected: input.metadata().version(),
                stored: stored.metadata().version(),
            });
        }
        if stored.metadata().phase() != expected_phase {
            return Err(CoreError::PhaseConflict {
                namespace: self.shared.namespace.clone(),
                type_: self.shared.type_.clone(),
                id,
                expected: expected_phase,
                stored: stored.metadata().phase(),
            });
        }

        let mut metadata = Self::carry_mutable_fields(stored.metadata().clone(), &input);
        metadata.stamp_update(now);
        let new_resource = Resource::new(metadata, input.spec().deep_copy());

        self.shared
            .backing
            .put(&self.shared.type_, &new_resource)
            .await
            .map_err(CoreError::BackingStore)?;

        let mut inner = self.shared.state.lock();
        let current = inner.storage.get(&id).map(Resource::deep_copy).ok_or_else(|| self.not_found(&id))?;
        if current.metadata().version() != stored.metadata().version() {
            return Err(CoreError::VersionConflict {
                namespace: self.shared.namespace.clone(),
                type_: self.shared.type_.clone(),
                id,
                expected: input.metadata().version(),
                stored: current.metadata().version(),
            });
        }
        inner.storage.insert(id.clone(), new_resource.deep_copy());
        inner.log.publish(WatchEvent {
            event_type: EventType::Updated,
            resource: Some(new_resource.deep_copy()),
            old: Some(stored),
            error: None,
            bookmark: None,
        });
        drop(inner);
        self.shared.notify.notify_waiters();
        debug!(namespace = %self.shared.namespace, type_ = %self.shared.type_, id, "updated");
        Ok(new_resource)
    }

    pub async fn destroy(&self, pointer: &Pointer, owner: &str) -> CoreResult<()> {
        let id = pointer.id().to_string();
        let stored = {
            let inner = self.shared.state.lock();
            inner.storage.get(&id).map(Resource::deep_copy).ok_or_else(|| self.not_found(&id))?
        };

        if stored.metadata().owner() != owner {
            return Err(CoreError::OwnerConflict {
                namespace: self.shared.namespace.clone(),
                type_: self.shared.type_.clone(),
                id,
                stored: stored.metadata().owner().to_string(),
                requested: owner.to_string(),
            });
        }
        if !stored.metadata().finalizers().is_empty() {
            return Err(CoreError::PendingFinalizers {
                namespace: self.shared.namespace.clone(),
                type_: self.shared.type_.clone(),
                id,
                finalizers: stored.metadata().finalizers().as_slice().to_vec(),
            });
        }

        self.shared
            .backing
            .destroy(&self.shared.type_, pointer)
            .await
            .map_err(CoreError::BackingStore)?;

        let mut inner = self.shared.state.lock();
        inner.storage.remove(&id);
        inner.log.publish(WatchEvent {
            event_type: EventType::Destroyed,
            resource: Some(stored),
            old: None,
            error: None,
            bookmark: None,
        });
        drop(inner);
        self.shared.notify.notify_waiters();
        debug!(namespace = %self.shared.namespace, type_ = %self.shared.type_, id = %pointer.id(), "destroyed");
        Ok(())
    }

    /// Adds `finalizer`; a no-op on content (still owner-checked and
    /// version-bumped, still publishes `Updated`) if already present.
    pub async fn add_finalizer(&self, id: &str, finalizer: &str, owner: &str) -> CoreResult<Resource> {
        self.mutate_finalizers(id, owner, |f| {
            f.add(finalizer);
        })
        .await
    }

    /// Removes `finalizer`; a no-op on content if absent.
    pub async fn remove_finalizer(&self, id: &str, finalizer: &str, owner: &str) -> CoreResult<Resource> {
        self.mutate_finalizers(id, owner, |f| {
            f.remove(finalizer);
        })
        .await
    }

    async fn mutate_finalizers(
        &self,
        id: &str,
        owner: &str,
        edit: impl FnOnce(&mut cosi_core::metadata::FinalizerSet),
    ) -> CoreResult<Resource> {
        let now = self.shared.clock.now_millis();
        let stored = self.get(id)?;
        if stored.metadata().owner() != owner {
            return Err(CoreError::OwnerConflict {
                namespace: self.shared.namespace.clone(),
                type_: self.shared.type_.clone(),
                id: id.to_string(),
                stored: stored.metadata().owner().to_string(),
                requested: owner.to_string(),
            });
        }

        let mut new_resource = stored.deep_copy();
        edit(new_resource.metadata_mut().finalizers_mut());
        new_resource.metadata_mut().stamp_update(now);

        self.shared
            .backing
            .put(&self.shared.type_, &new_resource)
            .await
            .map_err(CoreError::BackingStore)?;

        let mut inner = self.shared.state.lock();
        inner.storage.insert(id.to_string(), new_resource.deep_copy());
        inner.log.publish(WatchEvent {
            event_type: EventType::Updated,
            resource: Some(new_resource.deep_copy()),
            old: Some(stored),
            error: None,
            bookmark: None,
        });
        drop(inner);
        self.shared.notify.notify_waiters();
        Ok(new_resource)
    }

    /// Transitions `Running -> TearingDown` if needed, and returns whether
    /// the resource is now ready to `destroy` (`TearingDown` and no pending
    /// finalizers).
    pub async fn teardown(&self, pointer: &Pointer, owner: &str) -> CoreResult<bool> {
        let now = self.shared.clock.now_millis();
        let stored = self.get(pointer.id())?;
        if stored.metadata().owner() != owner {
            return Err(CoreError::OwnerConflict {
                namespace: self.shared.namespace.clone(),
                type_: self.shared.type_.clone(),
                id: pointer.id().to_string(),
                stored: stored.metadata().owner().to_string(),
                requested: owner.to_string(),
            });
        }

        if stored.metadata().phase() == Phase::TearingDown {
            return Ok(stored.metadata().finalizers().is_empty());
        }

        let mut new_resource = stored.deep_copy();
        new_resource.metadata_mut().set_phase(Phase::TearingDown);
        new_resource.metadata_mut().stamp_update(now);

        self.shared
            .backing
            .put(&self.shared.type_, &new_resource)
            .await
            .map_err(CoreError::BackingStore)?;

        let ready = new_resource.metadata().finalizers().is_empty();
        let mut inner = self.shared.state.lock();
        inner
            .storage
            .insert(pointer.id().to_string(), new_resource.deep_copy());
        inner.log.publish(WatchEvent {
            event_type: EventType::Updated,
            resource: Some(new_resource),
            old: Some(stored),
            error: None,
            bookmark: None,
        });
        drop(inner);
        self.shared.notify.notify_waiters();
        info!(namespace = %self.shared.namespace, type_ = %self.shared.type_, id = %pointer.id(), "tearing down");
        Ok(ready)
    }

    /// Opens a single-resource watch.
    pub fn watch(&self, id: &str, start: WatchStart) -> CoreResult<Subscription> {
        let inner = self.shared.state.lock();
        let mut preloaded = VecDeque::new();
        let pos = match start {
            WatchStart::Initial => {
                match inner.storage.get(id) {
                    Some(r) => preloaded.push_back(WatchEvent {
                        event_type: EventType::Created,
                        resource: Some(r.deep_copy()),
                        old: None,
                        error: None,
                        bookmark: None,
                    }),
                    None => preloaded.push_back(WatchEvent {
                        event_type: EventType::Destroyed,
                        resource: Some(tombstone_resource(&self.shared.namespace, &self.shared.type_, id)),
                        old: None,
                        error: None,
                        bookmark: None,
                    }),
                }
                inner.log.write_pos()
            }
            WatchStart::TailEvents(n) => inner.log.tail_start(n),
            WatchStart::FromBookmark(bookmark) => inner
                .log
                .resume_position(bookmark)
                .map_err(|_| CoreError::InvalidWatchBookmark)?,
        };
        Ok(Subscription {
            shared: Arc::clone(&self.shared),
            pos,
            cancel: CancellationToken::new(),
            filter: SubscriptionFilter::SingleId(id.to_string()),
            aggregated: false,
            preloaded,
            closed: false,
        })
    }

    /// Opens a selector-filtered watch over every resource of this kind.
    pub fn watch_kind(
        &self,
        query: QueryOptions,
        start: WatchKindStart,
        aggregated: bool,
    ) -> Subscription {
        let inner = self.shared.state.lock();
        let mut preloaded = VecDeque::new();
        let pos = match start {
            WatchKindStart::Live => inner.log.write_pos(),
            WatchKindStart::BootstrapContents => {
                let snapshot_pos = inner.log.write_pos();
                let mut matching: Vec<&Resource> =
                    inner.storage.values().filter(|r| query.matches(r.metadata())).collect();
                matching.sort_by(|a, b| a.metadata().id().cmp(b.metadata().id()));
                for r in matching {
                    preloaded.push_back(WatchEvent {
                        event_type: EventType::Created,
                        resource: Some(r.deep_copy()),
                        old: None,
                        error: None,
                        bookmark: None,
                    });
                }
                preloaded.push_back(WatchEvent {
                    event_type: EventType::Bootstrapped,
                    resource: None,
                    old: None,
                    error: None,
                    bookmark: Some(inner.log.bookmark_at(snapshot_pos)),
                });
                snapshot_pos
            }
            WatchKindStart::BootstrapBookmark => {
                let snapshot_pos = inner.log.write_pos();
                preloaded.push_back(WatchEvent {
                    event_type: EventType::Noop,
                    resource: None,
                    old: None,
                    error: None,
                    bookmark: Some(inner.log.bookmark_at(snapshot_pos)),
                });
                snapshot_pos
            }
        };
        Subscription {
            shared: Arc::clone(&self.shared),
            pos,
            cancel: CancellationToken::new(),
            filter: SubscriptionFilter::Kind(query),
            aggregated,
            preloaded,
            closed: false,
        }
    }
}

enum SubscriptionFilter {
    SingleId(String),
    Kind(QueryOptions),
}

/// An open watch stream. Pull-based: call [`Subscription::next_batch`] in a
/// loop.
pub struct Subscription {
    shared: Arc<Shared>,
    pos: u64,
    cancel: CancellationToken,
    filter: SubscriptionFilter,
    aggregated: bool,
    preloaded: VecDeque<WatchEvent>,
    closed: bool,
}

impl Subscription {
    /// The cancellation signal this subscription will observe. Firing it
    /// causes the next (or in-flight) [`next_batch`](Self::next_batch) call
    /// to return an empty batch and close the stream.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Waits for and returns the next batch of events. An empty, non-error
    /// result after the stream has delivered a terminal `Errored` event (or
    /// after cancellation) means the stream is closed; callers should stop
    /// polling.
    pub async fn next_batch(&mut self) -> Vec<WatchEvent> {
        if self.closed {
            return Vec::new();
        }

        if !self.preloaded.is_empty() {
            return self.drain_ready();
        }

        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);

            {
                let inner = self.shared.state.lock();
                if inner.log.write_pos() != self.pos {
                    break;
                }
            }
            if self.cancel.is_cancelled() {
                self.closed = true;
                return Vec::new();
            }

            tokio::select! {
                () = &mut notified => {}
                () = self.cancel.cancelled() => {
                    self.closed = true;
                    return Vec::new();
                }
            }
        }

        let raw = {
            let inner = self.shared.state.lock();
            inner.log.pending_since(self.pos)
        };
        let raw = match raw {
            Ok(events) => events,
            Err(_overrun) => {
                warn!(pos = self.pos, "watch subscription overran the event buffer");
                self.closed = true;
                return vec![WatchEvent::errored("buffer overrun")];
            }
        };

        for event in raw {
            if let Some(bookmark) = event.bookmark {
                self.pos = self.pos.max(bookmark.position() + 1);
            }
            if let Some(filtered) = self.apply_filter(event) {
                self.preloaded.push_back(filtered);
            }
        }
        self.drain_ready()
    }

    fn drain_ready(&mut self) -> Vec<WatchEvent> {
        if self.aggregated {
            self.preloaded.drain(..).collect()
        } else {
            self.preloaded.pop_front().into_iter().collect()
        }
    }

    fn apply_filter(&self, event: WatchEvent) -> Option<WatchEvent> {
        match &self.filter {
            SubscriptionFilter::SingleId(id) => {
                let belongs = event
                    .resource
                    .as_ref()
                    .map(|r| r.metadata().id() == id)
                    .or_else(|| event.old.as_ref().map(|r| r.metadata().id() == id))
                    .unwrap_or(true);
                belongs.then_some(event)
            }
            SubscriptionFilter::Kind(query) => transition_for_kind(query, event),
        }
    }
}

/// Applies the selector-transition semantics of a filtered `WatchKind`
/// subscription to one raw collection event.
fn transition_for_kind(query: &QueryOptions, event: WatchEvent) -> Option<WatchEvent> {
    match event.event_type {
        EventType::Updated => {
            let old_matches = event.old.as_ref().is_some_and(|r| query.matches(r.metadata()));
            let new_matches = event.resource.as_ref().is_some_and(|r| query.matches(r.metadata()));
            match (old_matches, new_matches) {
                (true, true) => Some(event),
                (true, false) => Some(WatchEvent {
                    event_type: EventType::Destroyed,
                    resource: event.resource,
                    old: None,
                    error: None,
                    bookmark: event.bookmark,
                }),
                (false, true) => Some(WatchEvent {
                    event_type: EventType::Created,
                    resource: event.resource,
                    old: None,
                    error: None,
                    bookmark: event.bookmark,
                }),
                (false, false) => None,
            }
        }
        EventType::Created | EventType::Destroyed => {
            let matches = event.resource.as_ref().is_some_and(|r| query.matches(r.metadata()));
            matches.then_some(event)
        }
        EventType::Bootstrapped | EventType::Noop | EventType::Errored => Some(event),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cosi_core::resource::TypedSpec;
    use cosi_core::selector::LabelTerm;

    fn demo_resource(id: &str) -> Resource {
        Resource::new(
            Metadata::new("default", "T", id),
            Box::new(TypedSpec(serde_json::json!({"n": 1}))),
        )
    }

    fn collection() -> ResourceCollection {
        ResourceCollection::new("default", "T", &RuntimeConfig::default())
    }

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let c = collection();
        let created = c.create(demo_resource("x"), "o1").await.unwrap();
        assert_eq!(created.metadata().version(), cosi_core::version::Version::Number(1));
        let fetched = c.get("x").unwrap();
        assert_eq!(fetched.metadata().owner(), "o1");
    }

    #[tokio::test]
    async fn create_duplicate_id_fails() {
        let c = collection();
        c.create(demo_resource("x"), "o1").await.unwrap();
        let err = c.create(demo_resource("x"), "o1").await.unwrap_err();
        assert_eq!(err.kind(), cosi_core::error::ErrorKind::AlreadyExists);
    }

    #[tokio::test]
    async fn update_requires_matching_version() {
        let c = collection();
        let created = c.create(demo_resource("x"), "o1").await.unwrap();
        let err = c.update(demo_resource("x"), "o1", None).await.unwrap_err();
        assert_eq!(err.kind(), cosi_core::error::ErrorKind::VersionConflict);

        let updated = c.update(created, "o1", None).await.unwrap();
        assert_eq!(updated.metadata().version(), cosi_core::version::Version::Number(2));
    }

    #[tokio::test]
    async fn update_with_wrong_owner_conflicts() {
        let c = collection();
        let created = c.create(demo_resource("x"), "o1").await.unwrap();
        let err = c.update(created, "o2", None).await.unwrap_err();
        assert_eq!(err.kind(), cosi_core::error::ErrorKind::OwnerConflict);
    }

    #[tokio::test]
    async fn destroy_fails_with_pending_finalizers() {
        let c = collection();
        c.create(demo_resource("x"), "o1").await.unwrap();
        c.add_finalizer("x", "fA", "o1").await.unwrap();
        let ptr = Pointer::new("default", "T", "x");
        let err = c.destroy(&ptr, "o1").await.unwrap_err();
        assert_eq!(err.kind(), cosi_core::error::ErrorKind::PendingFinalizers);

        c.remove_finalizer("x", "fA", "o1").await.unwrap();
        c.destroy(&ptr, "o1").await.unwrap();
        assert_eq!(c.get("x").unwrap_err().kind(), cosi_core::error::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn teardown_is_one_way_and_reports_readiness() {
        let c = collection();
        c.create(demo_resource("x"), "o1").await.unwrap();
        c.add_finalizer("x", "fA", "o1").await.unwrap();
        let ptr = Pointer::new("default", "T", "x");

        let ready = c.teardown(&ptr, "o1").await.unwrap();
        assert!(!ready, "finalizer still pending");
        assert_eq!(c.get("x").unwrap().metadata().phase(), Phase::TearingDown);

        c.remove_finalizer("x", "fA", "o1").await.unwrap();
        let ready_after = c.teardown(&ptr, "o1").await.unwrap();
        assert!(ready_after);
    }

    #[tokio::test]
    async fn happy_path_end_to_end() {
        let c = collection();
        c.create(demo_resource("x"), "o1").await.unwrap();
        let g = c.get("x").unwrap();
        assert_eq!(g.metadata().version(), cosi_core::version::Version::Number(1));

        let updated = c.update(g, "o1", None).await.unwrap();
        assert_eq!(updated.metadata().version(), cosi_core::version::Version::Number(2));

        c.add_finalizer("x", "fA", "o1").await.unwrap();
        let ptr = Pointer::new("default", "T", "x");
        assert!(c.destroy(&ptr, "o1").await.is_err());

        c.remove_finalizer("x", "fA", "o1").await.unwrap();
        assert!(c.teardown(&ptr, "o1").await.unwrap());
        c.destroy(&ptr, "o1").await.unwrap();
        assert!(c.get("x").is_err());
    }

    #[tokio::test]
    async fn watch_kind_bootstrap_then_resume_from_bookmark() {
        let c = collection();
        for id in ["1", "2", "3"] {
            c.create(demo_resource(id), "o1").await.unwrap();
        }

        let mut sub = c.watch_kind(QueryOptions::default(), WatchKindStart::BootstrapContents, false);
        let mut seen = Vec::new();
        let mut bookmark = None;
        for _ in 0..4 {
            let batch = sub.next_batch().await;
            for event in batch {
                if event.event_type == EventType::Bootstrapped {
                    bookmark = event.bookmark;
                } else {
                    seen.push(event.resource.unwrap().metadata().id().to_string());
                }
            }
        }
        assert_eq!(seen, vec!["1", "2", "3"]);
        let bookmark = bookmark.expect("bootstrapped sentinel observed");
        drop(sub);

        c.create(demo_resource("4"), "o1").await.unwrap();

        // A fresh subscription resuming from the bootstrap bookmark should
        // observe only what happened after it: resource "4" being created.
        let resume_pos = {
            let inner = c.shared.state.lock();
            inner.log.resume_position(bookmark).unwrap()
        };
        let mut resumed = Subscription {
            shared: Arc::clone(&c.shared),
            pos: resume_pos,
            cancel: CancellationToken::new(),
            filter: SubscriptionFilter::Kind(QueryOptions::default()),
            aggregated: false,
            preloaded: VecDeque::new(),
            closed: false,
        };
        let batch = resumed.next_batch().await;
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].resource.as_ref().unwrap().metadata().id(), "4");
    }

    #[tokio::test]
    async fn selector_synthetic_events_on_label_transition() {
        let c = collection();
        let mut r = demo_resource("x");
        r.metadata_mut().labels_mut().set("common", "app");
        c.create(r, "o1").await.unwrap();

        let query = QueryOptions {
            id_query: IdQuery::any(),
            label_queries: vec![LabelQuery::new(vec![LabelTerm::exists("common")])],
        };
        let mut sub = c.watch_kind(query, WatchKindStart::Live, false);

        let stored = c.get("x").unwrap();
        let mut without_label = stored.deep_copy();
        without_label.metadata_mut().labels_mut().delete("common");
        c.update(without_label, "o1", None).await.unwrap();

        let batch = sub.next_batch().await;
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].event_type, EventType::Destroyed);
        assert!(batch[0].old.is_none());
    }

    #[tokio::test]
    async fn buffer_overrun_closes_stream() {
        let mut config = RuntimeConfig::default();
        config.history_initial_capacity = 2;
        config.history_max_capacity = 2;
        config.history_gap = 0;
        let c = ResourceCollection::new("default", "T", &config);

        let mut sub = c.watch_kind(QueryOptions::default(), WatchKindStart::Live, false);
        for i in 0..5 {
            c.create(demo_resource(&i.to_string()), "o1").await.unwrap();
        }

        let mut overran = false;
        for _ in 0..5 {
            let batch = sub.next_batch().await;
            if batch.iter().any(|e| e.event_type == EventType::Errored) {
                overran = true;
                break;
            }
        }
        assert!(overran);
    }

    #[tokio::test]
    async fn cancellation_closes_the_stream() {
        let c = collection();
        let sub = c.watch_kind(QueryOptions::default(), WatchKindStart::Live, false);
        let token = sub.cancellation_token();
        let mut sub = sub;
        token.cancel();
        let batch = sub.next_batch().await;
        assert!(batch.is_empty());
    }
}
