//! The narrow, owner-scoped façade collaborators are handed instead of a raw
//! [`ResourceCollection`] or [`NamespacedDispatcher`].
//!
//! `CallerContext` is grounded on `ProcessorContext`/`RequestContext` as
//! threaded through `topgun-core`/`topgun-server`'s request-handling paths: a
//! small, cheaply cloned value carrying an optional cancellation signal that
//! every blocking verb honors uniformly.

use std::future::Future;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use cosi_core::error::{CoreError, CoreResult};
use cosi_core::event::EventType;
use cosi_core::metadata::Phase;
use cosi_core::resource::{Pointer, Resource};

use crate::storage::collection::{QueryOptions, Subscription, WatchKindStart, WatchStart};
use crate::storage::dispatcher::NamespacedDispatcher;

/// Cancellation context threaded through every façade verb.
#[derive(Debug, Clone, Default)]
pub struct CallerContext {
    cancel: Option<CancellationToken>,
}

impl CallerContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_cancellation(token: CancellationToken) -> Self {
        Self { cancel: Some(token) }
    }

    #[must_use]
    pub fn cancellation_token(&self) -> Option<&CancellationToken> {
        self.cancel.as_ref()
    }

    async fn run<T>(&self, fut: impl Future<Output = CoreResult<T>>) -> CoreResult<T> {
        match &self.cancel {
            None => fut.await,
            Some(token) if token.is_cancelled() => Err(CoreError::Cancelled),
            Some(token) => {
                tokio::select! {
                    result = fut => result,
                    () = token.cancelled() => Err(CoreError::Cancelled),
                }
            }
        }
    }
}

/// Controls whether [`OwnedFacade::teardown_and_destroy`] blocks until a
/// resource's finalizer set empties. The default blocks, matching the
/// protocol's default behavior; `no_blocking()` returns `(false, Ok)`
/// immediately instead whenever finalizers are still pending.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TeardownAndDestroyOptions {
    no_blocking: bool,
}

impl TeardownAndDestroyOptions {
    #[must_use]
    pub fn no_blocking() -> Self {
        Self { no_blocking: true }
    }
}

/// Matches events whose type is one of `types` -- one of the three named
/// `WatchFor` predicate combinators.
#[must_use]
pub fn with_event_types(types: &'static [EventType]) -> impl Fn(EventType, Option<&Resource>) -> bool {
    move |event_type, _resource| types.contains(&event_type)
}

/// Matches once the resource's finalizer set is empty, or the resource is
/// absent (which trivially has none) -- one of the three named `WatchFor`
/// predicate combinators.
#[must_use]
pub fn with_finalizer_empty() -> impl Fn(EventType, Option<&Resource>) -> bool {
    |_event_type, resource| resource.is_none_or(|r| r.metadata().finalizers().is_empty())
}

/// Matches once the resource's phase is one of `phases` -- one of the three
/// named `WatchFor` predicate combinators. Never matches on absence.
#[must_use]
pub fn with_phases(phases: &'static [Phase]) -> impl Fn(EventType, Option<&Resource>) -> bool {
    move |_event_type, resource| resource.is_some_and(|r| phases.contains(&r.metadata().phase()))
}

/// The read side of the state model: every verb that needs no owner.
pub struct StateFacade {
    dispatcher: Arc<NamespacedDispatcher>,
}

impl StateFacade {
    #[must_use]
    pub fn new(dispatcher: Arc<NamespacedDispatcher>) -> Self {
        Self { dispatcher }
    }

    /// Scopes this façade to a specific owner for the mutating verbs.
    #[must_use]
    pub fn owned(&self, owner: impl Into<String>) -> OwnedFacade {
        OwnedFacade {
            dispatcher: Arc::clone(&self.dispatcher),
            owner: owner.into(),
        }
    }

    #[must_use]
    pub fn get(&self, namespace: &str, type_: &str, id: &str) -> CoreResult<Resource> {
        self.dispatcher.collection(namespace, type_).get(id)
    }

    #[must_use]
    pub fn list(&self, namespace: &str, type_: &str, query: &QueryOptions) -> Vec<Resource> {
        self.dispatcher.collection(namespace, type_).list(query)
    }

    pub fn watch(&self, namespace: &str, type_: &str, id: &str, start: WatchStart) -> CoreResult<Subscription> {
        self.dispatcher.collection(namespace, type_).watch(id, start)
    }

    #[must_use]
    pub fn watch_kind(
        &self,
        namespace: &str,
        type_: &str,
        query: QueryOptions,
        start: WatchKindStart,
    ) -> Subscription {
        self.dispatcher.collection(namespace, type_).watch_kind(query, start, false)
    }

    /// As [`StateFacade::watch_kind`], but batches deliver every ready event
    /// at once instead of one at a time.
    #[must_use]
    pub fn watch_kind_aggregated(
        &self,
        namespace: &str,
        type_: &str,
        query: QueryOptions,
        start: WatchKindStart,
    ) -> Subscription {
        self.dispatcher.collection(namespace, type_).watch_kind(query, start, true)
    }

    /// Waits until `predicate` holds for an event delivered on `pointer` (or
    /// for its absence, observed via a tombstoned `Destroyed`), delivering
    /// the matching resource snapshot (`None` if it was absence that
    /// satisfied the predicate). `predicate` sees both the event's type and
    /// the resource snapshot, so it can distinguish a `Bootstrapped`/`Noop`
    /// tick from an actual `Created`/`Updated` change -- see
    /// [`with_event_types`], [`with_finalizer_empty`], and [`with_phases`]
    /// for the combinators the protocol names.
    pub async fn watch_for(
        &self,
        ctx: &CallerContext,
        pointer: &Pointer,
        predicate: impl Fn(EventType, Option<&Resource>) -> bool,
    ) -> CoreResult<Option<Resource>> {
        let mut sub = self
            .dispatcher
            .collection(pointer.namespace(), pointer.type_())
            .watch(pointer.id(), WatchStart::Initial)?;

        ctx.run(async move {
            loop {
                let batch = sub.next_batch().await;
                if batch.is_empty() {
                    return Err(CoreError::Cancelled);
                }
                for event in batch {
                    let snapshot = match event.event_type {
                        EventType::Destroyed => None,
                        _ => event.resource.as_ref(),
                    };
                    if predicate(event.event_type, snapshot) {
                        return Ok(snapshot.cloned());
                    }
                    if event.event_type == EventType::Errored {
                        return Err(CoreError::InvalidWatchBookmark);
                    }
                }
            }
        })
        .await
    }

    /// Opens a [`CancellationToken`] that fires the moment `pointer` enters
    /// `TearingDown` or is destroyed (or immediately, if it is already
    /// absent or already `TearingDown`): the controller-runtime equivalent
    /// of a request context tied to a resource's lifetime rather than a
    /// caller's connection. Firing on the `TearingDown` transition, not just
    /// on the eventual `Destroyed`, matters because a resource with pending
    /// finalizers can sit in `TearingDown` indefinitely before it is
    /// actually destroyed.
    #[must_use]
    pub fn context_with_teardown(&self, pointer: &Pointer) -> CancellationToken {
        let token = CancellationToken::new();
        let collection = self.dispatcher.collection(pointer.namespace(), pointer.type_());
        match collection.get(pointer.id()) {
            Ok(resource) if resource.metadata().phase() == Phase::TearingDown => {
                token.cancel();
                return token;
            }
            Err(_) => {
                token.cancel();
                return token;
            }
            Ok(_) => {}
        }
        match collection.watch(pointer.id(), WatchStart::Initial) {
            Ok(mut sub) => {
                let child = token.clone();
                tokio::spawn(async move {
                    loop {
                        let batch = sub.next_batch().await;
                        if batch.is_empty() {
                            child.cancel();
                            return;
                        }
                        let entered_teardown = batch.iter().any(|e| match e.event_type {
                            EventType::Destroyed => true,
                            EventType::Created | EventType::Updated => e
                                .resource
                                .as_ref()
                                .is_some_and(|r| r.metadata().phase() == Phase::TearingDown),
                            EventType::Bootstrapped | EventType::Noop | EventType::Errored => false,
                        });
                        if entered_teardown {
                            child.cancel();
                            return;
                        }
                    }
                });
            }
            Err(_) => token.cancel(),
        }
        token
    }
}

/// The mutating façade, scoped to a single owner identity.
pub struct OwnedFacade {
    dispatcher: Arc<NamespacedDispatcher>,
    owner: String,
}

impl OwnedFacade {
    #[must_use]
    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub async fn create(&self, ctx: &CallerContext, namespace: &str, type_: &str, resource: Resource) -> CoreResult<Resource> {
        let collection = self.dispatcher.collection(namespace, type_);
        ctx.run(collection.create(resource, &self.owner)).await
    }

    pub async fn update(&self, ctx: &CallerContext, namespace: &str, type_: &str, resource: Resource) -> CoreResult<Resource> {
        let collection = self.dispatcher.collection(namespace, type_);
        ctx.run(collection.update(resource, &self.owner, None)).await
    }

    pub async fn destroy(&self, ctx: &CallerContext, pointer: &Pointer) -> CoreResult<()> {
        let collection = self.dispatcher.collection(pointer.namespace(), pointer.type_());
        ctx.run(collection.destroy(pointer, &self.owner)).await
    }

    pub async fn add_finalizer(&self, ctx: &CallerContext, pointer: &Pointer, finalizer: &str) -> CoreResult<Resource> {
        let collection = self.dispatcher.collection(pointer.namespace(), pointer.type_());
        ctx.run(collection.add_finalizer(pointer.id(), finalizer, &self.owner)).await
    }

    pub async fn remove_finalizer(&self, ctx: &CallerContext, pointer: &Pointer, finalizer: &str) -> CoreResult<Resource> {
        let collection = self.dispatcher.collection(pointer.namespace(), pointer.type_());
        ctx.run(collection.remove_finalizer(pointer.id(), finalizer, &self.owner)).await
    }

    pub async fn teardown(&self, ctx: &CallerContext, pointer: &Pointer) -> CoreResult<bool> {
        let collection = self.dispatcher.collection(pointer.namespace(), pointer.type_());
        ctx.run(collection.teardown(pointer, &self.owner)).await
    }

    /// Transitions to `TearingDown`, then either destroys immediately (no
    /// finalizers pending) or, per `opts`, returns `false` without blocking
    /// or subscribes and blocks until the finalizer set empties before
    /// destroying. Returns whether the resource was destroyed by this call.
    pub async fn teardown_and_destroy(
        &self,
        ctx: &CallerContext,
        pointer: &Pointer,
        opts: TeardownAndDestroyOptions,
    ) -> CoreResult<bool> {
        let ready = self.teardown(ctx, pointer).await?;
        if ready {
            self.destroy(ctx, pointer).await?;
            return Ok(true);
        }
        if opts.no_blocking {
            return Ok(false);
        }

        let collection = self.dispatcher.collection(pointer.namespace(), pointer.type_());
        let mut sub = collection.watch(pointer.id(), WatchStart::Initial)?;
        let already_destroyed = ctx
            .run(async move {
                loop {
                    let batch = sub.next_batch().await;
                    if batch.is_empty() {
                        return Err(CoreError::Cancelled);
                    }
                    for event in batch {
                        match event.event_type {
                            EventType::Destroyed => return Ok(true),
                            EventType::Errored => return Err(CoreError::InvalidWatchBookmark),
                            _ => {
                                if event.resource.as_ref().is_some_and(|r| r.metadata().finalizers().is_empty()) {
                                    return Ok(false);
                                }
                            }
                        }
                    }
                }
            })
            .await?;
        if !already_destroyed {
            self.destroy(ctx, pointer).await?;
        }
        Ok(true)
    }

    /// Retries `mutator` against the freshest stored resource on every
    /// `VersionConflict`, up to `max_retries` (default from
    /// [`crate::config::RuntimeConfig::update_with_conflicts_max_retries`]).
    pub async fn update_with_conflicts(
        &self,
        ctx: &CallerContext,
        namespace: &str,
        type_: &str,
        id: &str,
        max_retries: u32,
        mutator: impl Fn(&mut Resource),
    ) -> CoreResult<Resource> {
        let collection = self.dispatcher.collection(namespace, type_);
        for attempt in 0..=max_retries {
            let mut current = ctx.run(async { collection.get(id) }).await?;
            mutator(&mut current);
            match ctx.run(collection.update(current, &self.owner, None)).await {
                Ok(updated) => return Ok(updated),
                Err(err) if err.kind() == cosi_core::error::ErrorKind::VersionConflict => {
                    warn!(namespace, type_, id, attempt, "update_with_conflicts retrying after version conflict");
                    continue;
                }
                Err(err) => return Err(err),
            }
        }
        info!(namespace, type_, id, max_retries, "update_with_conflicts exhausted retries");
        Err(CoreError::VersionConflict {
            namespace: namespace.to_string(),
            type_: type_.to_string(),
            id: id.to_string(),
            expected: cosi_core::version::Version::Undefined,
            stored: cosi_core::version::Version::Undefined,
        })
    }
}
