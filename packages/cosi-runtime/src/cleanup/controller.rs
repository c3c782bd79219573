//! The cleanup-controller finalizer protocol: a handler declares ownership
//! of one finalizer name and is asked, on every reconcile, whether it is safe
//! to remove.
//!
//! Grounded on the `async_trait` object-seam style `storage/map_data_store.rs`
//! uses for its `BackingStore`-equivalent collaborator, generalized from a
//! single implementation to a registry of independently owned finalizers.
//! The top-level reconcile loop -- place the finalizer while `Running`,
//! attempt removal once `TearingDown` -- follows `facade.rs`'s
//! `teardown`/`teardown_and_destroy` pairing of a phase check with a
//! finalizer-set mutation.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use cosi_core::error::CoreResult;
use cosi_core::metadata::Phase;
use cosi_core::resource::{Pointer, Resource};

use crate::facade::{CallerContext, StateFacade};

/// A strategy that owns exactly one finalizer name and knows how to decide
/// (and optionally act) on whether it can be removed.
#[async_trait]
pub trait Handler: Send + Sync {
    /// The finalizer name this handler is responsible for.
    fn finalizer_name(&self) -> &str;

    /// Attempts to make progress toward removing this handler's finalizer,
    /// returning whether it is now safe to remove.
    async fn attempt_removal(&self, resource: &Resource) -> CoreResult<bool>;
}

/// A collaborator that can report whether a resource still has live outputs
/// depending on it (e.g. child resources, external allocations).
#[async_trait]
pub trait OutputsCheck: Send + Sync {
    async fn has_outputs(&self, resource: &Resource) -> CoreResult<bool>;
}

/// A collaborator that can actively delete a resource's remaining outputs.
#[async_trait]
pub trait OutputsRemover: Send + Sync {
    /// Deletes whatever outputs still exist. Idempotent: called again on a
    /// resource with nothing left to remove is a no-op success.
    async fn remove_outputs(&self, resource: &Resource) -> CoreResult<()>;

    /// Whether outputs now remain, used to decide whether the finalizer can
    /// be dropped after `remove_outputs` ran.
    async fn has_outputs(&self, resource: &Resource) -> CoreResult<bool>;
}

/// A [`Handler`] for controllers that never create outputs of their own to
/// clean up -- they only need to observe whether some other collaborator's
/// outputs are gone before releasing their finalizer.
pub struct HasNoOutputs<C: OutputsCheck> {
    finalizer: String,
    check: C,
}

impl<C: OutputsCheck> HasNoOutputs<C> {
    pub fn new(finalizer: impl Into<String>, check: C) -> Self {
        Self {
            finalizer: finalizer.into(),
            check,
        }
    }
}

#[async_trait]
impl<C: OutputsCheck> Handler for HasNoOutputs<C> {
    fn finalizer_name(&self) -> &str {
        &self.finalizer
    }

    async fn attempt_removal(&self, resource: &Resource) -> CoreResult<bool> {
        Ok(!self.check.has_outputs(resource).await?)
    }
}

/// A [`Handler`] for controllers that own outputs and must delete them as
/// part of releasing their finalizer.
pub struct RemoveOutputs<R: OutputsRemover> {
    finalizer: String,
    remover: R,
}

impl<R: OutputsRemover> RemoveOutputs<R> {
    pub fn new(finalizer: impl Into<String>, remover: R) -> Self {
        Self {
            finalizer: finalizer.into(),
            remover,
        }
    }
}

#[async_trait]
impl<R: OutputsRemover> Handler for RemoveOutputs<R> {
    fn finalizer_name(&self) -> &str {
        &self.finalizer
    }

    async fn attempt_removal(&self, resource: &Resource) -> CoreResult<bool> {
        self.remover.remove_outputs(resource).await?;
        Ok(!self.remover.has_outputs(resource).await?)
    }
}

/// What one reconcile pass decided to do to a resource's finalizer set: add
/// this controller's own finalizers it is missing (only while `Running`), or
/// remove finalizers a handler signalled are now safe to drop (only while
/// `TearingDown`). A resource can only ever produce one or the other in a
/// single pass -- the phases are mutually exclusive.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub to_add: Vec<String>,
    pub to_remove: Vec<String>,
}

/// Composes independently written [`Handler`]s, keyed by the finalizer name
/// each one owns.
///
/// Two handlers declaring the same finalizer name is a wiring bug, not a
/// recoverable runtime condition -- it means two controllers believe they
/// each exclusively own cleanup for the same guard, which would silently
/// race. `Combine::new` panics immediately rather than letting one
/// registration shadow the other.
pub struct Combine {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl Combine {
    /// # Panics
    /// If two handlers declare the same [`Handler::finalizer_name`].
    #[must_use]
    pub fn new(handlers: Vec<Arc<dyn Handler>>) -> Self {
        let mut map = HashMap::with_capacity(handlers.len());
        for handler in handlers {
            let name = handler.finalizer_name().to_string();
            if map.insert(name.clone(), handler).is_some() {
                panic!("duplicate cleanup handler registered for finalizer {name:?}");
            }
        }
        Self { handlers: map }
    }

    /// Decides what this controller should do to `resource` this pass: place
    /// any of its finalizers the resource is `Running` and doesn't carry yet,
    /// or -- once `TearingDown` -- attempt removal of whichever of its
    /// finalizers the resource still carries. A handler that signals
    /// skip-reconcile (returns `false`) simply leaves its finalizer alone;
    /// a later pass retries it.
    pub async fn decide(&self, resource: &Resource) -> CoreResult<ReconcileOutcome> {
        let mut outcome = ReconcileOutcome::default();
        let finalizers = resource.metadata().finalizers();
        match resource.metadata().phase() {
            Phase::Running => {
                for name in self.handlers.keys() {
                    if !finalizers.contains(name) {
                        outcome.to_add.push(name.clone());
                    }
                }
            }
            Phase::TearingDown => {
                for name in finalizers.as_slice() {
                    if let Some(handler) = self.handlers.get(name) {
                        if handler.attempt_removal(resource).await? {
                            outcome.to_remove.push(name.clone());
                        }
                    }
                }
            }
        }
        Ok(outcome)
    }

    /// Drives one reconcile pass over `pointer`'s current stored resource
    /// through `facade`: places missing finalizers while `Running`, attempts
    /// removal of carried ones while `TearingDown`, and persists whatever
    /// `decide` returned. Returns the finalizer names actually removed this
    /// pass.
    ///
    /// Finalizer mutations are owner-checked against whoever currently owns
    /// the resource, not against any identity of the cleanup controller
    /// itself -- a cleanup controller acts on resources it does not own.
    pub async fn reconcile(&self, facade: &StateFacade, ctx: &CallerContext, pointer: &Pointer) -> CoreResult<Vec<String>> {
        let resource = facade.get(pointer.namespace(), pointer.type_(), pointer.id())?;
        let outcome = self.decide(&resource).await?;
        if outcome.to_add.is_empty() && outcome.to_remove.is_empty() {
            return Ok(Vec::new());
        }
        let owned = facade.owned(resource.metadata().owner().to_string());
        for name in &outcome.to_add {
            owned.add_finalizer(ctx, pointer, name).await?;
        }
        for name in &outcome.to_remove {
            owned.remove_finalizer(ctx, pointer, name).await?;
        }
        Ok(outcome.to_remove)
    }
}
