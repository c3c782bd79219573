//! COSI Runtime -- the concurrency-heavy state engine built on `cosi-core`'s
//! data model:
//!
//! - [`config`] -- tunables for a collection's event buffer and backoff
//!   behavior.
//! - [`storage`] -- the per-collection event log, optional backing-store
//!   seam, `ResourceCollection`, and the namespace-routing dispatcher in
//!   front of it.
//! - [`facade`] -- the narrow, owner-scoped façade collaborators are handed
//!   instead of a raw collection or dispatcher.
//! - [`cache`] -- the controller-runtime read-through cache.
//! - [`cleanup`] -- the cleanup-controller finalizer protocol.
//! - [`taskrunner`] -- reconciling a desired set of named tasks against what
//!   is actually running.

pub mod cache;
pub mod cleanup;
pub mod config;
pub mod facade;
pub mod storage;
pub mod taskrunner;

pub use cache::{ControllerCache, StateReader, WrapState};
pub use cleanup::{Combine, Handler, HasNoOutputs, OutputsCheck, OutputsRemover, ReconcileOutcome, RemoveOutputs};
pub use config::RuntimeConfig;
pub use facade::{with_event_types, with_finalizer_empty, with_phases, CallerContext, OwnedFacade, StateFacade, TeardownAndDestroyOptions};
pub use storage::{BackingStore, NamespacedDispatcher, NullBackingStore, QueryOptions, ResourceCollection, Subscription, WatchKindStart, WatchStart};
pub use taskrunner::{TaskFactory, TaskRunner};
