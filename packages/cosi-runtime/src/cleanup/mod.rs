//! The cleanup-controller finalizer protocol: declarative strategies for
//! deciding when a finalizer can be released, composed into one dispatcher.

pub mod controller;

pub use controller::{Combine, Handler, HasNoOutputs, OutputsCheck, OutputsRemover, ReconcileOutcome, RemoveOutputs};
