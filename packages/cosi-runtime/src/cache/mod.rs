//! Controller-runtime read-through cache: a local mirror of one resource
//! kind, kept current by feeding it watch events.

pub mod controller_cache;

pub use controller_cache::{ControllerCache, StateReader, WrapState};
