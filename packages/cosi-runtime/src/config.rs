//! Runtime-level configuration for resource collections.
//!
//! Mirrors `ServerConfig`'s shape in the teacher workspace: a flat,
//! `Deserialize`-able struct with documented defaults, populated by an
//! external loader that is out of scope for this crate.

use serde::{Deserialize, Serialize};

/// Tunables for a [`crate::storage::collection::ResourceCollection`]'s event
/// buffer and backoff behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Initial cyclic event buffer capacity.
    pub history_initial_capacity: usize,
    /// Ceiling the buffer may grow to via one-shot doubling on first wrap.
    pub history_max_capacity: usize,
    /// Shrinks the effective tail-event window to `capacity - gap`, so a
    /// briefly-blocked watcher is not immediately lapped by the producer.
    pub history_gap: usize,
    /// Minimum backoff before a panicked or errored task runner worker is
    /// restarted.
    pub task_restart_backoff_min_ms: u64,
    /// Maximum backoff before a panicked or errored task runner worker is
    /// restarted.
    pub task_restart_backoff_max_ms: u64,
    /// Bound on `UpdateWithConflicts`'s retry loop.
    pub update_with_conflicts_max_retries: u32,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            history_initial_capacity: 100,
            history_max_capacity: 100,
            history_gap: 5,
            task_restart_backoff_min_ms: 100,
            task_restart_backoff_max_ms: 5_000,
            update_with_conflicts_max_retries: 10,
        }
    }
}
