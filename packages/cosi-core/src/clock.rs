//! Wall-clock abstraction for `created`/`updated` timestamps.
//!
//! Mirrors the dependency-injectable clock pattern used for the Hybrid
//! Logical Clock in the teacher workspace, stripped down to what metadata
//! stamping actually needs: a millisecond reading, swappable in tests.

use std::time::{SystemTime, UNIX_EPOCH};

/// Abstraction over the system clock, so tests can supply a deterministic
/// source instead of `SystemTime::now()`.
pub trait ClockSource: Send + Sync {
    /// Current time, in milliseconds since the Unix epoch.
    fn now_millis(&self) -> i64;
}

/// The default clock source, reading `std::time::SystemTime`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl ClockSource for SystemClock {
    fn now_millis(&self) -> i64 {
        // Millisecond timestamps fit comfortably in i64 until the year 292 million.
        #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64;
        millis
    }
}
