//! The monotonic per-resource version counter.
//!
//! Modeled as an optional counter (`Undefined` before the first `Create`,
//! `Number(n)` thereafter) per the Design Notes' resolution of the
//! "plain integer vs. optional boxed counter" open question.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A resource's version: unassigned until the first successful `Create`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Version {
    /// No version has ever been assigned (0 / "undefined" in the spec).
    Undefined,
    /// A concrete, monotonically increasing version number.
    Number(u64),
}

impl Version {
    /// The version stamped by a successful `Create`.
    pub const INITIAL: Self = Self::Number(1);

    /// Returns the version that a successful `Update` from `self` produces.
    ///
    /// `Undefined` has no defined successor; callers must not call `next()`
    /// on an undefined version (a resource without a stored version cannot be
    /// updated -- it does not exist yet).
    #[must_use]
    pub fn next(self) -> Self {
        match self {
            Self::Undefined => Self::INITIAL,
            Self::Number(n) => Self::Number(n + 1),
        }
    }

    #[must_use]
    pub fn is_undefined(self) -> bool {
        matches!(self, Self::Undefined)
    }
}

impl Default for Version {
    fn default() -> Self {
        Self::Undefined
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Undefined => write!(f, "undefined"),
            Self::Number(n) => write!(f, "{n}"),
        }
    }
}
