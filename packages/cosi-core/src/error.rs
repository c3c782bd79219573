//! Error taxonomy surfaced by every verb in the COSI core.
//!
//! Errors are carried as values, discriminable by [`ErrorKind`] rather than by
//! concrete type, so callers (and the `UpdateWithConflicts` retry loop) can
//! match on kind without downcasting.

use thiserror::Error;

/// Discriminator for a [`CoreError`], independent of the error's payload.
///
/// `BufferOverrun` is intentionally absent: it is never returned from a
/// mutating verb, only delivered in-band as a terminal `Errored` watch event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    VersionConflict,
    OwnerConflict,
    PhaseConflict,
    PendingFinalizers,
    InvalidWatchBookmark,
    Unsupported,
    Cancelled,
    BackingStore,
}

/// The error type returned by every COSI core and runtime verb.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("{namespace}/{type_}/{id} not found")]
    NotFound {
        namespace: String,
        type_: String,
        id: String,
    },

    #[error("{namespace}/{type_}/{id} already exists")]
    AlreadyExists {
        namespace: String,
        type_: String,
        id: String,
    },

    #[error(
        "version conflict on {namespace}/{type_}/{id}: expected {expected:?}, stored {stored:?}"
    )]
    VersionConflict {
        namespace: String,
        type_: String,
        id: String,
        expected: crate::version::Version,
        stored: crate::version::Version,
    },

    #[error(
        "owner conflict on {namespace}/{type_}/{id}: stored owner {stored:?} does not match requested owner {requested:?}"
    )]
    OwnerConflict {
        namespace: String,
        type_: String,
        id: String,
        stored: String,
        requested: String,
    },

    #[error(
        "phase conflict on {namespace}/{type_}/{id}: expected {expected:?}, stored {stored:?}"
    )]
    PhaseConflict {
        namespace: String,
        type_: String,
        id: String,
        expected: crate::metadata::Phase,
        stored: crate::metadata::Phase,
    },

    #[error("cannot destroy {namespace}/{type_}/{id}: finalizers still pending: {finalizers:?}")]
    PendingFinalizers {
        namespace: String,
        type_: String,
        id: String,
        finalizers: Vec<String>,
    },

    #[error("watch bookmark is invalid, foreign, or outside the safe window")]
    InvalidWatchBookmark,

    #[error("unsupported operation: {0}")]
    Unsupported(String),

    #[error("operation was cancelled")]
    Cancelled,

    #[error("backing store error: {0}")]
    BackingStore(#[source] anyhow::Error),
}

impl CoreError {
    /// Returns the discriminator for this error, for callers that need to
    /// branch on kind without matching every variant (e.g. a retry loop that
    /// only cares whether this was a `VersionConflict`).
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            Self::VersionConflict { .. } => ErrorKind::VersionConflict,
            Self::OwnerConflict { .. } => ErrorKind::OwnerConflict,
            Self::PhaseConflict { .. } => ErrorKind::PhaseConflict,
            Self::PendingFinalizers { .. } => ErrorKind::PendingFinalizers,
            Self::InvalidWatchBookmark => ErrorKind::InvalidWatchBookmark,
            Self::Unsupported(_) => ErrorKind::Unsupported,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::BackingStore(_) => ErrorKind::BackingStore,
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::Phase;
    use crate::version::Version;

    #[test]
    fn kind_matches_variant() {
        let err = CoreError::NotFound {
            namespace: "default".into(),
            type_: "T".into(),
            id: "x".into(),
        };
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let err = CoreError::VersionConflict {
            namespace: "default".into(),
            type_: "T".into(),
            id: "x".into(),
            expected: Version::Number(1),
            stored: Version::Number(2),
        };
        assert_eq!(err.kind(), ErrorKind::VersionConflict);

        let err = CoreError::PhaseConflict {
            namespace: "default".into(),
            type_: "T".into(),
            id: "x".into(),
            expected: Phase::Running,
            stored: Phase::TearingDown,
        };
        assert_eq!(err.kind(), ErrorKind::PhaseConflict);
    }

    #[test]
    fn display_is_human_readable() {
        let err = CoreError::PendingFinalizers {
            namespace: "default".into(),
            type_: "T".into(),
            id: "x".into(),
            finalizers: vec!["fA".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("fA"));
        assert!(msg.contains("pending"));
    }
}
