//! Watch event shapes and opaque bookmark addressing.
//!
//! `WatchEvent`'s payload shape is grounded on the callback signature of
//! `storage/mutation_observer.rs`'s `MutationObserver`, reworked from a
//! borrowed callback argument into an owned value suited to an async pull
//! API (§5's resolution of the concurrency model).

use serde::{Deserialize, Serialize};

use crate::metadata::Metadata;
use crate::resource::{Resource, TypedSpec};

/// The kind of change (or synthetic notice) a [`WatchEvent`] carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    Created,
    Updated,
    Destroyed,
    /// Synthetic: marks the end of the initial list during a bootstrapping
    /// watch (§4.C3).
    Bootstrapped,
    /// Synthetic: a selector transition that changes nothing about
    /// inclusion (kept for watchers that need every tick, per the watch
    /// protocol design floor).
    Noop,
    /// Terminal: the subscription fell too far behind and must be dropped
    /// and re-established with a fresh bootstrap.
    Errored,
}

/// An opaque resume token for a watch stream: an 8-byte random per-process
/// cookie plus an 8-byte big-endian write position, so a bookmark from one
/// process (or an old incarnation of the same collection) is recognizably
/// foreign rather than silently misinterpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Bookmark {
    cookie: u64,
    position: u64,
}

impl Bookmark {
    #[must_use]
    pub fn new(cookie: u64, position: u64) -> Self {
        Self { cookie, position }
    }

    #[must_use]
    pub fn cookie(&self) -> u64 {
        self.cookie
    }

    #[must_use]
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Encodes as 16 bytes: cookie, then position, both big-endian.
    #[must_use]
    pub fn encode(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[..8].copy_from_slice(&self.cookie.to_be_bytes());
        out[8..].copy_from_slice(&self.position.to_be_bytes());
        out
    }

    /// Decodes a bookmark previously produced by [`Bookmark::encode`].
    /// Returns `None` for malformed input (wrong length); does not by
    /// itself validate that the cookie belongs to the current process --
    /// that check happens where the bookmark is resolved against a live
    /// event log, which is the only place that knows the current cookie.
    #[must_use]
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != 16 {
            return None;
        }
        let cookie = u64::from_be_bytes(bytes[..8].try_into().ok()?);
        let position = u64::from_be_bytes(bytes[8..].try_into().ok()?);
        Some(Self { cookie, position })
    }
}

/// A resource snapshot frozen at the moment it was removed from a
/// collection, kept around only long enough for watchers to observe the
/// terminal `Destroyed` event and any `CacheRemove` tombstone bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct Tombstone {
    pub resource: Resource,
    pub removed_at: i64,
}

/// A single change notification delivered by a watch stream.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchEvent {
    pub event_type: EventType,
    /// Absent only for a terminal `Errored` event.
    pub resource: Option<Resource>,
    /// The resource's prior value, present only for `Updated`.
    pub old: Option<Resource>,
    /// Present only for `Errored`; human-readable, not matched on by kind.
    pub error: Option<String>,
    /// Absent only for a terminal `Errored` event (there is nothing to
    /// resume from).
    pub bookmark: Option<Bookmark>,
}

impl WatchEvent {
    #[must_use]
    pub fn created(resource: Resource, bookmark: Bookmark) -> Self {
        Self {
            event_type: EventType::Created,
            resource: Some(resource),
            old: None,
            error: None,
            bookmark: Some(bookmark),
        }
    }

    #[must_use]
    pub fn updated(resource: Resource, old: Resource, bookmark: Bookmark) -> Self {
        Self {
            event_type: EventType::Updated,
            resource: Some(resource),
            old: Some(old),
            error: None,
            bookmark: Some(bookmark),
        }
    }

    #[must_use]
    pub fn destroyed(resource: Resource, bookmark: Bookmark) -> Self {
        Self {
            event_type: EventType::Destroyed,
            resource: Some(resource),
            old: None,
            error: None,
            bookmark: Some(bookmark),
        }
    }

    #[must_use]
    pub fn bootstrapped(bookmark: Bookmark) -> Self {
        Self {
            event_type: EventType::Bootstrapped,
            resource: None,
            old: None,
            error: None,
            bookmark: Some(bookmark),
        }
    }

    #[must_use]
    pub fn noop(resource: Resource, bookmark: Bookmark) -> Self {
        Self {
            event_type: EventType::Noop,
            resource: Some(resource),
            old: None,
            error: None,
            bookmark: Some(bookmark),
        }
    }

    #[must_use]
    pub fn errored(message: impl Into<String>) -> Self {
        Self {
            event_type: EventType::Errored,
            resource: None,
            old: None,
            error: Some(message.into()),
            bookmark: None,
        }
    }
}

/// Builds a resource-shaped placeholder representing "no such resource
/// exists": identity only, `Version::Undefined`, an empty spec. Used for a
/// synthetic `Destroyed` on an absent single-resource `Watch` target and for
/// a controller-runtime cache's tombstone entries.
#[must_use]
pub fn tombstone_resource(
    namespace: impl Into<String>,
    type_: impl Into<String>,
    id: impl Into<String>,
) -> Resource {
    Resource::new(Metadata::new(namespace, type_, id), Box::new(TypedSpec(())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::Metadata;
    use crate::resource::TypedSpec;

    fn demo_resource() -> Resource {
        Resource::new(Metadata::new("default", "T", "x"), Box::new(TypedSpec(())))
    }

    #[test]
    fn bookmark_roundtrips_through_encode_decode() {
        let bm = Bookmark::new(0xDEAD_BEEF, 42);
        let decoded = Bookmark::decode(&bm.encode()).unwrap();
        assert_eq!(bm, decoded);
    }

    #[test]
    fn bookmark_decode_rejects_wrong_length() {
        assert!(Bookmark::decode(&[1, 2, 3]).is_none());
    }

    #[test]
    fn errored_event_carries_no_bookmark_or_resource() {
        let ev = WatchEvent::errored("buffer overrun");
        assert_eq!(ev.event_type, EventType::Errored);
        assert!(ev.bookmark.is_none());
        assert!(ev.resource.is_none());
        assert_eq!(ev.error.as_deref(), Some("buffer overrun"));
    }

    #[test]
    fn tombstone_resource_has_undefined_version() {
        let r = tombstone_resource("default", "T", "x");
        assert!(r.metadata().version().is_undefined());
        assert_eq!(r.metadata().id(), "x");
    }

    #[test]
    fn updated_event_carries_old_and_new() {
        let bm = Bookmark::new(1, 1);
        let ev = WatchEvent::updated(demo_resource(), demo_resource(), bm);
        assert_eq!(ev.event_type, EventType::Updated);
        assert!(ev.old.is_some());
        assert!(ev.resource.is_some());
    }
}
