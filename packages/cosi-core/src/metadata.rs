//! Resource metadata: identity, versioning, ownership, phase, finalizers, and
//! copy-on-write label/annotation maps.
//!
//! Grounded on the field shape of `RecordMetadata` in the teacher workspace
//! (`storage/record.rs`), generalized from a single numeric version counter
//! to the full identity/ownership/lifecycle metadata §3 of the spec requires.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::version::Version;

/// A resource's lifecycle phase. `Running` is the only phase a resource is
/// created in; `TearingDown` is a one-way transition (I5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Running,
    TearingDown,
}

impl Default for Phase {
    fn default() -> Self {
        Self::Running
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "Running"),
            Self::TearingDown => write!(f, "TearingDown"),
        }
    }
}

/// A copy-on-write string-to-string map.
///
/// `clone()` is a cheap `Arc` bump; the underlying `BTreeMap` is only cloned
/// the moment a write would actually change it, so two holders of a clone can
/// share storage indefinitely as long as neither one writes (I7).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CowMap(Arc<BTreeMap<String, String>>);

impl CowMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Sets `key` to `value`. A no-op (no clone) if the stored value is
    /// already equal.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        if self.0.get(&key) == Some(&value) {
            return;
        }
        let mut clone = (*self.0).clone();
        clone.insert(key, value);
        self.0 = Arc::new(clone);
    }

    /// Removes `key`. A no-op (no clone) if absent. Returns whether it was present.
    pub fn delete(&mut self, key: &str) -> bool {
        if !self.0.contains_key(key) {
            return false;
        }
        let mut clone = (*self.0).clone();
        clone.remove(key);
        self.0 = Arc::new(clone);
        true
    }

    #[must_use]
    pub fn equal(&self, other: &Self) -> bool {
        self == other
    }

    /// Runs a transactional mutation. The closure sees a draft that clones
    /// the backing map only on its first write; the draft replaces the map
    /// only if it was ever touched (dirtied), even if all writes happened to
    /// be no-ops relative to the original.
    pub fn do_mut<F: FnOnce(&mut CowMapTransaction)>(&mut self, f: F) {
        let mut txn = CowMapTransaction {
            original: Arc::clone(&self.0),
            draft: None,
        };
        f(&mut txn);
        if let Some(draft) = txn.draft {
            self.0 = Arc::new(draft);
        }
    }
}

/// The mutable temporary handed to a [`CowMap::do_mut`] closure.
pub struct CowMapTransaction {
    original: Arc<BTreeMap<String, String>>,
    draft: Option<BTreeMap<String, String>>,
}

impl CowMapTransaction {
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.draft
            .as_ref()
            .map_or_else(|| self.original.get(key), |d| d.get(key))
            .map(String::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        if self.get(&key) == Some(value.as_str()) {
            return;
        }
        self.draft_mut().insert(key, value);
    }

    pub fn delete(&mut self, key: &str) -> bool {
        if self.get(key).is_none() {
            return false;
        }
        self.draft_mut().remove(key);
        true
    }

    fn draft_mut(&mut self) -> &mut BTreeMap<String, String> {
        if self.draft.is_none() {
            self.draft = Some((*self.original).clone());
        }
        self.draft.as_mut().expect("draft initialized above")
    }
}

/// An ordered-insertion set of finalizer names.
///
/// Small by construction (a handful of controller names at most), so a `Vec`
/// with linear `contains` is the right tool -- no need for a hash index.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizerSet(Vec<String>);

impl FinalizerSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.0.iter().any(|f| f == name)
    }

    #[must_use]
    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    /// Adds `name` if not already present. Returns whether it was new.
    pub fn add(&mut self, name: impl Into<String>) -> bool {
        let name = name.into();
        if self.contains(&name) {
            return false;
        }
        self.0.push(name);
        true
    }

    /// Removes `name`. Returns whether it was present.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.0.len();
        self.0.retain(|f| f != name);
        self.0.len() != before
    }
}

/// Identity, version, ownership, phase, finalizers, labels and annotations
/// for a single resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    namespace: String,
    #[serde(rename = "type")]
    type_: String,
    id: String,
    version: Version,
    phase: Phase,
    /// Empty string means "no owner" (I3).
    owner: String,
    finalizers: FinalizerSet,
    labels: CowMap,
    annotations: CowMap,
    created: i64,
    updated: i64,
}

impl Metadata {
    /// Creates fresh, unversioned metadata for `(namespace, type, id)`. Used
    /// by callers building a `Resource` prior to `Create`; `version` stays
    /// `Undefined` and timestamps stay zero until `Create` stamps them (I6).
    #[must_use]
    pub fn new(namespace: impl Into<String>, type_: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            type_: type_.into(),
            id: id.into(),
            version: Version::Undefined,
            phase: Phase::Running,
            owner: String::new(),
            finalizers: FinalizerSet::new(),
            labels: CowMap::new(),
            annotations: CowMap::new(),
            created: 0,
            updated: 0,
        }
    }

    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    #[must_use]
    pub fn type_(&self) -> &str {
        &self.type_
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn version(&self) -> Version {
        self.version
    }

    #[must_use]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    #[must_use]
    pub fn owner(&self) -> &str {
        &self.owner
    }

    #[must_use]
    pub fn has_owner(&self) -> bool {
        !self.owner.is_empty()
    }

    #[must_use]
    pub fn finalizers(&self) -> &FinalizerSet {
        &self.finalizers
    }

    pub fn finalizers_mut(&mut self) -> &mut FinalizerSet {
        &mut self.finalizers
    }

    #[must_use]
    pub fn labels(&self) -> &CowMap {
        &self.labels
    }

    pub fn labels_mut(&mut self) -> &mut CowMap {
        &mut self.labels
    }

    #[must_use]
    pub fn annotations(&self) -> &CowMap {
        &self.annotations
    }

    pub fn annotations_mut(&mut self) -> &mut CowMap {
        &mut self.annotations
    }

    #[must_use]
    pub fn created(&self) -> i64 {
        self.created
    }

    #[must_use]
    pub fn updated(&self) -> i64 {
        self.updated
    }

    /// Sets the owner if currently unset. Returns `true` if the owner was
    /// (re)claimed successfully, `false` if an owner was already set (to a
    /// different value) -- owner is immutable once non-empty (I3).
    #[must_use]
    pub fn claim_owner(&mut self, owner: &str) -> bool {
        if owner.is_empty() {
            return true;
        }
        if self.owner.is_empty() {
            self.owner = owner.to_string();
            return true;
        }
        self.owner == owner
    }

    /// Stamps `version = 1`, `created = updated = now` (I6). Called once, by
    /// `Create`.
    pub fn stamp_create(&mut self, now: i64) {
        self.version = Version::INITIAL;
        self.created = now;
        self.updated = now;
    }

    /// Stamps `version = version.next()`, `updated = now`, preserving
    /// `created` (I2, I6). Called by `Update` and the internal
    /// finalizer/teardown transitions that are modeled as updates.
    pub fn stamp_update(&mut self, now: i64) {
        self.version = self.version.next();
        self.updated = now;
    }

    pub fn set_phase(&mut self, phase: Phase) {
        self.phase = phase;
    }

    /// The stable key order mandated by §4.C1 for a canonical representation:
    /// `namespace, type, id, version, owner, phase, created, updated, labels,
    /// annotations, finalizers`, with empty collections omitted.
    #[must_use]
    pub fn ordered_fields(&self) -> Vec<(&'static str, String)> {
        let mut fields = vec![
            ("namespace", self.namespace.clone()),
            ("type", self.type_.clone()),
            ("id", self.id.clone()),
            ("version", self.version.to_string()),
            ("owner", self.owner.clone()),
            ("phase", self.phase.to_string()),
            ("created", self.created.to_string()),
            ("updated", self.updated.to_string()),
        ];
        if !self.labels.is_empty() {
            fields.push(("labels", map_to_string(&self.labels)));
        }
        if !self.annotations.is_empty() {
            fields.push(("annotations", map_to_string(&self.annotations)));
        }
        if !self.finalizers.is_empty() {
            fields.push(("finalizers", format!("{:?}", self.finalizers.as_slice())));
        }
        fields
    }
}

fn map_to_string(map: &CowMap) -> String {
    let mut s = String::from("{");
    for (i, (k, v)) in map.iter().enumerate() {
        if i > 0 {
            s.push_str(", ");
        }
        s.push_str(k);
        s.push(':');
        s.push_str(v);
    }
    s.push('}');
    s
}

impl fmt::Display for Metadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (key, value) in self.ordered_fields() {
            writeln!(f, "{key}: {value}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cow_map_set_is_no_op_when_unchanged() {
        let mut m = CowMap::new();
        m.set("a", "1");
        let clone = m.clone();
        m.set("a", "1");
        // Same value: no clone should have happened, so the two should still
        // alias the same underlying Arc.
        assert!(Arc::ptr_eq(&m.0, &clone.0));
    }

    #[test]
    fn cow_map_set_clones_on_real_change() {
        let mut m = CowMap::new();
        m.set("a", "1");
        let clone = m.clone();
        m.set("a", "2");
        assert!(!Arc::ptr_eq(&m.0, &clone.0));
        assert_eq!(clone.get("a"), Some("1"));
        assert_eq!(m.get("a"), Some("2"));
    }

    #[test]
    fn cow_map_delete_no_op_when_absent() {
        let mut m = CowMap::new();
        m.set("a", "1");
        let clone = m.clone();
        assert!(!m.delete("missing"));
        assert!(Arc::ptr_eq(&m.0, &clone.0));
    }

    #[test]
    fn cow_map_equal_is_structural() {
        let mut a = CowMap::new();
        a.set("x", "1");
        let mut b = CowMap::new();
        b.set("x", "1");
        assert!(a.equal(&b));
        assert!(!Arc::ptr_eq(&a.0, &b.0));
    }

    #[test]
    fn do_mut_clones_once_and_installs_if_dirty() {
        let mut m = CowMap::new();
        m.set("a", "1");
        let original_ptr = Arc::as_ptr(&m.0);

        m.do_mut(|txn| {
            txn.set("a", "1"); // no-op relative to original
            txn.set("b", "2"); // real write: triggers the one clone
        });

        assert_ne!(Arc::as_ptr(&m.0), original_ptr);
        assert_eq!(m.get("a"), Some("1"));
        assert_eq!(m.get("b"), Some("2"));
    }

    #[test]
    fn do_mut_no_draft_means_no_clone() {
        let mut m = CowMap::new();
        m.set("a", "1");
        let clone = m.clone();
        m.do_mut(|txn| {
            let _ = txn.get("a");
        });
        assert!(Arc::ptr_eq(&m.0, &clone.0));
    }

    #[test]
    fn finalizer_set_add_remove_semantics() {
        let mut set = FinalizerSet::new();
        assert!(set.add("fA"));
        assert!(!set.add("fA"), "re-adding is a no-op, returns false");
        assert!(set.contains("fA"));

        assert!(set.remove("fA"));
        assert!(!set.remove("fA"), "removing absent is a no-op, returns false");
        assert!(set.is_empty());
    }

    #[test]
    fn metadata_create_stamps_version_one_and_timestamps() {
        let mut md = Metadata::new("default", "T", "x");
        assert!(md.version().is_undefined());
        md.stamp_create(1000);
        assert_eq!(md.version(), Version::Number(1));
        assert_eq!(md.created(), 1000);
        assert_eq!(md.updated(), 1000);
    }

    #[test]
    fn metadata_update_bumps_version_preserves_created() {
        let mut md = Metadata::new("default", "T", "x");
        md.stamp_create(1000);
        md.stamp_update(2000);
        assert_eq!(md.version(), Version::Number(2));
        assert_eq!(md.created(), 1000);
        assert_eq!(md.updated(), 2000);
    }

    #[test]
    fn owner_is_immutable_once_set() {
        let mut md = Metadata::new("default", "T", "x");
        assert!(md.claim_owner("o1"));
        assert_eq!(md.owner(), "o1");
        assert!(!md.claim_owner("o2"));
        assert_eq!(md.owner(), "o1");
        assert!(md.claim_owner("o1"), "reclaiming the same owner succeeds");
    }

    #[test]
    fn ordered_fields_omits_empty_collections() {
        let md = Metadata::new("default", "T", "x");
        let fields = md.ordered_fields();
        let keys: Vec<_> = fields.iter().map(|(k, _)| *k).collect();
        assert_eq!(
            keys,
            vec!["namespace", "type", "id", "version", "owner", "phase", "created", "updated"]
        );
    }

    #[test]
    fn ordered_fields_includes_populated_collections_in_order() {
        let mut md = Metadata::new("default", "T", "x");
        md.labels_mut().set("app", "web");
        md.finalizers_mut().add("fA");
        let keys: Vec<_> = md.ordered_fields().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys[keys.len() - 2], "labels");
        assert_eq!(keys[keys.len() - 1], "finalizers");
    }

    #[test]
    fn clone_shares_storage_until_mutated() {
        let mut md = Metadata::new("default", "T", "x");
        md.labels_mut().set("a", "1");
        let clone = md.clone();
        assert!(Arc::ptr_eq(&md.labels().0, &clone.labels().0));
        md.labels_mut().set("a", "2");
        assert_eq!(clone.labels().get("a"), Some("1"));
        assert_eq!(md.labels().get("a"), Some("2"));
    }
}
