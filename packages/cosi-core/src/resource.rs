//! The `Resource` payload interface: typed identity + opaque `Spec` +
//! metadata, and the `ResourceDefinition` naming grammar.
//!
//! `Spec` is modeled as a capability object (`deep_copy`, `equal`, `marshal`)
//! per the Design Notes' resolution of the "runtime-typed Spec" open
//! question, rather than a closed enum -- generalizing the typed
//! `RecordValue` payload the teacher's `storage/record.rs` carries.

use std::any::Any;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::metadata::Metadata;

/// Capability object for a resource's opaque payload.
///
/// Implementations are produced by wrapping a concrete, `Serialize`-able
/// payload type in [`TypedSpec`]; callers outside the defining crate only
/// ever see `dyn Spec`.
pub trait Spec: fmt::Debug + Send + Sync {
    fn deep_copy(&self) -> Box<dyn Spec>;
    fn dyn_eq(&self, other: &dyn Spec) -> bool;
    fn marshal(&self) -> serde_json::Value;
    fn as_any(&self) -> &dyn Any;
}

impl PartialEq for dyn Spec {
    fn eq(&self, other: &Self) -> bool {
        self.dyn_eq(other)
    }
}

/// Wraps any concrete, `Clone + PartialEq + Serialize` payload type into a
/// [`Spec`] capability object.
#[derive(Debug, Clone)]
pub struct TypedSpec<T>(pub T);

impl<T> Spec for TypedSpec<T>
where
    T: fmt::Debug + Clone + PartialEq + Serialize + Send + Sync + 'static,
{
    fn deep_copy(&self) -> Box<dyn Spec> {
        Box::new(self.clone())
    }

    fn dyn_eq(&self, other: &dyn Spec) -> bool {
        other
            .as_any()
            .downcast_ref::<Self>()
            .is_some_and(|o| self.0 == o.0)
    }

    fn marshal(&self) -> serde_json::Value {
        serde_json::to_value(&self.0).unwrap_or(serde_json::Value::Null)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A resource: identity + version + lifecycle metadata, plus an opaque spec.
///
/// `Resource::clone()` always performs a full [`Resource::deep_copy`] -- the
/// only exception is that `Metadata`'s label/annotation maps stay
/// copy-on-write underneath, per I7.
#[derive(Debug)]
pub struct Resource {
    metadata: Metadata,
    spec: Box<dyn Spec>,
}

impl Resource {
    #[must_use]
    pub fn new(metadata: Metadata, spec: Box<dyn Spec>) -> Self {
        Self { metadata, spec }
    }

    #[must_use]
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn metadata_mut(&mut self) -> &mut Metadata {
        &mut self.metadata
    }

    #[must_use]
    pub fn spec(&self) -> &dyn Spec {
        self.spec.as_ref()
    }

    #[must_use]
    pub fn pointer(&self) -> Pointer {
        Pointer::from(&self.metadata)
    }

    /// A full, independent copy: metadata clones cheaply (copy-on-write),
    /// the spec is deep-copied via its capability object.
    #[must_use]
    pub fn deep_copy(&self) -> Self {
        Self {
            metadata: self.metadata.clone(),
            spec: self.spec.deep_copy(),
        }
    }
}

impl Clone for Resource {
    fn clone(&self) -> Self {
        self.deep_copy()
    }
}

impl PartialEq for Resource {
    fn eq(&self, other: &Self) -> bool {
        self.metadata == other.metadata && *self.spec == *other.spec
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}spec: {}", self.metadata, self.spec.marshal())
    }
}

/// A resource's identity triple, without its payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Pointer {
    namespace: String,
    #[serde(rename = "type")]
    type_: String,
    id: String,
}

impl Pointer {
    #[must_use]
    pub fn new(namespace: impl Into<String>, type_: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            type_: type_.into(),
            id: id.into(),
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
}

impl From<&Metadata> for Pointer {
    fn from(md: &Metadata) -> Self {
        Self::new(md.namespace(), md.type_(), md.id())
    }
}

impl fmt::Display for Pointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.type_, self.id)
    }
}

/// Whether a resource's payload may contain sensitive data (e.g. secrets),
/// informing whether a display/print layer should redact it. The core
/// itself never redacts -- this is a tag for an external collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Sensitivity {
    NonSensitive,
    Sensitive,
}

/// A single column an external print/display layer should show for a kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrintColumn {
    pub name: String,
    pub json_path: String,
}

/// Describes a resource kind: its canonical type name, default namespace,
/// display aliases, print columns, and sensitivity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceDefinition {
    pub type_: String,
    pub default_namespace: String,
    pub aliases: Vec<String>,
    pub print_columns: Vec<PrintColumn>,
    pub sensitivity: Sensitivity,
}

impl ResourceDefinition {
    /// Builds a definition, validating `type_` against the naming grammar and
    /// deriving its aliases.
    pub fn new(
        type_: impl Into<String>,
        default_namespace: impl Into<String>,
    ) -> Result<Self, NamingError> {
        let type_ = type_.into();
        validate_type(&type_)?;
        let aliases = derive_aliases(&type_);
        Ok(Self {
            type_,
            default_namespace: default_namespace.into(),
            aliases,
            print_columns: Vec::new(),
            sensitivity: Sensitivity::NonSensitive,
        })
    }
}

/// Errors from validating a canonical resource type name against the naming
/// grammar of §6: `^[A-Z][A-Za-z0-9-]+\.[a-z][a-z0-9-]+(\.[a-z][a-z0-9-]+)*$`,
/// with a plural name prefix.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NamingError {
    #[error("name is empty")]
    NameEmpty,
    #[error("missing suffix")]
    MissingSuffix,
    #[error("suffix is empty")]
    SuffixEmpty,
    #[error("name should be in CamelCase")]
    NotCamelCase,
    #[error("name doesn't match ^[A-Z][A-Za-z0-9-]+$")]
    NameMismatch,
    #[error("suffix doesn't match ^[a-z][a-z0-9-]+(\\.[a-z][a-z0-9-]+)*$")]
    SuffixMismatch,
    #[error("name should be plural")]
    NotPlural,
}

fn validate_type(type_: &str) -> Result<(), NamingError> {
    let Some((name, suffix)) = type_.split_once('.') else {
        if type_.is_empty() {
            return Err(NamingError::NameEmpty);
        }
        return Err(NamingError::MissingSuffix);
    };

    if name.is_empty() {
        return Err(NamingError::NameEmpty);
    }
    if suffix.is_empty() {
        return Err(NamingError::SuffixEmpty);
    }

    let starts_upper = name.chars().next().is_some_and(|c| c.is_ascii_uppercase());
    if !starts_upper {
        return Err(NamingError::NotCamelCase);
    }

    let name_ok = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-')
        && name.len() > 1;
    if !name_ok {
        return Err(NamingError::NameMismatch);
    }

    let suffix_ok = suffix.split('.').all(|part| {
        !part.is_empty()
            && part.chars().next().is_some_and(|c| c.is_ascii_lowercase())
            && part
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    });
    if !suffix_ok {
        return Err(NamingError::SuffixMismatch);
    }

    if !name.ends_with('s') {
        return Err(NamingError::NotPlural);
    }

    Ok(())
}

fn singularize(name: &str) -> &str {
    name.strip_suffix('s').unwrap_or(name)
}

fn acronym(name: &str) -> String {
    name.chars().filter(|c| c.is_ascii_uppercase()).collect()
}

/// Derives display aliases for a canonical type name: the lowercased
/// singular, progressively truncated domain suffixes, and an uppercase-letter
/// acronym (with a trailing "s" variant added when the plural name has one
/// the acronym itself lacks).
#[must_use]
pub fn derive_aliases(type_: &str) -> Vec<String> {
    let mut aliases = Vec::new();
    let Some((name, suffix)) = type_.split_once('.') else {
        return aliases;
    };

    aliases.push(singularize(name).to_lowercase());

    let parts: Vec<&str> = suffix.split('.').collect();
    for i in 0..parts.len() {
        aliases.push(parts[i..].join("."));
    }

    let ac = acronym(name);
    if !ac.is_empty() {
        aliases.push(ac.clone());
        if name.ends_with('s') && !ac.ends_with('s') {
            aliases.push(format!("{ac}s"));
        }
    }

    aliases.sort();
    aliases.dedup();
    aliases
}
