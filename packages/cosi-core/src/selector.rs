//! The selector algebra: ID regex matching plus label term queries.
//!
//! Grounded on the cursor/predicate idiom of `storage/engine.rs`'s
//! `IterationCursor`, generalized into a standalone predicate value so a
//! collection's watch machinery can evaluate "does this resource match" at
//! transition time without re-running a full query.

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::metadata::Metadata;

/// Matches resources by `id`, optionally narrowed by a regular expression.
#[derive(Debug, Clone)]
pub struct IdQuery {
    regex: Option<Regex>,
}

impl IdQuery {
    #[must_use]
    pub fn any() -> Self {
        Self { regex: None }
    }

    pub fn matching(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            regex: Some(Regex::new(pattern)?),
        })
    }

    #[must_use]
    pub fn matches(&self, id: &str) -> bool {
        self.regex.as_ref().is_none_or(|re| re.is_match(id))
    }
}

impl Default for IdQuery {
    fn default() -> Self {
        Self::any()
    }
}

impl PartialEq for IdQuery {
    fn eq(&self, other: &Self) -> bool {
        self.regex.as_ref().map(Regex::as_str) == other.regex.as_ref().map(Regex::as_str)
    }
}
impl Eq for IdQuery {}

/// The comparison a [`LabelTerm`] applies between a label's stored value(s)
/// and `values`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LabelOp {
    /// The label key is present, regardless of value.
    Exists,
    /// The label's value equals `values[0]`.
    Equal,
    /// The label's value is one of `values`.
    In,
    /// The label's value, compared lexicographically, is `<= values[0]`.
    LTE,
    /// As `LTE`, but strictly `<`.
    LT,
    /// The label's value, parsed as a number (with an optional binary or
    /// decimal unit suffix, e.g. `"4GB"`, `"5GiB"`), is `<= values[0]`.
    LTENumeric,
    /// As `LTENumeric`, but strictly `<`.
    LTNumeric,
}

/// A single label predicate: `key <op> values`, optionally inverted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelTerm {
    pub key: String,
    pub op: LabelOp,
    pub values: Vec<String>,
    pub invert: bool,
}

impl LabelTerm {
    #[must_use]
    pub fn exists(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            op: LabelOp::Exists,
            values: Vec::new(),
            invert: false,
        }
    }

    #[must_use]
    pub fn equal(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            op: LabelOp::Equal,
            values: vec![value.into()],
            invert: false,
        }
    }

    #[must_use]
    pub fn in_(key: impl Into<String>, values: Vec<String>) -> Self {
        Self {
            key: key.into(),
            op: LabelOp::In,
            values,
            invert: false,
        }
    }

    #[must_use]
    pub fn lte(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            op: LabelOp::LTE,
            values: vec![value.into()],
            invert: false,
        }
    }

    #[must_use]
    pub fn lt(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            op: LabelOp::LT,
            values: vec![value.into()],
            invert: false,
        }
    }

    #[must_use]
    pub fn lte_numeric(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            op: LabelOp::LTENumeric,
            values: vec![value.into()],
            invert: false,
        }
    }

    #[must_use]
    pub fn lt_numeric(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            op: LabelOp::LTNumeric,
            values: vec![value.into()],
            invert: false,
        }
    }

    #[must_use]
    pub fn inverted(mut self) -> Self {
        self.invert = !self.invert;
        self
    }

    /// Evaluates this term against a resource's metadata.
    ///
    /// `invert` flips the outcome for every op -- except that when the key is
    /// entirely absent, `Equal`/`In`/the comparison ops short-circuit to
    /// "does not match" without consulting `invert`; only `Exists` lets
    /// `invert` turn an absent key into a match.
    #[must_use]
    pub fn matches(&self, metadata: &Metadata) -> bool {
        match self.op {
            LabelOp::Exists => {
                let present = metadata.labels().contains_key(&self.key);
                present != self.invert
            }
            LabelOp::Equal => match metadata.labels().get(&self.key) {
                None => false,
                Some(v) => {
                    let eq = self.values.first().is_some_and(|want| want == v);
                    eq != self.invert
                }
            },
            LabelOp::In => match metadata.labels().get(&self.key) {
                None => false,
                Some(v) => {
                    let is_in = self.values.iter().any(|want| want == v);
                    is_in != self.invert
                }
            },
            LabelOp::LTE => self.lex_compare(metadata, |stored, want| stored <= want),
            LabelOp::LT => self.lex_compare(metadata, |stored, want| stored < want),
            LabelOp::LTENumeric => self.numeric_compare(metadata, |stored, want| stored <= want),
            LabelOp::LTNumeric => self.numeric_compare(metadata, |stored, want| stored < want),
        }
    }

    fn lex_compare(&self, metadata: &Metadata, cmp: impl Fn(&str, &str) -> bool) -> bool {
        let Some(stored) = metadata.labels().get(&self.key) else {
            return false;
        };
        let Some(want) = self.values.first() else {
            return false;
        };
        cmp(stored, want) != self.invert
    }

    fn numeric_compare(&self, metadata: &Metadata, cmp: impl Fn(f64, f64) -> bool) -> bool {
        let Some(stored_raw) = metadata.labels().get(&self.key) else {
            return false;
        };
        let Some(want_raw) = self.values.first() else {
            return false;
        };
        let (Some(stored), Some(want)) = (parse_quantity(stored_raw), parse_quantity(want_raw))
        else {
            return false;
        };
        cmp(stored, want) != self.invert
    }
}

/// A conjunction of [`LabelTerm`]s: a resource matches only if every term
/// (after its own `invert`) matches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelQuery {
    pub terms: Vec<LabelTerm>,
}

impl LabelQuery {
    #[must_use]
    pub fn new(terms: Vec<LabelTerm>) -> Self {
        Self { terms }
    }

    #[must_use]
    pub fn matches(&self, metadata: &Metadata) -> bool {
        self.terms.iter().all(|term| term.matches(metadata))
    }
}

/// A disjunction of [`LabelQuery`] conjunctions: a resource matches if any
/// alternative matches. An empty disjunction matches everything.
#[must_use]
pub fn matches_any(alternatives: &[LabelQuery], metadata: &Metadata) -> bool {
    alternatives.is_empty() || alternatives.iter().any(|q| q.matches(metadata))
}

/// Parses a numeric string with an optional decimal (`k, M, G, T`) or binary
/// (`Ki, Mi, Gi, Ti`) unit suffix into a plain `f64`, e.g. `"4GB"` -> `4e9`,
/// `"5GiB"` -> `5 * 2^30`. A bare number parses as itself.
fn parse_quantity(raw: &str) -> Option<f64> {
    let raw = raw.trim();
    const BINARY: &[(&str, f64)] = &[
        ("Ki", 1024.0),
        ("Mi", 1024.0f64.powi(2)),
        ("Gi", 1024.0f64.powi(3)),
        ("Ti", 1024.0f64.powi(4)),
    ];
    const DECIMAL: &[(&str, f64)] = &[
        ("k", 1e3),
        ("K", 1e3),
        ("M", 1e6),
        ("G", 1e9),
        ("T", 1e12),
    ];

    for (suffix, factor) in BINARY {
        if let Some(stripped) = strip_unit(raw, suffix) {
            return stripped.parse::<f64>().ok().map(|n| n * factor);
        }
    }
    for (suffix, factor) in DECIMAL {
        if let Some(stripped) = strip_unit(raw, suffix) {
            return stripped.parse::<f64>().ok().map(|n| n * factor);
        }
    }
    raw.parse::<f64>().ok()
}

/// Strips `suffix` from `raw`, additionally tolerating one trailing `B`
/// (`"GB"`, `"GiB"`) as a no-op byte-unit marker.
fn strip_unit<'a>(raw: &'a str, suffix: &str) -> Option<&'a str> {
    let with_b = format!("{suffix}B");
    if let Some(stripped) = raw.strip_suffix(with_b.as_str()) {
        return Some(stripped);
    }
    raw.strip_suffix(suffix)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn md_with_label(key: &str, value: &str) -> Metadata {
        let mut md = Metadata::new("default", "T", "x");
        md.labels_mut().set(key, value);
        md
    }

    #[test]
    fn id_query_any_matches_everything() {
        assert!(IdQuery::any().matches("anything"));
    }

    #[test]
    fn id_query_regex_matches_prefix() {
        let q = IdQuery::matching("^web-").unwrap();
        assert!(q.matches("web-1"));
        assert!(!q.matches("db-1"));
    }

    #[test]
    fn exists_term() {
        let md = md_with_label("app", "web");
        assert!(LabelTerm::exists("app").matches(&md));
        assert!(!LabelTerm::exists("missing").matches(&md));
    }

    #[test]
    fn equal_term() {
        let md = md_with_label("app", "web");
        assert!(LabelTerm::equal("app", "web").matches(&md));
        assert!(!LabelTerm::equal("app", "db").matches(&md));
    }

    #[test]
    fn in_term() {
        let md = md_with_label("app", "web");
        assert!(LabelTerm::in_("app", vec!["web".into(), "db".into()]).matches(&md));
        assert!(!LabelTerm::in_("app", vec!["cache".into()]).matches(&md));
    }

    #[test]
    fn inverted_term_flips_result() {
        let md = md_with_label("app", "web");
        assert!(!LabelTerm::equal("app", "web").inverted().matches(&md));
        assert!(LabelTerm::equal("app", "db").inverted().matches(&md));
    }

    #[test]
    fn numeric_decimal_suffix() {
        let md = md_with_label("mem", "4GB");
        assert!(LabelTerm::lte_numeric("mem", "5GB").matches(&md));
        assert!(!LabelTerm::lt_numeric("mem", "4GB").matches(&md));
    }

    #[test]
    fn numeric_binary_suffix() {
        let md = md_with_label("mem", "4GiB");
        let four_gib = 4.0 * 1024.0f64.powi(3);
        let want = (four_gib + 1.0).to_string();
        assert!(LabelTerm::lte_numeric("mem", want).matches(&md));
    }

    #[test]
    fn numeric_missing_label_never_matches() {
        let md = Metadata::new("default", "T", "x");
        assert!(!LabelTerm::lte_numeric("mem", "1").matches(&md));
    }

    #[test]
    fn lexicographic_comparison() {
        let md = md_with_label("tier", "bronze");
        assert!(LabelTerm::lte("tier", "bronze").matches(&md));
        assert!(LabelTerm::lte("tier", "silver").matches(&md));
        assert!(!LabelTerm::lt("tier", "bronze").matches(&md));
    }

    #[test]
    fn missing_key_short_circuits_to_false_regardless_of_invert_except_exists() {
        let md = Metadata::new("default", "T", "x");
        // Exists + invert on an absent key: the one case that matches.
        assert!(LabelTerm::exists("missing").inverted().matches(&md));
        // Every other op on an absent key stays false even when inverted.
        assert!(!LabelTerm::equal("missing", "v").inverted().matches(&md));
        assert!(!LabelTerm::in_("missing", vec!["v".into()]).inverted().matches(&md));
        assert!(!LabelTerm::lte("missing", "v").inverted().matches(&md));
        assert!(!LabelTerm::lte_numeric("missing", "1").inverted().matches(&md));
    }

    #[test]
    fn label_query_is_conjunction() {
        let mut md = md_with_label("app", "web");
        md.labels_mut().set("tier", "frontend");
        let q = LabelQuery::new(vec![
            LabelTerm::equal("app", "web"),
            LabelTerm::equal("tier", "backend"),
        ]);
        assert!(!q.matches(&md));
    }

    #[test]
    fn matches_any_is_disjunction_and_empty_matches_all() {
        let md = md_with_label("app", "web");
        assert!(matches_any(&[], &md));
        let alts = vec![
            LabelQuery::new(vec![LabelTerm::equal("app", "db")]),
            LabelQuery::new(vec![LabelTerm::equal("app", "web")]),
        ];
        assert!(matches_any(&alts, &md));
    }
}
