use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::color::NormalizedColor;
use super::synonyms::SynonymTable;

/// Why two color tokens were (or were not) judged equivalent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchReason {
    Exact,
    NormalizedExact,
    /// Same base, at most one side carries a numeric code.
    BaseMatch,
    Synonym,
    PrefixContainment,
    /// Both sides carry a numeric code and the codes differ.
    NumericMismatch,
    NoMatch,
}

impl MatchReason {
    pub fn is_match(self) -> bool {
        matches!(
            self,
            MatchReason::Exact
                | MatchReason::NormalizedExact
                | MatchReason::BaseMatch
                | MatchReason::Synonym
                | MatchReason::PrefixContainment
        )
    }

    /// Matches that identify the color on their own, without the containment heuristic.
    pub fn is_strong(self) -> bool {
        matches!(
            self,
            MatchReason::Exact
                | MatchReason::NormalizedExact
                | MatchReason::BaseMatch
                | MatchReason::Synonym
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MatchReason::Exact => "exact",
            MatchReason::NormalizedExact => "normalized_exact",
            MatchReason::BaseMatch => "base_match",
            MatchReason::Synonym => "synonym",
            MatchReason::PrefixContainment => "prefix_containment",
            MatchReason::NumericMismatch => "numeric_mismatch",
            MatchReason::NoMatch => "no_match",
        }
    }
}

impl fmt::Display for MatchReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColorVerdict {
    pub equivalent: bool,
    pub reason: MatchReason,
}

impl ColorVerdict {
    fn accept(reason: MatchReason) -> Self {
        Self {
            equivalent: true,
            reason,
        }
    }

    fn reject(reason: MatchReason) -> Self {
        Self {
            equivalent: false,
            reason,
        }
    }
}

/// Decides whether an image color token and a catalog color denote the same color.
///
/// Every rule is symmetric, so `compare(a, b)` and `compare(b, a)` always agree.
#[derive(Debug, Clone)]
pub struct ColorMatcher {
    synonyms: Arc<SynonymTable>,
}

impl ColorMatcher {
    /// Shortest base accepted by the containment rule.
    pub const CONTAINMENT_MIN_LEN: usize = 2;
    /// Longest base accepted by the containment rule.
    pub const CONTAINMENT_MAX_LEN: usize = 4;

    pub fn new(synonyms: Arc<SynonymTable>) -> Self {
        Self { synonyms }
    }

    pub fn with_default_synonyms() -> Self {
        Self::new(Arc::new(SynonymTable::with_defaults()))
    }

    pub fn synonyms(&self) -> &SynonymTable {
        &self.synonyms
    }

    pub fn equivalent(&self, a: &str, b: &str) -> bool {
        self.compare(a, b).equivalent
    }

    /// Decision order: exact, normalized-exact, numeric gate, base, synonym, containment.
    pub fn compare(&self, a: &str, b: &str) -> ColorVerdict {
        let raw_a = a.trim().to_uppercase();
        let raw_b = b.trim().to_uppercase();
        if raw_a.is_empty() || raw_b.is_empty() {
            return ColorVerdict::reject(MatchReason::NoMatch);
        }
        if raw_a == raw_b {
            return ColorVerdict::accept(MatchReason::Exact);
        }

        let na = NormalizedColor::new(&raw_a);
        let nb = NormalizedColor::new(&raw_b);
        if na.is_empty() || nb.is_empty() {
            return ColorVerdict::reject(MatchReason::NoMatch);
        }
        if na == nb {
            return ColorVerdict::accept(MatchReason::NormalizedExact);
        }

        // A numeric color code outranks any textual similarity.
        if na.has_numeric() && nb.has_numeric() && na.numeric_suffix() != nb.numeric_suffix() {
            return ColorVerdict::reject(MatchReason::NumericMismatch);
        }
        if !na.base().is_empty() && na.base() == nb.base() {
            return ColorVerdict::accept(MatchReason::BaseMatch);
        }

        if self.synonym_match(&na, &nb) {
            return ColorVerdict::accept(MatchReason::Synonym);
        }

        if contained(&na, &nb) || contained(&nb, &na) {
            return ColorVerdict::accept(MatchReason::PrefixContainment);
        }

        ColorVerdict::reject(MatchReason::NoMatch)
    }

    fn synonym_match(&self, a: &NormalizedColor, b: &NormalizedColor) -> bool {
        let canon_a = self.canonical(a);
        let canon_b = self.canonical(b);
        let names_a = names(a);
        let names_b = names(b);

        if let Some(ca) = canon_a {
            if names_b.iter().any(|n| n == ca) {
                return true;
            }
        }
        if let Some(cb) = canon_b {
            if names_a.iter().any(|n| n == cb) {
                return true;
            }
        }
        matches!((canon_a, canon_b), (Some(ca), Some(cb)) if ca == cb)
    }

    /// Canonical name for the base, falling back to the compact token (`C04` style codes).
    fn canonical(&self, color: &NormalizedColor) -> Option<&str> {
        if !color.base().is_empty() {
            if let Some(c) = self.synonyms.canonical_for(color.base()) {
                return Some(c);
            }
        }
        self.synonyms.canonical_for(&color.compact())
    }
}

fn names(color: &NormalizedColor) -> Vec<String> {
    let mut out = Vec::with_capacity(2);
    if !color.base().is_empty() {
        out.push(color.base().to_string());
    }
    if color.has_numeric() {
        out.push(color.compact());
    }
    out
}

/// `short` has a base inside the containment band that appears in `long`.
fn contained(short: &NormalizedColor, long: &NormalizedColor) -> bool {
    let short_base = short.base();
    let len = short_base.chars().count();
    if !(ColorMatcher::CONTAINMENT_MIN_LEN..=ColorMatcher::CONTAINMENT_MAX_LEN).contains(&len) {
        return false;
    }
    let long_base = long.base();
    if long_base.chars().count() <= len {
        return false;
    }
    long.compact().contains(short_base)
}
