//! Filename → `{model_ref, color_token, view_tag}` parsing.
//!
//! Parsing runs an ordered list of [`PatternRule`]s; the first rule that
//! claims a stem decides the outcome. The default list holds the delimited
//! `MODEL_COLOR_VIEW` convention shared by every vendor corpus seen so far;
//! vendor-specific conventions are added with [`FilenameParser::with_rule`]
//! instead of forking the parser.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How far a parse can be trusted for fuzzy lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ParseConfidence {
    /// Model ref has a plausible SKU shape.
    High,
    /// Indexed for exact lookups only, never a prefix-fallback candidate.
    Low,
}

impl ParseConfidence {
    pub fn for_model_ref(model_ref: &str) -> Self {
        if is_plausible_sku(model_ref) {
            ParseConfidence::High
        } else {
            ParseConfidence::Low
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ParseConfidence::High => "HIGH",
            ParseConfidence::Low => "LOW",
        }
    }

    pub fn from_db(raw: &str) -> Self {
        if raw.eq_ignore_ascii_case("HIGH") {
            ParseConfidence::High
        } else {
            ParseConfidence::Low
        }
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseFailure {
    #[error("filename is empty after cleanup")]
    Empty,
    #[error("no '_' or '-' delimiter")]
    NoDelimiter,
    #[error("fewer than two segments")]
    TooFewSegments,
    #[error("empty model reference")]
    EmptyModelRef,
    #[error("empty color token")]
    EmptyColor,
    #[error("no pattern rule recognised the filename")]
    Unrecognised,
}

impl ParseFailure {
    pub fn as_str(self) -> &'static str {
        match self {
            ParseFailure::Empty => "empty",
            ParseFailure::NoDelimiter => "no_delimiter",
            ParseFailure::TooFewSegments => "too_few_segments",
            ParseFailure::EmptyModelRef => "empty_model_ref",
            ParseFailure::EmptyColor => "empty_color",
            ParseFailure::Unrecognised => "unrecognised",
        }
    }

    pub fn from_db(raw: &str) -> Self {
        match raw.trim() {
            "empty" => ParseFailure::Empty,
            "no_delimiter" => ParseFailure::NoDelimiter,
            "too_few_segments" => ParseFailure::TooFewSegments,
            "empty_model_ref" => ParseFailure::EmptyModelRef,
            "empty_color" => ParseFailure::EmptyColor,
            _ => ParseFailure::Unrecognised,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedFilename {
    pub model_ref: String,
    pub color_token: String,
    pub view_tag: Option<String>,
    pub confidence: ParseConfidence,
    /// Name of the rule that produced this parse.
    pub rule: String,
}

impl ParsedFilename {
    /// Assemble a parse from raw segments, applying case folding and emptiness checks.
    pub fn from_segments(
        model: &str,
        color: &str,
        view: Option<String>,
        rule: &str,
    ) -> Result<Self, ParseFailure> {
        let model_ref = model.trim().to_uppercase();
        let color_token = color.trim().to_uppercase();
        if model_ref.is_empty() {
            return Err(ParseFailure::EmptyModelRef);
        }
        if color_token.is_empty() {
            return Err(ParseFailure::EmptyColor);
        }
        Ok(Self {
            confidence: ParseConfidence::for_model_ref(&model_ref),
            model_ref,
            color_token,
            view_tag: view.filter(|v| !v.trim().is_empty()),
            rule: rule.to_string(),
        })
    }
}

/// One filename convention.
pub trait PatternRule: Send + Sync {
    fn name(&self) -> &'static str;

    /// `None` when the rule does not recognise the stem, so the next rule gets a turn.
    fn apply(&self, stem: &str) -> Option<Result<ParsedFilename, ParseFailure>>;
}

/// `MODEL<d>COLOR[<d>VIEW...]` with `_` preferred over `-` as the delimiter.
#[derive(Debug, Default, Clone, Copy)]
pub struct DelimitedRule;

impl PatternRule for DelimitedRule {
    fn name(&self) -> &'static str {
        "delimited"
    }

    fn apply(&self, stem: &str) -> Option<Result<ParsedFilename, ParseFailure>> {
        Some(self.split(stem))
    }
}

impl DelimitedRule {
    fn split(&self, stem: &str) -> Result<ParsedFilename, ParseFailure> {
        let delimiter = if stem.contains('_') {
            '_'
        } else if stem.contains('-') {
            '-'
        } else {
            return Err(ParseFailure::NoDelimiter);
        };

        // consecutive delimiters collapse into one boundary
        let segments: Vec<&str> = stem
            .split(delimiter)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();
        if segments.len() < 2 {
            return Err(ParseFailure::TooFewSegments);
        }

        // A dash inside the model code itself: AB-12345-RED
        let model_width = if segments.len() >= 3
            && !is_plausible_sku(segments[0])
            && is_plausible_sku(&format!("{}{}", segments[0], segments[1]))
        {
            2
        } else {
            1
        };

        let joiner = delimiter.to_string();
        let model = segments[..model_width].join(&joiner);
        let color = segments[model_width];
        let view = if segments.len() > model_width + 1 {
            Some(segments[model_width + 1..].join(&joiner))
        } else {
            None
        };
        ParsedFilename::from_segments(&model, color, view, self.name())
    }
}

/// Ordered set of pattern rules.
pub struct FilenameParser {
    rules: Vec<Box<dyn PatternRule>>,
}

impl Default for FilenameParser {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl std::fmt::Debug for FilenameParser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilenameParser")
            .field("rules", &self.rule_names())
            .finish()
    }
}

impl FilenameParser {
    pub fn with_defaults() -> Self {
        Self {
            rules: vec![Box::new(DelimitedRule)],
        }
    }

    /// Insert a rule ahead of every rule already registered.
    pub fn with_rule(mut self, rule: impl PatternRule + 'static) -> Self {
        self.rules.insert(0, Box::new(rule));
        self
    }

    pub fn rule_names(&self) -> Vec<&'static str> {
        self.rules.iter().map(|r| r.name()).collect()
    }

    pub fn parse(&self, raw: &str) -> Result<ParsedFilename, ParseFailure> {
        let stem = clean_stem(raw);
        if stem.is_empty() {
            return Err(ParseFailure::Empty);
        }
        for rule in &self.rules {
            if let Some(outcome) = rule.apply(&stem) {
                return outcome;
            }
        }
        Err(ParseFailure::Unrecognised)
    }
}

/// Basename without extension and without invisible characters.
pub fn clean_stem(raw: &str) -> String {
    let visible: String = raw.chars().filter(|c| !is_invisible(*c)).collect();
    let base = visible
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(visible.as_str())
        .trim();
    strip_extension(base).trim().to_string()
}

fn strip_extension(name: &str) -> &str {
    match name.rsplit_once('.') {
        Some((stem, ext))
            if !ext.is_empty()
                && ext.len() <= 5
                && ext.chars().all(|c| c.is_ascii_alphanumeric()) =>
        {
            stem
        }
        _ => name,
    }
}

fn is_invisible(c: char) -> bool {
    matches!(
        c,
        '\u{200B}'..='\u{200F}' | '\u{2060}'..='\u{2064}' | '\u{FEFF}' | '\u{00AD}' | '\u{180E}'
    ) || c.is_control()
}

fn sku_shape() -> &'static Regex {
    static SHAPE: OnceLock<Regex> = OnceLock::new();
    SHAPE.get_or_init(|| Regex::new(r"^[A-Z]+[0-9]{4,}[A-Z]?$").expect("static regex"))
}

/// Letters, then at least four digits, then at most one letter.
///
/// Separators inside the code are ignored, so `HBSE-325-0037` qualifies.
pub fn is_plausible_sku(model_ref: &str) -> bool {
    let compact: String = model_ref
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_ascii_uppercase();
    sku_shape().is_match(&compact)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &str) -> Result<ParsedFilename, ParseFailure> {
        FilenameParser::with_defaults().parse(raw)
    }

    #[test]
    fn splits_model_color_and_view() {
        let p = parse("PD760221_BLO_DITA_B.jpg").unwrap();
        assert_eq!(p.model_ref, "PD760221");
        assert_eq!(p.color_token, "BLO");
        assert_eq!(p.view_tag.as_deref(), Some("DITA_B"));
        assert_eq!(p.confidence, ParseConfidence::High);
        assert_eq!(p.rule, "delimited");
    }

    #[test]
    fn prefers_underscore_over_dash() {
        let p = parse("HBSE-325-0037_BLACK_1.jpg").unwrap();
        assert_eq!(p.model_ref, "HBSE-325-0037");
        assert_eq!(p.color_token, "BLACK");
        assert_eq!(p.view_tag.as_deref(), Some("1"));
        assert_eq!(p.confidence, ParseConfidence::High);
    }

    #[test]
    fn dash_delimited_without_view() {
        let p = parse("ab1234-navy.png").unwrap();
        assert_eq!(p.model_ref, "AB1234");
        assert_eq!(p.color_token, "NAVY");
        assert_eq!(p.view_tag, None);
    }

    #[test]
    fn resplits_when_model_contains_the_delimiter() {
        let p = parse("AB-12345-RED-front.jpg").unwrap();
        assert_eq!(p.model_ref, "AB-12345");
        assert_eq!(p.color_token, "RED");
        assert_eq!(p.view_tag.as_deref(), Some("front"));
    }

    #[test]
    fn keeps_first_split_when_joined_segments_are_not_a_sku() {
        let p = parse("BAG-RED-2.jpg").unwrap();
        assert_eq!(p.model_ref, "BAG");
        assert_eq!(p.color_token, "RED");
        assert_eq!(p.confidence, ParseConfidence::Low);
    }

    #[test]
    fn collapses_consecutive_delimiters() {
        let p = parse("PD760221__BLO___2.jpg").unwrap();
        assert_eq!(p.model_ref, "PD760221");
        assert_eq!(p.color_token, "BLO");
        assert_eq!(p.view_tag.as_deref(), Some("2"));
    }

    #[test]
    fn strips_invisible_characters_and_directories() {
        let p = parse("uploads/2024/\u{200B}PD760221_\u{FEFF}BLO.JPG").unwrap();
        assert_eq!(p.model_ref, "PD760221");
        assert_eq!(p.color_token, "BLO");
    }

    #[test]
    fn reports_failures() {
        assert_eq!(parse("PD760221.jpg"), Err(ParseFailure::NoDelimiter));
        assert_eq!(parse("PD760221_.jpg"), Err(ParseFailure::TooFewSegments));
        assert_eq!(parse("___.jpg"), Err(ParseFailure::TooFewSegments));
        assert_eq!(parse(".jpg"), Err(ParseFailure::Empty));
        assert_eq!(parse("\u{200B}"), Err(ParseFailure::Empty));
    }

    #[test]
    fn low_confidence_for_non_sku_models() {
        let p = parse("summer_banner_wide.jpg").unwrap();
        assert_eq!(p.model_ref, "SUMMER");
        assert_eq!(p.confidence, ParseConfidence::Low);
    }

    #[test]
    fn plausible_sku_shape() {
        assert!(is_plausible_sku("PD760221"));
        assert!(is_plausible_sku("HBSE-325-0037A"));
        assert!(is_plausible_sku("ab1111"));
        assert!(!is_plausible_sku("AB123"));
        assert!(!is_plausible_sku("760221"));
        assert!(!is_plausible_sku("AB1234XY"));
    }

    #[test]
    fn extension_only_stripped_when_it_looks_like_one() {
        assert_eq!(clean_stem("PD1234_BLK.jpeg"), "PD1234_BLK");
        assert_eq!(clean_stem("PD1234_BLK.v2 final"), "PD1234_BLK.v2 final");
    }

    struct SpaceRule;

    impl PatternRule for SpaceRule {
        fn name(&self) -> &'static str {
            "space"
        }

        fn apply(&self, stem: &str) -> Option<Result<ParsedFilename, ParseFailure>> {
            let (model, color) = stem.split_once(' ')?;
            Some(ParsedFilename::from_segments(model, color, None, self.name()))
        }
    }

    #[test]
    fn custom_rules_run_first() {
        let parser = FilenameParser::with_defaults().with_rule(SpaceRule);
        assert_eq!(parser.rule_names(), vec!["space", "delimited"]);
        let p = parser.parse("PD760221 NAVY.jpg").unwrap();
        assert_eq!(p.rule, "space");
        assert_eq!(p.color_token, "NAVY");
        // falls through to the default rule when the custom one does not apply
        assert_eq!(parser.parse("PD760221_NAVY.jpg").unwrap().rule, "delimited");
    }
}
