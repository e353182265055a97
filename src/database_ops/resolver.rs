use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::database_ops::image_index::{ImageIndex, ImageRecord, PrefixRange};
use crate::normalization::equivalence::{ColorMatcher, MatchReason};

/// One sellable `(model_ref, color)` variant, as authored in the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogVariant {
    pub model_ref: String,
    pub color: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

impl CatalogVariant {
    pub fn new(model_ref: impl Into<String>, color: impl Into<String>) -> Self {
        Self {
            model_ref: model_ref.into(),
            color: color.into(),
            extra: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchTier {
    Exact,
    PrefixColor,
    PrefixAny,
    None,
}

impl MatchTier {
    pub const ALL: [MatchTier; 4] = [
        MatchTier::Exact,
        MatchTier::PrefixColor,
        MatchTier::PrefixAny,
        MatchTier::None,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MatchTier::Exact => "EXACT",
            MatchTier::PrefixColor => "PREFIX_COLOR",
            MatchTier::PrefixAny => "PREFIX_ANY",
            MatchTier::None => "NONE",
        }
    }
}

impl fmt::Display for MatchTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One `(model_ref, color key)` the resolver considered. `reason` is `None`
/// for keys bundled without a color match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateMatch {
    pub model_ref: String,
    pub color_key: String,
    pub reason: Option<MatchReason>,
    pub image_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchResult {
    pub variant: CatalogVariant,
    pub images: Vec<ImageRecord>,
    pub tier: MatchTier,
    pub ambiguous: bool,
    pub candidates: Vec<CandidateMatch>,
    /// Size of the bundle before the fallback cap was applied.
    pub bundle_total: usize,
    /// Prefix length that produced the candidates, for prefix tiers.
    pub prefix_len: Option<usize>,
}

impl MatchResult {
    /// Anything the catalog should not trust without a human look.
    pub fn needs_review(&self) -> bool {
        self.tier != MatchTier::Exact || self.ambiguous
    }

    pub fn primary_image(&self) -> Option<&ImageRecord> {
        self.images.first()
    }

    pub fn is_truncated(&self) -> bool {
        self.bundle_total > self.images.len()
    }

    /// Distinct model refs among the candidates, sorted.
    pub fn candidate_models(&self) -> Vec<&str> {
        let mut models: Vec<&str> = self.candidates.iter().map(|c| c.model_ref.as_str()).collect();
        models.sort_unstable();
        models.dedup();
        models
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolverConfig {
    pub prefix: PrefixRange,
    /// Cap for every ambiguous bundle.
    pub max_fallback_images: usize,
    pub allow_prefix_any: bool,
    /// Model ref prefixes (brands) for which the PREFIX_ANY bundle is never produced.
    pub prefix_any_exclusions: Vec<String>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            prefix: PrefixRange::default(),
            max_fallback_images: 6,
            allow_prefix_any: true,
            prefix_any_exclusions: Vec::new(),
        }
    }
}

impl ResolverConfig {
    pub fn prefix_any_allowed_for(&self, model_ref: &str) -> bool {
        self.allow_prefix_any
            && !self
                .prefix_any_exclusions
                .iter()
                .map(|p| p.trim().to_uppercase())
                .any(|p| !p.is_empty() && model_ref.starts_with(&p))
    }
}

/// Color keys of one model ref that match a catalog color.
struct KeySelection {
    keys: Vec<(String, MatchReason)>,
    ambiguous: bool,
}

/// Read-only lookup over a built [`ImageIndex`]; safe to share across threads.
#[derive(Debug, Clone)]
pub struct Resolver {
    index: Arc<ImageIndex>,
    matcher: ColorMatcher,
    config: ResolverConfig,
}

impl Resolver {
    pub fn new(index: Arc<ImageIndex>, matcher: ColorMatcher, config: ResolverConfig) -> Self {
        Self {
            index,
            matcher,
            config,
        }
    }

    pub fn index(&self) -> &ImageIndex {
        &self.index
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    pub fn resolve(&self, model_ref: &str, color: &str) -> MatchResult {
        self.resolve_variant(&CatalogVariant::new(model_ref, color))
    }

    pub fn resolve_variant(&self, variant: &CatalogVariant) -> MatchResult {
        let model = variant.model_ref.trim().to_uppercase();
        let result = if self.index.contains_model(&model) {
            self.resolve_exact(variant, &model)
        } else {
            self.resolve_prefix(variant, &model)
        };
        debug!(
            target = "resolver",
            model_ref = %variant.model_ref,
            color = %variant.color,
            tier = %result.tier,
            ambiguous = result.ambiguous,
            images = result.images.len(),
            "resolved"
        );
        result
    }

    /// Resolve many variants in parallel; output order follows input order.
    pub fn resolve_all(&self, variants: &[CatalogVariant]) -> Vec<MatchResult> {
        variants.par_iter().map(|v| self.resolve_variant(v)).collect()
    }

    fn resolve_exact(&self, variant: &CatalogVariant, model: &str) -> MatchResult {
        let selection = self.select_keys(model, &variant.color);
        if selection.keys.is_empty() {
            // modelRef known, no color key fits: bundle everything, flagged
            let candidates: Vec<CandidateMatch> = self
                .index
                .colors_for(model)
                .map(|key| self.candidate(model, key, None))
                .collect();
            let images: Vec<ImageRecord> =
                self.index.all_images_for(model).into_iter().cloned().collect();
            return self.finish(variant, MatchTier::Exact, true, images, candidates, None);
        }

        let (images, candidates) = self.collect_selection(model, &selection, false);
        self.finish(
            variant,
            MatchTier::Exact,
            selection.ambiguous,
            images,
            candidates,
            None,
        )
    }

    fn resolve_prefix(&self, variant: &CatalogVariant, model: &str) -> MatchResult {
        let Some(hit) = self.index.prefix_index().candidates(model, self.config.prefix) else {
            return self.finish(variant, MatchTier::None, false, Vec::new(), Vec::new(), None);
        };

        let mut images = Vec::new();
        let mut candidates = Vec::new();
        let mut matched_models = 0usize;
        let mut any_ambiguous = false;
        for candidate in &hit.model_refs {
            let selection = self.select_keys(candidate, &variant.color);
            if selection.keys.is_empty() {
                continue;
            }
            matched_models += 1;
            any_ambiguous |= selection.ambiguous;
            let (imgs, cands) = self.collect_selection(candidate, &selection, true);
            images.extend(imgs);
            candidates.extend(cands);
        }

        if matched_models > 0 {
            // more than one model family color-matching is a conflict, never a pick
            let ambiguous = any_ambiguous || matched_models > 1;
            return self.finish(
                variant,
                MatchTier::PrefixColor,
                ambiguous,
                images,
                candidates,
                Some(hit.prefix_len),
            );
        }

        let mut bundle = Vec::new();
        for candidate in &hit.model_refs {
            for key in self.index.colors_for(candidate) {
                candidates.push(self.candidate(candidate, key, None));
            }
            bundle.extend(
                self.index
                    .all_images_for(candidate)
                    .into_iter()
                    .filter(|r| r.is_high_confidence())
                    .cloned(),
            );
        }

        if !self.config.prefix_any_allowed_for(model) {
            debug!(target = "resolver", model_ref = %model, "prefix-any disabled; reporting unmatched");
            return self.finish(
                variant,
                MatchTier::None,
                false,
                Vec::new(),
                candidates,
                Some(hit.prefix_len),
            );
        }
        self.finish(
            variant,
            MatchTier::PrefixAny,
            true,
            bundle,
            candidates,
            Some(hit.prefix_len),
        )
    }

    /// Strong matches (exact, normalized, base, synonym) are bundled together
    /// as one confident answer when the keys also match each other. Keys that
    /// disagree (`DBR01` next to `DBR02`) make the bundle ambiguous. Containment
    /// alone is confident only when a single key qualifies.
    fn select_keys(&self, model: &str, color: &str) -> KeySelection {
        let verdicts: Vec<(String, MatchReason)> = self
            .index
            .colors_for(model)
            .map(|key| (key.to_string(), self.matcher.compare(key, color).reason))
            .filter(|(_, reason)| reason.is_match())
            .collect();

        let strong: Vec<(String, MatchReason)> = verdicts
            .iter()
            .filter(|(_, r)| r.is_strong())
            .cloned()
            .collect();
        if !strong.is_empty() {
            let ambiguous = !self.keys_agree(&strong);
            if ambiguous {
                debug!(
                    target = "resolver",
                    model_ref = %model,
                    color = %color,
                    keys = strong.len(),
                    "strong keys disagree with each other"
                );
            }
            return KeySelection {
                keys: strong,
                ambiguous,
            };
        }
        let ambiguous = verdicts.len() > 1;
        KeySelection {
            keys: verdicts,
            ambiguous,
        }
    }

    fn keys_agree(&self, keys: &[(String, MatchReason)]) -> bool {
        keys.iter().enumerate().all(|(i, (a, _))| {
            keys[i + 1..]
                .iter()
                .all(|(b, _)| self.matcher.equivalent(a, b))
        })
    }

    fn collect_selection(
        &self,
        model: &str,
        selection: &KeySelection,
        high_only: bool,
    ) -> (Vec<ImageRecord>, Vec<CandidateMatch>) {
        let mut images = Vec::new();
        let mut candidates = Vec::with_capacity(selection.keys.len());
        for (key, reason) in &selection.keys {
            images.extend(
                self.index
                    .images_for(model, key)
                    .iter()
                    .filter(|r| !high_only || r.is_high_confidence())
                    .cloned(),
            );
            candidates.push(self.candidate(model, key, Some(*reason)));
        }
        (images, candidates)
    }

    fn candidate(&self, model: &str, key: &str, reason: Option<MatchReason>) -> CandidateMatch {
        CandidateMatch {
            model_ref: model.to_string(),
            color_key: key.to_string(),
            reason,
            image_count: self.index.images_for(model, key).len(),
        }
    }

    fn finish(
        &self,
        variant: &CatalogVariant,
        tier: MatchTier,
        ambiguous: bool,
        mut images: Vec<ImageRecord>,
        candidates: Vec<CandidateMatch>,
        prefix_len: Option<usize>,
    ) -> MatchResult {
        let bundle_total = images.len();
        if ambiguous {
            images.truncate(self.config.max_fallback_images);
        }
        MatchResult {
            variant: variant.clone(),
            images,
            tier,
            ambiguous,
            candidates,
            bundle_total,
            prefix_len,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database_ops::listing::RawImageEntry;
    use crate::normalization::filename::FilenameParser;

    fn index_of(filenames: &[&str]) -> Arc<ImageIndex> {
        let parser = FilenameParser::with_defaults();
        let records = filenames.iter().filter_map(|name| {
            let entry = RawImageEntry::new(*name, format!("cdn://{name}"));
            parser
                .parse(name)
                .ok()
                .map(|parsed| ImageRecord::from_parse(&entry, parsed))
        });
        Arc::new(ImageIndex::from_records(records))
    }

    fn resolver(filenames: &[&str]) -> Resolver {
        Resolver::new(
            index_of(filenames),
            ColorMatcher::with_default_synonyms(),
            ResolverConfig::default(),
        )
    }

    fn names(result: &MatchResult) -> Vec<&str> {
        result.images.iter().map(|r| r.filename.as_str()).collect()
    }

    #[test]
    fn synonym_color_bundles_every_view() {
        let r = resolver(&["PD760221_BLO_DITA_B.jpg", "PD760221_BLO_DITA_2.jpg"]);
        let result = r.resolve("PD760221", "BLACK");
        assert_eq!(result.tier, MatchTier::Exact);
        assert!(!result.ambiguous);
        assert!(!result.needs_review());
        assert_eq!(
            names(&result),
            vec!["PD760221_BLO_DITA_2.jpg", "PD760221_BLO_DITA_B.jpg"]
        );
        assert_eq!(result.candidates[0].reason, Some(MatchReason::Synonym));
    }

    #[test]
    fn lookup_is_case_insensitive_on_model_ref() {
        let r = resolver(&["PD760221_BLO_1.jpg"]);
        assert_eq!(r.resolve(" pd760221 ", "black").tier, MatchTier::Exact);
    }

    #[test]
    fn trailing_letter_falls_back_to_prefix_color() {
        let r = resolver(&["HBSE-325-0037_BLACK_1.jpg", "HBSE-325-0037_WHITE_1.jpg"]);
        let result = r.resolve("HBSE-325-0037A", "BLACK");
        assert_eq!(result.tier, MatchTier::PrefixColor);
        assert!(!result.ambiguous);
        assert_eq!(result.prefix_len, Some(7));
        assert_eq!(names(&result), vec!["HBSE-325-0037_BLACK_1.jpg"]);
    }

    #[test]
    fn stray_prefix_images_are_ambiguous_prefix_any() {
        let r = resolver(&["AB1113_BEIGE_1.jpg", "AB1114_RED_1.jpg", "AB1114_RED_2.jpg"]);
        for model in ["AB1111", "AB1112"] {
            let result = r.resolve(model, "NAVY");
            assert_eq!(result.tier, MatchTier::PrefixAny, "{model}");
            assert!(result.ambiguous);
            assert_eq!(result.images.len(), 3);
            assert_eq!(result.candidate_models(), vec!["AB1113", "AB1114"]);
        }
    }

    #[test]
    fn known_model_without_matching_color_is_flagged_and_capped() {
        let files: Vec<String> = (1..=9).map(|i| format!("PD1234_RED_{i}.jpg")).collect();
        let refs: Vec<&str> = files.iter().map(String::as_str).collect();
        let r = resolver(&refs);
        let result = r.resolve("PD1234", "GREEN");
        assert_eq!(result.tier, MatchTier::Exact);
        assert!(result.ambiguous);
        assert!(result.needs_review());
        assert_eq!(result.images.len(), 6);
        assert_eq!(result.bundle_total, 9);
        assert!(result.is_truncated());
        assert_eq!(result.candidates[0].reason, None);
    }

    #[test]
    fn competing_prefix_families_are_listed_not_picked() {
        let r = resolver(&["AB1113_NAVY_1.jpg", "AB1114_NVY_1.jpg"]);
        let result = r.resolve("AB1111", "NAVY");
        assert_eq!(result.tier, MatchTier::PrefixColor);
        assert!(result.ambiguous);
        assert_eq!(result.candidate_models(), vec!["AB1113", "AB1114"]);
        assert_eq!(result.images.len(), 2);
    }

    #[test]
    fn several_containment_keys_are_ambiguous() {
        let r = resolver(&["PD1234_NAVYBLUE_1.jpg", "PD1234_NAVYMEL_1.jpg"]);
        let result = r.resolve("PD1234", "NAV");
        assert_eq!(result.tier, MatchTier::Exact);
        assert!(result.ambiguous);
        assert_eq!(result.candidates.len(), 2);

        let single = resolver(&["PD1234_NAVYBLUE_1.jpg", "PD1234_RED_1.jpg"]);
        let result = single.resolve("PD1234", "NAV");
        assert!(!result.ambiguous);
        assert_eq!(names(&result), vec!["PD1234_NAVYBLUE_1.jpg"]);
    }

    #[test]
    fn low_confidence_models_never_feed_prefix_fallback() {
        let r = resolver(&["SUMMER_BANNER.jpg", "SUMMERS_BLACK.jpg"]);
        assert!(r.index().contains_model("SUMMER"));
        let result = r.resolve("SUMMERX", "BLACK");
        assert_eq!(result.tier, MatchTier::None);
        assert!(result.candidates.is_empty());
    }

    #[test]
    fn nothing_in_range_is_none() {
        let r = resolver(&["PD760221_BLO_1.jpg"]);
        let result = r.resolve("ZZ9999", "BLACK");
        assert_eq!(result.tier, MatchTier::None);
        assert!(!result.ambiguous);
        assert!(result.primary_image().is_none());
        assert!(result.needs_review());
    }

    #[test]
    fn prefix_any_can_be_disabled_per_brand() {
        let index = index_of(&["AB1113_BEIGE_1.jpg", "CD5553_BEIGE_1.jpg"]);
        let config = ResolverConfig {
            prefix_any_exclusions: vec!["ab".into()],
            ..ResolverConfig::default()
        };
        let r = Resolver::new(index, ColorMatcher::with_default_synonyms(), config);
        let excluded = r.resolve("AB1111", "NAVY");
        assert_eq!(excluded.tier, MatchTier::None);
        assert_eq!(excluded.candidate_models(), vec!["AB1113"]);
        assert_eq!(r.resolve("CD5551", "NAVY").tier, MatchTier::PrefixAny);
    }

    #[test]
    fn resolve_all_keeps_input_order() {
        let r = resolver(&["PD760221_BLO_1.jpg", "AB1113_BEIGE_1.jpg"]);
        let variants = vec![
            CatalogVariant::new("AB1111", "NAVY"),
            CatalogVariant::new("PD760221", "NOIR"),
            CatalogVariant::new("ZZ0000", "RED"),
        ];
        let tiers: Vec<MatchTier> = r.resolve_all(&variants).iter().map(|m| m.tier).collect();
        assert_eq!(tiers, vec![MatchTier::PrefixAny, MatchTier::Exact, MatchTier::None]);
    }

    #[test]
    fn differing_numeric_keys_under_one_model_are_ambiguous() {
        let r = resolver(&["PD1234_DBR01_1.jpg", "PD1234_DBR02_1.jpg"]);
        for color in ["DBR", "DARK BROWN"] {
            let result = r.resolve("PD1234", color);
            assert_eq!(result.tier, MatchTier::Exact, "{color}");
            assert!(result.ambiguous, "{color}");
            assert!(result.needs_review(), "{color}");
            assert_eq!(result.candidates.len(), 2);
            assert_eq!(
                names(&result),
                vec!["PD1234_DBR01_1.jpg", "PD1234_DBR02_1.jpg"]
            );
        }
        // an explicit code still picks its own key
        let result = r.resolve("PD1234", "DBR02");
        assert!(!result.ambiguous);
        assert_eq!(names(&result), vec!["PD1234_DBR02_1.jpg"]);
    }

    #[test]
    fn conflicting_keys_are_capped_like_any_ambiguous_bundle() {
        let mut files: Vec<String> = (1..=4).map(|i| format!("PD1234_DBR01_{i}.jpg")).collect();
        files.extend((1..=4).map(|i| format!("PD1234_DBR02_{i}.jpg")));
        let refs: Vec<&str> = files.iter().map(String::as_str).collect();
        let result = resolver(&refs).resolve("PD1234", "DBR");
        assert!(result.ambiguous);
        assert_eq!(result.images.len(), 6);
        assert_eq!(result.bundle_total, 8);
    }

    #[test]
    fn agreeing_synonym_keys_stay_confident() {
        let r = resolver(&["PD1234_BLO_1.jpg", "PD1234_BLACK_1.jpg"]);
        let result = r.resolve("PD1234", "NOIR");
        assert!(!result.ambiguous);
        assert_eq!(result.candidates.len(), 2);
        assert_eq!(names(&result), vec!["PD1234_BLACK_1.jpg", "PD1234_BLO_1.jpg"]);
    }

    #[test]
    fn differing_numeric_keys_under_prefix_candidate_are_ambiguous() {
        let r = resolver(&["AB1113_DBR01_1.jpg", "AB1113_DBR02_1.jpg"]);
        for color in ["DBR", "DARK BROWN"] {
            let result = r.resolve("AB1111", color);
            assert_eq!(result.tier, MatchTier::PrefixColor, "{color}");
            assert!(result.ambiguous, "{color}");
            assert_eq!(result.candidate_models(), vec!["AB1113"]);
            assert_eq!(result.candidates.len(), 2);
        }
    }

    #[test]
    fn tiers_serialize_screaming() {
        let json = serde_json::to_string(&MatchTier::PrefixColor).unwrap();
        assert_eq!(json, "\"PREFIX_COLOR\"");
    }
}
