//! In-memory image index: `model_ref → color → [ImageRecord]` plus a sorted
//! prefix index over high-confidence model refs.
//!
//! The index is a pure function of its record set: records are keyed by
//! `filename`, every per-key list is kept sorted by filename, and inserting a
//! record whose filename is already present replaces the old one. Building the
//! same record set in any order (or from any split into partial indexes)
//! therefore yields an identical index and an identical [`ImageIndex::fingerprint`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::database_ops::listing::RawImageEntry;
use crate::error::ReconcileError;
use crate::normalization::filename::{ParseConfidence, ParseFailure, ParsedFilename};

/// One physical image file, as parsed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageRecord {
    pub filename: String,
    pub raw_model_ref: String,
    pub raw_color: String,
    pub view_tag: Option<String>,
    pub storage_locator: String,
    pub parse_confidence: ParseConfidence,
}

impl ImageRecord {
    pub fn from_parse(entry: &RawImageEntry, parsed: ParsedFilename) -> Self {
        Self {
            filename: entry.filename.clone(),
            raw_model_ref: parsed.model_ref,
            raw_color: parsed.color_token,
            view_tag: parsed.view_tag,
            storage_locator: entry.storage_locator.clone(),
            parse_confidence: parsed.confidence,
        }
    }

    pub fn is_high_confidence(&self) -> bool {
        self.parse_confidence == ParseConfidence::High
    }
}

/// An image the parser could not place; kept for manual review.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnparsedImage {
    pub filename: String,
    pub storage_locator: String,
    pub reason: ParseFailure,
}

/// Inclusive band of prefix lengths tried by the fallback lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrefixRange {
    pub min: usize,
    pub max: usize,
}

impl Default for PrefixRange {
    fn default() -> Self {
        Self { min: 5, max: 7 }
    }
}

impl PrefixRange {
    pub fn new(min: usize, max: usize) -> Result<Self, ReconcileError> {
        if min == 0 || min > max {
            return Err(ReconcileError::Config(format!(
                "prefix range must satisfy 1 <= min <= max (got min={min}, max={max})"
            )));
        }
        Ok(Self { min, max })
    }
}

/// Result of a longest-prefix lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrefixHit {
    pub prefix_len: usize,
    pub prefix: String,
    pub model_refs: Vec<String>,
}

/// Sorted distinct model refs eligible as prefix-fallback candidates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PrefixIndex {
    model_refs: Vec<String>,
}

impl PrefixIndex {
    pub fn len(&self) -> usize {
        self.model_refs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.model_refs.is_empty()
    }

    pub fn contains(&self, model_ref: &str) -> bool {
        self.model_refs
            .binary_search_by(|m| m.as_str().cmp(model_ref))
            .is_ok()
    }

    fn insert(&mut self, model_ref: &str) {
        if let Err(pos) = self
            .model_refs
            .binary_search_by(|m| m.as_str().cmp(model_ref))
        {
            self.model_refs.insert(pos, model_ref.to_string());
        }
    }

    fn remove(&mut self, model_ref: &str) {
        if let Ok(pos) = self
            .model_refs
            .binary_search_by(|m| m.as_str().cmp(model_ref))
        {
            self.model_refs.remove(pos);
        }
    }

    /// Contiguous run of model refs starting with `prefix`.
    pub fn with_prefix(&self, prefix: &str) -> &[String] {
        let start = self.model_refs.partition_point(|m| m.as_str() < prefix);
        let len = self.model_refs[start..].partition_point(|m| m.starts_with(prefix));
        &self.model_refs[start..start + len]
    }

    /// Longest-prefix candidates for `query`: lengths from `min(range.max, len-1)`
    /// down to `range.min`, stopping at the first length with any model ref other
    /// than the query itself. Candidates from different lengths are never merged.
    pub fn candidates(&self, query: &str, range: PrefixRange) -> Option<PrefixHit> {
        let query = query.trim().to_uppercase();
        let char_len = query.chars().count();
        if char_len < 2 {
            return None;
        }
        let upper = range.max.min(char_len - 1);
        if upper < range.min {
            return None;
        }
        for prefix_len in (range.min..=upper).rev() {
            let prefix: String = query.chars().take(prefix_len).collect();
            let model_refs: Vec<String> = self
                .with_prefix(&prefix)
                .iter()
                .filter(|m| **m != query)
                .cloned()
                .collect();
            if !model_refs.is_empty() {
                return Some(PrefixHit {
                    prefix_len,
                    prefix,
                    model_refs,
                });
            }
        }
        None
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ImageIndex {
    exact: BTreeMap<String, BTreeMap<String, Vec<ImageRecord>>>,
    prefix: PrefixIndex,
    #[serde(skip)]
    locations: BTreeMap<String, (String, String)>,
    #[serde(skip)]
    high_counts: BTreeMap<String, usize>,
}

impl PartialEq for ImageIndex {
    fn eq(&self, other: &Self) -> bool {
        self.exact == other.exact && self.prefix == other.prefix
    }
}

impl Eq for ImageIndex {}

impl ImageIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records(records: impl IntoIterator<Item = ImageRecord>) -> Self {
        let mut index = Self::new();
        for record in records {
            index.insert(record);
        }
        index
    }

    /// Deterministic merge of partial indexes built in parallel.
    ///
    /// Equivalent to concatenating every per-key list, stable-sorting by filename
    /// and keeping the last record seen for a repeated filename.
    pub fn merge(partials: impl IntoIterator<Item = ImageIndex>) -> Self {
        let mut merged = Self::new();
        for partial in partials {
            for (_, colors) in partial.exact {
                for (_, records) in colors {
                    for record in records {
                        merged.insert(record);
                    }
                }
            }
        }
        merged
    }

    /// Upsert keyed by filename. Returns the record that was replaced, if any.
    pub fn insert(&mut self, record: ImageRecord) -> Option<ImageRecord> {
        let replaced = self.remove(&record.filename);

        let model = record.raw_model_ref.clone();
        let color = record.raw_color.clone();
        if record.is_high_confidence() {
            let count = self.high_counts.entry(model.clone()).or_insert(0);
            *count += 1;
            if *count == 1 {
                self.prefix.insert(&model);
            }
        }
        self.locations
            .insert(record.filename.clone(), (model.clone(), color.clone()));

        let list = self.exact.entry(model).or_default().entry(color).or_default();
        let pos = list.partition_point(|r| r.filename < record.filename);
        list.insert(pos, record);
        replaced
    }

    pub fn remove(&mut self, filename: &str) -> Option<ImageRecord> {
        let (model, color) = self.locations.remove(filename)?;
        let colors = self.exact.get_mut(&model)?;
        let list = colors.get_mut(&color)?;
        let pos = list.iter().position(|r| r.filename == filename)?;
        let removed = list.remove(pos);
        if list.is_empty() {
            colors.remove(&color);
        }
        if colors.is_empty() {
            self.exact.remove(&model);
        }
        if removed.is_high_confidence() {
            if let Some(count) = self.high_counts.get_mut(&model) {
                *count -= 1;
                if *count == 0 {
                    self.high_counts.remove(&model);
                    self.prefix.remove(&model);
                }
            }
        }
        Some(removed)
    }

    pub fn get(&self, filename: &str) -> Option<&ImageRecord> {
        let (model, color) = self.locations.get(filename)?;
        self.images_for(model, color)
            .iter()
            .find(|r| r.filename == filename)
    }

    pub fn contains_model(&self, model_ref: &str) -> bool {
        self.exact.contains_key(model_ref)
    }

    pub fn model_refs(&self) -> impl Iterator<Item = &str> {
        self.exact.keys().map(String::as_str)
    }

    /// Color keys under a model ref, sorted.
    pub fn colors_for(&self, model_ref: &str) -> impl Iterator<Item = &str> {
        self.exact
            .get(model_ref)
            .into_iter()
            .flat_map(|colors| colors.keys().map(String::as_str))
    }

    pub fn images_for(&self, model_ref: &str, color: &str) -> &[ImageRecord] {
        self.exact
            .get(model_ref)
            .and_then(|colors| colors.get(color))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Every image under a model ref, ordered by color key then filename.
    pub fn all_images_for(&self, model_ref: &str) -> Vec<&ImageRecord> {
        self.exact
            .get(model_ref)
            .map(|colors| colors.values().flatten().collect())
            .unwrap_or_default()
    }

    pub fn prefix_index(&self) -> &PrefixIndex {
        &self.prefix
    }

    /// All records in `(model_ref, color, filename)` order.
    pub fn records(&self) -> impl Iterator<Item = &ImageRecord> {
        self.exact.values().flat_map(|colors| colors.values().flatten())
    }

    pub fn record_count(&self) -> usize {
        self.locations.len()
    }

    pub fn model_count(&self) -> usize {
        self.exact.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locations.is_empty()
    }

    /// SHA-256 over the canonical JSON form of the index.
    pub fn fingerprint(&self) -> String {
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        format!("{:x}", Sha256::digest(&bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalization::filename::FilenameParser;
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::SeedableRng;

    fn record(filename: &str) -> ImageRecord {
        let entry = RawImageEntry::new(filename, format!("s3://bucket/{filename}"));
        let parsed = FilenameParser::with_defaults().parse(filename).unwrap();
        ImageRecord::from_parse(&entry, parsed)
    }

    fn sample() -> Vec<ImageRecord> {
        [
            "PD760221_BLO_DITA_B.jpg",
            "PD760221_BLO_DITA_2.jpg",
            "PD760221_WHT_1.jpg",
            "HBSE-325-0037_BLACK_1.jpg",
            "summer_banner.jpg",
            "AB1113_RED_1.jpg",
        ]
        .into_iter()
        .map(record)
        .collect()
    }

    #[test]
    fn keeps_every_image_per_key() {
        let index = ImageIndex::from_records(sample());
        let blo = index.images_for("PD760221", "BLO");
        assert_eq!(blo.len(), 2);
        assert_eq!(blo[0].filename, "PD760221_BLO_DITA_2.jpg");
        assert_eq!(blo[1].filename, "PD760221_BLO_DITA_B.jpg");
        assert_eq!(index.record_count(), 6);
        assert_eq!(index.colors_for("PD760221").collect::<Vec<_>>(), vec!["BLO", "WHT"]);
        for r in sample() {
            assert!(index
                .images_for(&r.raw_model_ref, &r.raw_color)
                .iter()
                .any(|x| x.filename == r.filename));
        }
    }

    #[test]
    fn low_confidence_models_stay_out_of_prefix_index() {
        let index = ImageIndex::from_records(sample());
        assert!(index.contains_model("SUMMER"));
        assert!(!index.prefix_index().contains("SUMMER"));
        assert!(index.prefix_index().contains("PD760221"));
        assert_eq!(index.prefix_index().len(), 3);
    }

    #[test]
    fn reinserting_a_filename_replaces_it() {
        let mut index = ImageIndex::from_records(sample());
        let mut moved = record("PD760221_WHT_1.jpg");
        moved.raw_color = "WHITE".into();
        let replaced = index.insert(moved);
        assert_eq!(replaced.map(|r| r.raw_color), Some("WHT".to_string()));
        assert!(index.images_for("PD760221", "WHT").is_empty());
        assert_eq!(index.images_for("PD760221", "WHITE").len(), 1);
        assert_eq!(index.record_count(), 6);
    }

    #[test]
    fn removing_last_record_drops_model_from_prefix_index() {
        let mut index = ImageIndex::from_records(sample());
        index.remove("AB1113_RED_1.jpg");
        assert!(!index.contains_model("AB1113"));
        assert!(!index.prefix_index().contains("AB1113"));
        assert!(index.remove("AB1113_RED_1.jpg").is_none());
    }

    #[test]
    fn merge_is_order_independent() {
        let records = sample();
        let whole = ImageIndex::from_records(records.clone());

        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..20 {
            let mut shuffled = records.clone();
            shuffled.shuffle(&mut rng);
            let partials: Vec<ImageIndex> = shuffled
                .chunks(2)
                .map(|chunk| ImageIndex::from_records(chunk.to_vec()))
                .collect();
            let merged = ImageIndex::merge(partials);
            assert_eq!(merged, whole);
            assert_eq!(merged.fingerprint(), whole.fingerprint());
        }
    }

    #[test]
    fn merge_dedupes_repeated_filenames() {
        let a = ImageIndex::from_records(sample());
        let b = ImageIndex::from_records(sample());
        let merged = ImageIndex::merge(vec![a.clone(), b]);
        assert_eq!(merged, a);
        assert_eq!(merged.record_count(), 6);
    }

    #[test]
    fn fingerprint_tracks_content() {
        let a = ImageIndex::from_records(sample());
        let mut b = a.clone();
        assert_eq!(a.fingerprint(), b.fingerprint());
        b.remove("PD760221_WHT_1.jpg");
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    fn prefix_index(models: &[&str]) -> PrefixIndex {
        let mut p = PrefixIndex::default();
        for m in models {
            p.insert(m);
        }
        p
    }

    #[test]
    fn longest_prefix_wins_and_lengths_do_not_merge() {
        let p = prefix_index(&["HBSE-325-0037", "HBSE-399-0001", "AB1113", "AB1114"]);
        let hit = p.candidates("HBSE-325-0037A", PrefixRange::default()).unwrap();
        assert_eq!(hit.prefix_len, 7);
        assert_eq!(hit.prefix, "HBSE-32");
        assert_eq!(hit.model_refs, vec!["HBSE-325-0037".to_string()]);

        let hit = p.candidates("AB1111", PrefixRange::default()).unwrap();
        assert_eq!(hit.prefix_len, 5);
        assert_eq!(hit.model_refs, vec!["AB1113".to_string(), "AB1114".to_string()]);
    }

    #[test]
    fn query_itself_is_not_a_candidate() {
        let p = prefix_index(&["AB1111"]);
        assert!(p.candidates("AB1111", PrefixRange::default()).is_none());
    }

    #[test]
    fn short_queries_have_no_candidates() {
        let p = prefix_index(&["AB111", "AB1111"]);
        // len 5 → upper bound 4, below the minimum
        assert!(p.candidates("AB11X", PrefixRange::default()).is_none());
        assert!(p.candidates("A", PrefixRange::default()).is_none());
    }

    #[test]
    fn prefix_range_is_validated() {
        assert!(PrefixRange::new(0, 3).is_err());
        assert!(PrefixRange::new(6, 5).is_err());
        assert_eq!(PrefixRange::new(4, 6).unwrap(), PrefixRange { min: 4, max: 6 });
    }

    #[test]
    fn prefix_lookup_matches_linear_scan_across_lengths() {
        use rand::Rng;
        let mut rng = StdRng::seed_from_u64(42);
        let models: Vec<String> = (0..400)
            .map(|_| {
                let letters = ["AB", "HB", "PD", "HBSE", "X"][rng.gen_range(0..5)];
                let digits = rng.gen_range(4..9);
                let n: String = (0..digits).map(|_| char::from(b'0' + rng.gen_range(0..3))).collect();
                format!("{letters}{n}")
            })
            .collect();
        let refs: Vec<&str> = models.iter().map(String::as_str).collect();
        let p = prefix_index(&refs);

        for (min, max) in [(5, 7), (4, 6), (3, 9), (6, 6)] {
            let range = PrefixRange::new(min, max).unwrap();
            for query in models.iter().take(100) {
                let query = format!("{query}{}", ["", "A", "0"][rng.gen_range(0..3)]);
                let expected = linear(&models, &query, range);
                let got = p.candidates(&query, range);
                assert_eq!(got.map(|h| (h.prefix_len, h.model_refs)), expected, "{query} {range:?}");
            }
        }
    }

    fn linear(models: &[String], query: &str, range: PrefixRange) -> Option<(usize, Vec<String>)> {
        let len = query.chars().count();
        if len < 2 {
            return None;
        }
        let upper = range.max.min(len - 1);
        let mut distinct: Vec<String> = models.to_vec();
        distinct.sort();
        distinct.dedup();
        (range.min..=upper).rev().find_map(|n| {
            let prefix: String = query.chars().take(n).collect();
            let hits: Vec<String> = distinct
                .iter()
                .filter(|m| m.starts_with(&prefix) && m.as_str() != query)
                .cloned()
                .collect();
            (!hits.is_empty()).then_some((n, hits))
        })
    }
}
