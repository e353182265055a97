//! Review report over a full resolution run.
//!
//! Only results a human should look at are kept: every tier other than
//! `EXACT`, and every ambiguous result. Suggestions on unmatched variants are
//! hints for the reviewer and never feed back into matching.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::database_ops::image_index::{ImageIndex, UnparsedImage};
use crate::database_ops::resolver::{MatchResult, MatchTier};

pub const SUGGESTION_THRESHOLD: f64 = 0.85;
pub const MAX_SUGGESTIONS: usize = 3;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierCounts {
    pub total: usize,
    pub exact: usize,
    pub prefix_color: usize,
    pub prefix_any: usize,
    pub none: usize,
    pub ambiguous: usize,
}

impl TierCounts {
    pub fn from_results(results: &[MatchResult]) -> Self {
        results.iter().fold(Self::default(), |mut acc, r| {
            acc.total += 1;
            match r.tier {
                MatchTier::Exact => acc.exact += 1,
                MatchTier::PrefixColor => acc.prefix_color += 1,
                MatchTier::PrefixAny => acc.prefix_any += 1,
                MatchTier::None => acc.none += 1,
            }
            if r.ambiguous {
                acc.ambiguous += 1;
            }
            acc
        })
    }

    pub fn get(&self, tier: MatchTier) -> usize {
        match tier {
            MatchTier::Exact => self.exact,
            MatchTier::PrefixColor => self.prefix_color,
            MatchTier::PrefixAny => self.prefix_any,
            MatchTier::None => self.none,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Suggestion {
    pub model_ref: String,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub model_ref: String,
    pub color: String,
    pub tier: MatchTier,
    pub ambiguous: bool,
    pub image_count: usize,
    pub bundle_total: usize,
    pub prefix_len: Option<usize>,
    /// `MODEL/COLOR_KEY[:reason]` for every candidate considered.
    pub candidates: Vec<String>,
    pub images: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suggestions: Vec<Suggestion>,
}

impl AuditEntry {
    pub fn from_result(result: &MatchResult, index: &ImageIndex) -> Self {
        let suggestions = if result.tier == MatchTier::None {
            suggest_models(index, &result.variant.model_ref, MAX_SUGGESTIONS)
        } else {
            Vec::new()
        };
        Self {
            model_ref: result.variant.model_ref.clone(),
            color: result.variant.color.clone(),
            tier: result.tier,
            ambiguous: result.ambiguous,
            image_count: result.images.len(),
            bundle_total: result.bundle_total,
            prefix_len: result.prefix_len,
            candidates: result
                .candidates
                .iter()
                .map(|c| match c.reason {
                    Some(reason) => format!("{}/{}:{}", c.model_ref, c.color_key, reason),
                    None => format!("{}/{}", c.model_ref, c.color_key),
                })
                .collect(),
            images: result.images.iter().map(|r| r.filename.clone()).collect(),
            suggestions,
        }
    }
}

/// Flat CSV shape of an [`AuditEntry`].
#[derive(Debug, Serialize)]
struct AuditCsvRow<'a> {
    model_ref: &'a str,
    color: &'a str,
    tier: &'static str,
    ambiguous: bool,
    image_count: usize,
    bundle_total: usize,
    prefix_len: Option<usize>,
    candidates: String,
    images: String,
    suggestions: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditReport {
    pub run_id: Uuid,
    pub generated_at: DateTime<Utc>,
    pub synonym_version: String,
    pub totals: TierCounts,
    pub entries: Vec<AuditEntry>,
    pub unparsed: Vec<UnparsedImage>,
}

impl AuditReport {
    pub fn build(
        results: &[MatchResult],
        index: &ImageIndex,
        synonym_version: &str,
        unparsed: Vec<UnparsedImage>,
    ) -> Self {
        let entries: Vec<AuditEntry> = results
            .par_iter()
            .filter(|r| r.needs_review())
            .map(|r| AuditEntry::from_result(r, index))
            .collect();
        let report = Self {
            run_id: Uuid::new_v4(),
            generated_at: Utc::now(),
            synonym_version: synonym_version.to_string(),
            totals: TierCounts::from_results(results),
            entries,
            unparsed,
        };
        info!(
            target = "audit",
            run_id = %report.run_id,
            variants = report.totals.total,
            flagged = report.entries.len(),
            unparsed = report.unparsed.len(),
            "audit report built"
        );
        report
    }

    pub fn write_json(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let file = std::fs::File::create(path)
            .with_context(|| format!("creating {}", path.display()))?;
        serde_json::to_writer_pretty(std::io::BufWriter::new(file), self)
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }

    pub fn write_csv(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let mut writer = csv::Writer::from_path(path)
            .with_context(|| format!("creating {}", path.display()))?;
        for e in &self.entries {
            writer.serialize(AuditCsvRow {
                model_ref: &e.model_ref,
                color: &e.color,
                tier: e.tier.as_str(),
                ambiguous: e.ambiguous,
                image_count: e.image_count,
                bundle_total: e.bundle_total,
                prefix_len: e.prefix_len,
                candidates: e.candidates.join(";"),
                images: e.images.join(";"),
                suggestions: e
                    .suggestions
                    .iter()
                    .map(|s| format!("{}={:.3}", s.model_ref, s.score))
                    .collect::<Vec<_>>()
                    .join(";"),
            })?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// Indexed model refs closest to `query` by Jaro-Winkler, best first.
pub fn suggest_models(index: &ImageIndex, query: &str, limit: usize) -> Vec<Suggestion> {
    let query = query.trim().to_uppercase();
    let mut scored: Vec<Suggestion> = index
        .model_refs()
        .map(|m| Suggestion {
            model_ref: m.to_string(),
            score: strsim::jaro_winkler(&query, m),
        })
        .filter(|s| s.score >= SUGGESTION_THRESHOLD)
        .collect();
    scored.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.model_ref.cmp(&b.model_ref))
    });
    scored.truncate(limit);
    scored
}
