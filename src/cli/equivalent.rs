use anyhow::Result;
use serde::Serialize;

use crate::config::EngineConfig;
use crate::normalization::color::NormalizedColor;
use crate::normalization::equivalence::{ColorMatcher, MatchReason};

#[derive(Debug, Clone)]
pub struct EquivalentConfig {
    pub engine: EngineConfig,
    pub a: String,
    pub b: String,
}

#[derive(Debug, Serialize)]
struct Verdict {
    a: NormalizedColor,
    b: NormalizedColor,
    equivalent: bool,
    reason: MatchReason,
    synonym_version: String,
}

fn verdict(matcher: &ColorMatcher, a: &str, b: &str) -> Verdict {
    let v = matcher.compare(a, b);
    Verdict {
        a: NormalizedColor::new(a),
        b: NormalizedColor::new(b),
        equivalent: v.equivalent,
        reason: v.reason,
        synonym_version: matcher.synonyms().version().to_string(),
    }
}

/// Explain whether two color tokens match, and by which rule.
pub async fn run(cfg: EquivalentConfig) -> Result<()> {
    let matcher = cfg.engine.matcher()?;
    println!(
        "{}",
        serde_json::to_string_pretty(&verdict(&matcher, &cfg.a, &cfg.b))?
    );
    Ok(())
}
