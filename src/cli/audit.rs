use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use crate::cli::{load_live_index, open_store};
use crate::config::EngineConfig;
use crate::database_ops::audit::AuditReport;
use crate::database_ops::listing::load_catalog_csv;
use crate::database_ops::resolver::{MatchTier, Resolver};

#[derive(Debug, Clone)]
pub struct AuditConfig {
    pub engine: EngineConfig,
    pub catalog: PathBuf,
    pub json_out: Option<PathBuf>,
    pub csv_out: Option<PathBuf>,
}

pub async fn run(cfg: AuditConfig) -> Result<()> {
    let variants = load_catalog_csv(&cfg.catalog)?;
    let db = open_store(&cfg.engine).await?;
    let (index, unparsed) = load_live_index(&db, &cfg.engine).await?;
    let index = Arc::new(index);

    let matcher = cfg.engine.matcher()?;
    let synonym_version = matcher.synonyms().version().to_string();
    let resolver = Resolver::new(index.clone(), matcher, cfg.engine.resolver_config()?);
    let results = resolver.resolve_all(&variants);
    let report = AuditReport::build(&results, &index, &synonym_version, unparsed);

    if let Some(path) = &cfg.json_out {
        report.write_json(path)?;
        info!(target = "audit", path = %path.display(), "json report written");
    }
    if let Some(path) = &cfg.csv_out {
        report.write_csv(path)?;
        info!(target = "audit", path = %path.display(), "csv report written");
    }
    if cfg.json_out.is_none() && cfg.csv_out.is_none() {
        println!("{}", serde_json::to_string_pretty(&report)?);
    }

    let mut out = String::new();
    out.push_str(&format!("variants: {}\n", report.totals.total));
    for tier in MatchTier::ALL {
        out.push_str(&format!("  {:<13}{}\n", tier.as_str(), report.totals.get(tier)));
    }
    out.push_str(&format!("  {:<13}{}\n", "AMBIGUOUS", report.totals.ambiguous));
    out.push_str(&format!("flagged for review: {}\n", report.entries.len()));
    out.push_str(&format!("unparsed images: {}\n", report.unparsed.len()));
    eprint!("{out}");
    Ok(())
}
