use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::info;

use crate::cli::{load_live_index, open_store};
use crate::config::EngineConfig;
use crate::database_ops::audit::TierCounts;
use crate::database_ops::listing::load_catalog_csv;
use crate::database_ops::resolver::{CatalogVariant, Resolver};

#[derive(Debug, Clone)]
pub struct ResolveConfig {
    pub engine: EngineConfig,
    /// Single lookup; ignored when `catalog` is set.
    pub model_ref: Option<String>,
    pub color: Option<String>,
    /// Catalog CSV to resolve in bulk.
    pub catalog: Option<PathBuf>,
    /// Where bulk results go (JSON array); stdout when unset.
    pub output: Option<PathBuf>,
}

pub async fn run(cfg: ResolveConfig) -> Result<()> {
    let variants: Vec<CatalogVariant> = match (&cfg.catalog, &cfg.model_ref) {
        (Some(path), _) => load_catalog_csv(path)?,
        (None, Some(model)) => vec![CatalogVariant::new(
            model.clone(),
            cfg.color.clone().unwrap_or_default(),
        )],
        (None, None) => bail!("pass --model-ref/--color or --catalog"),
    };

    let db = open_store(&cfg.engine).await?;
    let (index, _) = load_live_index(&db, &cfg.engine).await?;
    let resolver = Resolver::new(
        Arc::new(index),
        cfg.engine.matcher()?,
        cfg.engine.resolver_config()?,
    );
    let results = resolver.resolve_all(&variants);

    if cfg.catalog.is_none() {
        if let Some(result) = results.first() {
            println!("{}", serde_json::to_string_pretty(result)?);
        }
        return Ok(());
    }

    let totals = TierCounts::from_results(&results);
    match &cfg.output {
        Some(path) => {
            let file = std::fs::File::create(path)
                .with_context(|| format!("creating {}", path.display()))?;
            serde_json::to_writer_pretty(std::io::BufWriter::new(file), &results)?;
            info!(target = "resolve", path = %path.display(), results = results.len(), "results written");
        }
        None => println!("{}", serde_json::to_string_pretty(&results)?),
    }
    eprintln!("{}", serde_json::to_string(&totals)?);
    Ok(())
}
