use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::{info, warn};

use crate::cli::open_store;
use crate::config::EngineConfig;
use crate::database_ops::index_builder::{BuildMode, IndexBuilder};
use crate::database_ops::index_store::IndexStore;
use crate::database_ops::listing::{CsvImageListing, DirectoryListing, ImageListing};
use crate::normalization::filename::FilenameParser;

#[derive(Debug, Clone)]
pub enum ListingSource {
    /// `filename,storage_locator` export.
    Csv(PathBuf),
    /// Image files under a directory, located by path.
    Directory(PathBuf),
}

#[derive(Debug, Clone)]
pub struct BuildIndexConfig {
    pub engine: EngineConfig,
    pub source: ListingSource,
    pub mode: BuildMode,
    /// Optional JSON copy of the build report.
    pub report_path: Option<PathBuf>,
}

pub async fn run(cfg: BuildIndexConfig) -> Result<()> {
    let listing: Box<dyn ImageListing> = match &cfg.source {
        ListingSource::Csv(path) => Box::new(CsvImageListing::open(path)?),
        ListingSource::Directory(path) => Box::new(DirectoryListing::scan(path)?),
    };

    let db = Arc::new(open_store(&cfg.engine).await?);
    let store: Arc<dyn IndexStore> = db.clone();
    let builder = IndexBuilder::new(
        store,
        Arc::new(FilenameParser::with_defaults()),
        cfg.engine.builder_config(),
    )?;

    let report = builder.run(listing.as_ref(), cfg.mode).await?;
    db.record_run(&report).await?;

    if let Some(path) = &cfg.report_path {
        let json = serde_json::to_string_pretty(&report)?;
        std::fs::write(path, json).with_context(|| format!("writing {}", path.display()))?;
        info!(target = "build_index", path = %path.display(), "report written");
    }
    println!("{}", serde_json::to_string_pretty(&report)?);

    if !report.is_clean() {
        warn!(
            target = "build_index",
            failed = report.failed_pages.len(),
            swapped = report.swapped,
            "build finished with failed pages"
        );
        if cfg.mode == BuildMode::Full {
            bail!(
                "{} page(s) failed; the previous live index was kept",
                report.failed_pages.len()
            );
        }
        bail!(
            "{} page(s) failed; re-run the incremental build to retry them",
            report.failed_pages.len()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database_ops::db::Db;
    use std::io::Write;

    #[tokio::test]
    async fn builds_from_csv_and_records_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let listing = dir.path().join("listing.csv");
        let mut f = std::fs::File::create(&listing).unwrap();
        writeln!(f, "filename,storage_locator").unwrap();
        writeln!(f, "PD760221_BLO_DITA_B.jpg,cdn://1").unwrap();
        writeln!(f, "banner.jpg,cdn://2").unwrap();
        drop(f);

        let db_url = format!("sqlite://{}", dir.path().join("idx.db").display());
        let engine = EngineConfig {
            db_url: db_url.clone(),
            ..EngineConfig::default()
        };
        let report_path = dir.path().join("report.json");
        run(BuildIndexConfig {
            engine,
            source: ListingSource::Csv(listing),
            mode: BuildMode::Full,
            report_path: Some(report_path.clone()),
        })
        .await
        .unwrap();

        assert!(report_path.exists());
        let db = Db::connect(&db_url, 1).await.unwrap();
        assert_eq!(db.count_records().await.unwrap(), 1);
        assert_eq!(db.count_unparsed().await.unwrap(), 1);
        assert_eq!(db.recent_runs(5).await.unwrap().len(), 1);
    }
}
