use std::path::PathBuf;

use anyhow::{bail, Result};
use catalog_image_match::cli;
use catalog_image_match::config::EngineConfig;
use catalog_image_match::database_ops::index_builder::BuildMode;
use catalog_image_match::logging::init_tracing;
use catalog_image_match::util::env;
use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "imgmatch", version, about = "Image-to-product reconciliation engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Overrides for values otherwise read from IMGMATCH_* env vars.
#[derive(Args, Debug, Clone, Default)]
struct EngineArgs {
    /// Index store URL (default: env IMGMATCH_DB_URL or sqlite://imgmatch.db)
    #[arg(long)]
    db_url: Option<String>,
    /// Rows per page for listing reads and store writes
    #[arg(long)]
    page_size: Option<usize>,
    /// Shortest prefix tried by the fallback lookup
    #[arg(long)]
    min_prefix_len: Option<usize>,
    /// Longest prefix tried by the fallback lookup
    #[arg(long)]
    max_prefix_len: Option<usize>,
    /// Cap for ambiguous fallback bundles
    #[arg(long)]
    max_fallback_images: Option<usize>,
    /// Never produce PREFIX_ANY bundles
    #[arg(long, default_value_t = false)]
    no_prefix_any: bool,
    /// Model ref prefixes excluded from PREFIX_ANY (comma-separated)
    #[arg(long, value_delimiter = ',')]
    prefix_any_exclusions: Option<Vec<String>>,
    /// Versioned JSON synonym table
    #[arg(long)]
    synonyms: Option<PathBuf>,
}

impl EngineArgs {
    fn resolve(self) -> Result<EngineConfig> {
        let mut cfg = EngineConfig::from_env_unvalidated();
        if let Some(v) = self.db_url {
            cfg.db_url = v;
        }
        if let Some(v) = self.page_size {
            cfg.page_size = v;
        }
        if let Some(v) = self.min_prefix_len {
            cfg.min_prefix_len = v;
        }
        if let Some(v) = self.max_prefix_len {
            cfg.max_prefix_len = v;
        }
        if let Some(v) = self.max_fallback_images {
            cfg.max_fallback_images = v;
        }
        if self.no_prefix_any {
            cfg.allow_prefix_any = false;
        }
        if let Some(v) = self.prefix_any_exclusions {
            cfg.prefix_any_exclusions = v;
        }
        if let Some(v) = self.synonyms {
            cfg.synonym_table = Some(v);
        }
        cfg.validate()?;
        Ok(cfg)
    }
}

#[derive(Subcommand, Debug)]
#[command(rename_all = "kebab-case")]
enum Commands {
    /// Rebuild (full) or refresh (incremental) the persisted image index from a listing
    BuildIndex {
        #[command(flatten)]
        engine: EngineArgs,
        /// `filename,storage_locator` CSV listing
        #[arg(long, conflicts_with = "dir")]
        listing: Option<PathBuf>,
        /// Directory of image files
        #[arg(long)]
        dir: Option<PathBuf>,
        #[arg(long, value_enum, default_value_t = BuildMode::Full)]
        mode: BuildMode,
        /// Also write the build report as JSON here
        #[arg(long)]
        report: Option<PathBuf>,
    },
    /// Resolve one variant, or every variant of a catalog CSV
    Resolve {
        #[command(flatten)]
        engine: EngineArgs,
        #[arg(long)]
        model_ref: Option<String>,
        #[arg(long)]
        color: Option<String>,
        /// Catalog CSV with model_ref and color columns
        #[arg(long)]
        catalog: Option<PathBuf>,
        /// Bulk results file (JSON); stdout when omitted
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Resolve a catalog and report everything that needs human review
    Audit {
        #[command(flatten)]
        engine: EngineArgs,
        #[arg(long)]
        catalog: PathBuf,
        #[arg(long)]
        json: Option<PathBuf>,
        #[arg(long)]
        csv: Option<PathBuf>,
    },
    /// Show how filenames parse
    Parse {
        #[arg(required = true)]
        filenames: Vec<String>,
    },
    /// Explain whether two color tokens are equivalent
    Equivalent {
        #[command(flatten)]
        engine: EngineArgs,
        a: String,
        b: String,
    },
    /// Delete images by filename from the live index
    DeleteImages {
        #[command(flatten)]
        engine: EngineArgs,
        filenames: Vec<String>,
        /// File with one filename per line
        #[arg(long)]
        from_file: Option<PathBuf>,
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },
    /// Print index counts and recent build runs
    IndexStats {
        #[command(flatten)]
        engine: EngineArgs,
        #[arg(long, default_value_t = 10)]
        top: i64,
        #[arg(long, default_value_t = 5)]
        runs: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    env::init_env();
    init_tracing("info,sqlx=warn")?;
    EngineConfig::log_snapshot("imgmatch")?;

    let cli = Cli::parse();
    match cli.command {
        Commands::BuildIndex {
            engine,
            listing,
            dir,
            mode,
            report,
        } => {
            use cli::build_index::{run, BuildIndexConfig, ListingSource};
            let source = match (listing, dir) {
                (Some(path), None) => ListingSource::Csv(path),
                (None, Some(path)) => ListingSource::Directory(path),
                _ => bail!("pass exactly one of --listing or --dir"),
            };
            run(BuildIndexConfig {
                engine: engine.resolve()?,
                source,
                mode,
                report_path: report,
            })
            .await?;
        }
        Commands::Resolve {
            engine,
            model_ref,
            color,
            catalog,
            output,
        } => {
            use cli::resolve::{run, ResolveConfig};
            run(ResolveConfig {
                engine: engine.resolve()?,
                model_ref,
                color,
                catalog,
                output,
            })
            .await?;
        }
        Commands::Audit {
            engine,
            catalog,
            json,
            csv,
        } => {
            use cli::audit::{run, AuditConfig};
            run(AuditConfig {
                engine: engine.resolve()?,
                catalog,
                json_out: json,
                csv_out: csv,
            })
            .await?;
        }
        Commands::Parse { filenames } => {
            use cli::parse::{run, ParseConfig};
            run(ParseConfig { filenames }).await?;
        }
        Commands::Equivalent { engine, a, b } => {
            use cli::equivalent::{run, EquivalentConfig};
            run(EquivalentConfig {
                engine: engine.resolve()?,
                a,
                b,
            })
            .await?;
        }
        Commands::DeleteImages {
            engine,
            filenames,
            from_file,
            dry_run,
        } => {
            use cli::delete_images::{run, DeleteImagesConfig};
            run(DeleteImagesConfig {
                engine: engine.resolve()?,
                filenames,
                from_file,
                dry_run,
            })
            .await?;
        }
        Commands::IndexStats { engine, top, runs } => {
            use cli::index_stats::{run, IndexStatsConfig};
            run(IndexStatsConfig {
                engine: engine.resolve()?,
                top,
                runs,
            })
            .await?;
        }
    }
    Ok(())
}
