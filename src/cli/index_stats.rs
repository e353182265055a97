use anyhow::Result;
use serde::Serialize;

use crate::cli::open_store;
use crate::config::EngineConfig;
use crate::database_ops::db::RunRow;
use crate::database_ops::index_store::IndexStore;

#[derive(Debug, Clone)]
pub struct IndexStatsConfig {
    pub engine: EngineConfig,
    /// How many of the most populated model refs to list.
    pub top: i64,
    /// How many recent runs to list.
    pub runs: i64,
}

#[derive(Debug, Serialize)]
struct IndexStats {
    records: u64,
    low_confidence: i64,
    unparsed: u64,
    top_models: Vec<(String, i64)>,
    recent_runs: Vec<RunRow>,
}

/// Print record counts, the busiest model refs and recent build runs.
pub async fn run(cfg: IndexStatsConfig) -> Result<()> {
    let db = open_store(&cfg.engine).await?;
    let stats = IndexStats {
        records: db.count_records().await?,
        low_confidence: db.count_low_confidence().await?,
        unparsed: db.count_unparsed().await?,
        top_models: db.top_models(cfg.top.max(0)).await?,
        recent_runs: db.recent_runs(cfg.runs.max(0)).await?,
    };
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}
