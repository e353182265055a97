pub mod audit;
pub mod build_index;
pub mod delete_images;
pub mod equivalent;
pub mod index_stats;
pub mod parse;
pub mod resolve;

use anyhow::{Context, Result};

use crate::config::EngineConfig;
use crate::database_ops::db::Db;
use crate::database_ops::image_index::{ImageIndex, UnparsedImage};
use crate::database_ops::index_store::load_index;

/// Connect to the index store named by the engine config.
pub(crate) async fn open_store(engine: &EngineConfig) -> Result<Db> {
    Db::connect(&engine.db_url, engine.db_max_connections)
        .await
        .context("opening index store")
}

/// Load the live index and the unparsed bucket from the store.
pub(crate) async fn load_live_index(
    db: &Db,
    engine: &EngineConfig,
) -> Result<(ImageIndex, Vec<UnparsedImage>)> {
    let loaded = load_index(db, engine.page_size, engine.retry_policy())
        .await
        .context("loading live index")?;
    if loaded.0.is_empty() {
        tracing::warn!(target = "cli", "live index is empty; run build-index first");
    }
    Ok(loaded)
}
