use std::collections::BTreeSet;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use tracing::info;

use crate::cli::open_store;
use crate::config::EngineConfig;
use crate::database_ops::index_store::IndexStore;
use crate::util::retry::retry_async;

#[derive(Debug, Clone)]
pub struct DeleteImagesConfig {
    pub engine: EngineConfig,
    pub filenames: Vec<String>,
    /// File with one filename per line; `#` lines are skipped.
    pub from_file: Option<PathBuf>,
    pub dry_run: bool,
}

fn collect_filenames(cfg: &DeleteImagesConfig) -> Result<Vec<String>> {
    let mut names: BTreeSet<String> = cfg
        .filenames
        .iter()
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty())
        .collect();
    if let Some(path) = &cfg.from_file {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        names.extend(
            raw.lines()
                .map(str::trim)
                .filter(|l| !l.is_empty() && !l.starts_with('#'))
                .map(str::to_string),
        );
    }
    Ok(names.into_iter().collect())
}

/// Remove images by filename from the live index and the unparsed bucket.
pub async fn run(cfg: DeleteImagesConfig) -> Result<()> {
    let names = collect_filenames(&cfg)?;
    if names.is_empty() {
        bail!("no filenames given");
    }
    if cfg.dry_run {
        info!(target = "delete_images", count = names.len(), "dry run; nothing deleted");
        for n in &names {
            println!("{n}");
        }
        return Ok(());
    }

    let db = open_store(&cfg.engine).await?;
    let policy = cfg.engine.retry_policy();
    let mut removed = 0u64;
    for chunk in names.chunks(cfg.engine.page_size.max(1)) {
        removed += retry_async("delete_records", policy, || db.delete_records(chunk)).await?;
    }
    info!(target = "delete_images", requested = names.len(), removed, "images deleted");
    println!("removed {removed} of {} requested", names.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merges_flags_and_file_sorted_and_unique() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, b"# stale\nB_1.jpg\n\nA_1.jpg\n").unwrap();
        let cfg = DeleteImagesConfig {
            engine: EngineConfig::default(),
            filenames: vec!["A_1.jpg".into(), " ".into()],
            from_file: Some(file.path().to_path_buf()),
            dry_run: true,
        };
        assert_eq!(collect_filenames(&cfg).unwrap(), vec!["A_1.jpg", "B_1.jpg"]);
    }
}
