//! Adapters for the collaborators that feed the engine: the raw image
//! listing (paginated, stable total count per run) and the catalog export.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::database_ops::resolver::CatalogVariant;

const IMAGE_EXTENSIONS: [&str; 7] = ["jpg", "jpeg", "png", "webp", "gif", "tif", "tiff"];

/// One `{filename, storage_locator}` pair from the raw listing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RawImageEntry {
    pub filename: String,
    pub storage_locator: String,
}

impl RawImageEntry {
    pub fn new(filename: impl Into<String>, storage_locator: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            storage_locator: storage_locator.into(),
        }
    }
}

/// Paginated source of raw image entries.
#[async_trait]
pub trait ImageListing: Send + Sync {
    /// Total entries for this run; must not change while the run is in progress.
    async fn total_count(&self) -> Result<u64>;

    /// Zero-based page of at most `page_size` entries.
    async fn fetch_page(&self, page: u64, page_size: usize) -> Result<Vec<RawImageEntry>>;
}

/// Listing backed by an in-memory vector.
#[derive(Debug, Clone, Default)]
pub struct VecListing {
    entries: Vec<RawImageEntry>,
}

impl VecListing {
    pub fn new(entries: Vec<RawImageEntry>) -> Self {
        Self { entries }
    }

    /// Filenames with a locator derived from the name.
    pub fn from_filenames<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(
            names
                .into_iter()
                .map(|n| {
                    let filename = n.into();
                    let locator = format!("mem://{filename}");
                    RawImageEntry::new(filename, locator)
                })
                .collect(),
        )
    }

    fn page(&self, page: u64, page_size: usize) -> Vec<RawImageEntry> {
        let start = (page as usize).saturating_mul(page_size);
        self.entries
            .iter()
            .skip(start)
            .take(page_size)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ImageListing for VecListing {
    async fn total_count(&self) -> Result<u64> {
        Ok(self.entries.len() as u64)
    }

    async fn fetch_page(&self, page: u64, page_size: usize) -> Result<Vec<RawImageEntry>> {
        Ok(self.page(page, page_size))
    }
}

#[derive(Debug, Deserialize)]
struct ListingRow {
    #[serde(alias = "name", alias = "file")]
    filename: String,
    #[serde(alias = "url", alias = "path", alias = "locator", default)]
    storage_locator: Option<String>,
}

/// `filename,storage_locator` CSV export of the object store.
///
/// Opening validates every row and counts the entries without keeping them.
/// Pages are then streamed from a cursor; only the current page is held in
/// memory. A page that is not the next one in sequence reopens the file and
/// skips ahead.
#[derive(Debug)]
pub struct CsvImageListing {
    path: PathBuf,
    total: u64,
    cursor: Mutex<CsvCursor>,
}

#[derive(Debug)]
struct CsvCursor {
    reader: csv::Reader<File>,
    /// Entries already handed out from `reader`.
    position: u64,
}

impl CsvImageListing {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut reader = open_listing_csv(&path)?;
        let mut total = 0u64;
        while next_listing_entry(&mut reader, &path)?.is_some() {
            total += 1;
        }
        info!(target = "listing", path = %path.display(), entries = total, "csv listing opened");
        let cursor = CsvCursor {
            reader: open_listing_csv(&path)?,
            position: 0,
        };
        Ok(Self {
            path,
            total,
            cursor: Mutex::new(cursor),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn open_listing_csv(path: &Path) -> Result<csv::Reader<File>> {
    csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("opening listing {}", path.display()))
}

/// Next row with a filename; rows without one are skipped.
fn next_listing_entry(reader: &mut csv::Reader<File>, path: &Path) -> Result<Option<RawImageEntry>> {
    loop {
        let line = reader.position().line() + 1;
        let Some(row) = reader.deserialize::<ListingRow>().next() else {
            return Ok(None);
        };
        let row = row.with_context(|| format!("{}: line {line}", path.display()))?;
        if row.filename.is_empty() {
            continue;
        }
        let locator = row
            .storage_locator
            .filter(|l| !l.is_empty())
            .unwrap_or_else(|| row.filename.clone());
        return Ok(Some(RawImageEntry::new(row.filename, locator)));
    }
}

#[async_trait]
impl ImageListing for CsvImageListing {
    async fn total_count(&self) -> Result<u64> {
        Ok(self.total)
    }

    async fn fetch_page(&self, page: u64, page_size: usize) -> Result<Vec<RawImageEntry>> {
        let start = page.saturating_mul(page_size as u64);
        let mut cursor = self.cursor.lock().await;
        if cursor.position != start {
            debug!(target = "listing", page, position = cursor.position, "csv listing rewound");
            cursor.reader = open_listing_csv(&self.path)?;
            cursor.position = 0;
            while cursor.position < start {
                if next_listing_entry(&mut cursor.reader, &self.path)?.is_none() {
                    return Ok(Vec::new());
                }
                cursor.position += 1;
            }
        }
        let mut entries = Vec::with_capacity(page_size);
        while entries.len() < page_size {
            match next_listing_entry(&mut cursor.reader, &self.path)? {
                Some(entry) => entries.push(entry),
                None => break,
            }
        }
        cursor.position += entries.len() as u64;
        Ok(entries)
    }
}

/// Image files under a directory tree, sorted by path; the locator is the path.
///
/// Sorting needs every path up front, so the scan keeps the whole listing in
/// memory: one short path string per file.
#[derive(Debug, Clone)]
pub struct DirectoryListing {
    root: PathBuf,
    inner: VecListing,
}

impl DirectoryListing {
    pub fn scan(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        if !root.is_dir() {
            bail!("{} is not a directory", root.display());
        }
        let mut paths: Vec<PathBuf> = Vec::new();
        for entry in WalkDir::new(&root).follow_links(false) {
            let entry = entry.with_context(|| format!("walking {}", root.display()))?;
            if entry.file_type().is_file() && has_image_extension(entry.path()) {
                paths.push(entry.into_path());
            }
        }
        paths.sort();
        let entries: Vec<RawImageEntry> = paths
            .into_iter()
            .filter_map(|p| {
                let filename = p.file_name()?.to_string_lossy().into_owned();
                Some(RawImageEntry::new(filename, p.to_string_lossy().into_owned()))
            })
            .collect();
        debug!(target = "listing", root = %root.display(), files = entries.len(), "directory scanned");
        Ok(Self {
            root,
            inner: VecListing::new(entries),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl ImageListing for DirectoryListing {
    async fn total_count(&self) -> Result<u64> {
        self.inner.total_count().await
    }

    async fn fetch_page(&self, page: u64, page_size: usize) -> Result<Vec<RawImageEntry>> {
        self.inner.fetch_page(page, page_size).await
    }
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

const MODEL_HEADERS: [&str; 5] = ["model_ref", "modelref", "model", "sku", "reference"];
const COLOR_HEADERS: [&str; 3] = ["color", "colour", "couleur"];

/// Catalog export: a `model_ref` column, a `color` column, anything else kept as opaque extras.
pub fn load_catalog_csv(path: impl AsRef<Path>) -> Result<Vec<CatalogVariant>> {
    let path = path.as_ref();
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("opening catalog {}", path.display()))?;
    let headers = reader.headers()?.clone();
    let find = |names: &[&str]| {
        headers
            .iter()
            .position(|h| names.contains(&h.to_ascii_lowercase().as_str()))
    };
    let Some(model_col) = find(&MODEL_HEADERS) else {
        bail!("{}: no model_ref column in {:?}", path.display(), headers);
    };
    let Some(color_col) = find(&COLOR_HEADERS) else {
        bail!("{}: no color column in {:?}", path.display(), headers);
    };

    let mut variants = Vec::new();
    for (line, row) in reader.records().enumerate() {
        let row = row.with_context(|| format!("{}: row {}", path.display(), line + 2))?;
        let model_ref = row.get(model_col).unwrap_or_default();
        if model_ref.is_empty() {
            continue;
        }
        let color = row.get(color_col).unwrap_or_default();
        let extra: BTreeMap<String, String> = headers
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != model_col && *i != color_col)
            .filter_map(|(i, h)| row.get(i).map(|v| (h.to_string(), v.to_string())))
            .collect();
        variants.push(CatalogVariant {
            model_ref: model_ref.to_string(),
            color: color.to_string(),
            extra,
        });
    }
    info!(target = "listing", path = %path.display(), variants = variants.len(), "catalog loaded");
    Ok(variants)
}
