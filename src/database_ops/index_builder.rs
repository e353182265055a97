//! Full and incremental index builds from a paginated image listing.
//!
//! Pages are processed one at a time: fetch, parse on a rayon pool, check
//! consistency against every filename already seen in this run, then write.
//! A failed write loses at most that page. A full build writes into staging
//! and only swaps once every page has landed.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::database_ops::image_index::{ImageIndex, ImageRecord, UnparsedImage};
use crate::database_ops::index_store::IndexStore;
use crate::database_ops::listing::{ImageListing, RawImageEntry};
use crate::error::{ReconcileError, StoreError};
use crate::normalization::filename::FilenameParser;
use crate::util::retry::{retry_async, RetryPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BuildMode {
    /// Recompute the whole record set and swap it in atomically.
    Full,
    /// Upsert each page straight into the live key space.
    Incremental,
}

impl BuildMode {
    pub fn as_str(self) -> &'static str {
        match self {
            BuildMode::Full => "full",
            BuildMode::Incremental => "incremental",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuilderConfig {
    pub page_size: usize,
    /// Parser threads; zero lets rayon pick.
    pub parse_workers: usize,
    pub retry: RetryPolicy,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            page_size: 500,
            parse_workers: 0,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedPage {
    pub page: u64,
    pub filenames: Vec<String>,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildReport {
    pub run_id: Uuid,
    pub mode: BuildMode,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub total_listed: u64,
    pub parsed: u64,
    pub unparsed: u64,
    /// Repeated filenames with an identical locator, skipped.
    pub duplicates: u64,
    pub failed_pages: Vec<FailedPage>,
    /// Full builds only: the staged record set replaced the live one.
    pub swapped: bool,
    /// Fingerprint of the index built from this run's records.
    pub fingerprint: String,
}

impl BuildReport {
    pub fn empty(mode: BuildMode) -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            mode,
            started_at: now,
            finished_at: now,
            total_listed: 0,
            parsed: 0,
            unparsed: 0,
            duplicates: 0,
            failed_pages: Vec::new(),
            swapped: false,
            fingerprint: String::new(),
        }
    }

    pub fn is_clean(&self) -> bool {
        self.failed_pages.is_empty()
    }
}

pub struct IndexBuilder {
    store: Arc<dyn IndexStore>,
    parser: Arc<FilenameParser>,
    config: BuilderConfig,
    pool: rayon::ThreadPool,
}

impl IndexBuilder {
    pub fn new(
        store: Arc<dyn IndexStore>,
        parser: Arc<FilenameParser>,
        config: BuilderConfig,
    ) -> Result<Self, ReconcileError> {
        if config.page_size == 0 {
            return Err(ReconcileError::Config("page_size must be positive".into()));
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.parse_workers)
            .thread_name(|i| format!("imgmatch-parse-{i}"))
            .build()
            .map_err(|e| ReconcileError::Config(format!("parse pool: {e}")))?;
        Ok(Self {
            store,
            parser,
            config,
            pool,
        })
    }

    pub async fn run(
        &self,
        listing: &dyn ImageListing,
        mode: BuildMode,
    ) -> Result<BuildReport, ReconcileError> {
        self.build(listing, mode).await.map(|(report, _)| report)
    }

    /// Run a build and also hand back the index assembled from this run's records.
    pub async fn build(
        &self,
        listing: &dyn ImageListing,
        mode: BuildMode,
    ) -> Result<(BuildReport, ImageIndex), ReconcileError> {
        let mut report = BuildReport::empty(mode);
        let retry = self.config.retry;
        let page_size = self.config.page_size;

        let total = listing
            .total_count()
            .await
            .map_err(|e| ReconcileError::Listing(format!("{e:#}")))?;
        report.total_listed = total;
        let pages = total.div_ceil(page_size as u64);
        info!(
            target = "index_builder",
            run_id = %report.run_id,
            mode = mode.as_str(),
            total,
            pages,
            page_size,
            "index build started"
        );

        if mode == BuildMode::Full {
            retry_async("clear_staging", retry, || self.store.clear_staging()).await?;
        }

        let mut seen: BTreeMap<String, String> = BTreeMap::new();
        let mut partials: Vec<ImageIndex> = Vec::with_capacity(pages as usize);
        for page in 0..pages {
            let entries = listing
                .fetch_page(page, page_size)
                .await
                .map_err(|e| ReconcileError::Listing(format!("page {page}: {e:#}")))?;
            if entries.is_empty() {
                warn!(target = "index_builder", page, pages, "listing ended before its advertised count");
                break;
            }

            let fresh = match dedupe_page(entries, &mut seen) {
                Ok((fresh, duplicates)) => {
                    report.duplicates += duplicates;
                    fresh
                }
                Err(err) => {
                    error!(target = "index_builder", run_id = %report.run_id, page, error = %err, "aborting run");
                    if mode == BuildMode::Full {
                        if let Err(e) = self.store.clear_staging().await {
                            warn!(target = "index_builder", error = %e, "could not clear staging after abort");
                        }
                    }
                    return Err(err);
                }
            };

            let (records, unparsed) = self.parse_page(&fresh);
            match self.write_page(mode, &records, &unparsed).await {
                Ok(()) => {
                    debug!(
                        target = "index_builder",
                        page,
                        records = records.len(),
                        unparsed = unparsed.len(),
                        "page written"
                    );
                    report.parsed += records.len() as u64;
                    report.unparsed += unparsed.len() as u64;
                    partials.push(ImageIndex::from_records(records));
                }
                Err(PageWriteError {
                    records_landed,
                    error: err,
                }) => {
                    // records already live stay counted; only the rest of the page failed
                    let filenames: Vec<String> = if records_landed {
                        report.parsed += records.len() as u64;
                        partials.push(ImageIndex::from_records(records));
                        unparsed.iter().map(|u| u.filename.clone()).collect()
                    } else {
                        fresh.iter().map(|e| e.filename.clone()).collect()
                    };
                    error!(
                        target = "index_builder",
                        page,
                        error = %err,
                        records_landed,
                        filenames = ?filenames,
                        "page write failed after retries"
                    );
                    report.failed_pages.push(FailedPage {
                        page,
                        filenames,
                        error: err.to_string(),
                    });
                }
            }
        }

        let index = ImageIndex::merge(partials);
        report.fingerprint = index.fingerprint();

        if mode == BuildMode::Full {
            if report.failed_pages.is_empty() {
                let live = retry_async("commit_staging", retry, || self.store.commit_staging()).await?;
                report.swapped = true;
                info!(target = "index_builder", live, "staged index swapped in");
            } else {
                warn!(
                    target = "index_builder",
                    failed = report.failed_pages.len(),
                    "failed pages; keeping the previous live index"
                );
                retry_async("clear_staging", retry, || self.store.clear_staging()).await?;
            }
        }

        report.finished_at = Utc::now();
        info!(
            target = "index_builder",
            run_id = %report.run_id,
            parsed = report.parsed,
            unparsed = report.unparsed,
            duplicates = report.duplicates,
            failed_pages = report.failed_pages.len(),
            swapped = report.swapped,
            fingerprint = %report.fingerprint,
            "index build finished"
        );
        Ok((report, index))
    }

    fn parse_page(&self, entries: &[RawImageEntry]) -> (Vec<ImageRecord>, Vec<UnparsedImage>) {
        let parser = &self.parser;
        let outcomes: Vec<Result<ImageRecord, UnparsedImage>> = self.pool.install(|| {
            entries
                .par_iter()
                .map(|entry| match parser.parse(&entry.filename) {
                    Ok(parsed) => Ok(ImageRecord::from_parse(entry, parsed)),
                    Err(reason) => Err(UnparsedImage {
                        filename: entry.filename.clone(),
                        storage_locator: entry.storage_locator.clone(),
                        reason,
                    }),
                })
                .collect()
        });
        let mut records = Vec::with_capacity(outcomes.len());
        let mut unparsed = Vec::new();
        for outcome in outcomes {
            match outcome {
                Ok(r) => records.push(r),
                Err(u) => {
                    debug!(target = "index_builder", filename = %u.filename, reason = %u.reason, "unparsed");
                    unparsed.push(u);
                }
            }
        }
        (records, unparsed)
    }

    async fn write_page(
        &self,
        mode: BuildMode,
        records: &[ImageRecord],
        unparsed: &[UnparsedImage],
    ) -> Result<(), PageWriteError> {
        let retry = self.config.retry;
        let store = &self.store;
        let nothing_landed = |error| PageWriteError {
            records_landed: false,
            error,
        };
        match mode {
            BuildMode::Full => {
                if !records.is_empty() {
                    retry_async("stage_records", retry, || store.stage_records(records))
                        .await
                        .map_err(nothing_landed)?;
                }
                if !unparsed.is_empty() {
                    // staging is discarded on any failed page
                    retry_async("stage_unparsed", retry, || store.stage_unparsed(unparsed))
                        .await
                        .map_err(nothing_landed)?;
                }
            }
            BuildMode::Incremental => {
                if !records.is_empty() {
                    retry_async("upsert_records", retry, || store.upsert_records(records))
                        .await
                        .map_err(nothing_landed)?;
                }
                if !unparsed.is_empty() {
                    retry_async("upsert_unparsed", retry, || store.upsert_unparsed(unparsed))
                        .await
                        .map_err(|error| PageWriteError {
                            records_landed: true,
                            error,
                        })?;
                }
            }
        }
        Ok(())
    }
}

/// A page write that ran out of retries. `records_landed` is set when the
/// page's records were already upserted into the live key space.
struct PageWriteError {
    records_landed: bool,
    error: StoreError,
}

/// Drop filenames already seen in this run; a repeat with a different locator is fatal.
fn dedupe_page(
    entries: Vec<RawImageEntry>,
    seen: &mut BTreeMap<String, String>,
) -> Result<(Vec<RawImageEntry>, u64), ReconcileError> {
    let mut fresh = Vec::with_capacity(entries.len());
    let mut duplicates = 0;
    for entry in entries {
        match seen.get(&entry.filename) {
            Some(first) if *first != entry.storage_locator => {
                return Err(ReconcileError::CorpusInconsistency {
                    filename: entry.filename,
                    first: first.clone(),
                    second: entry.storage_locator,
                });
            }
            Some(_) => duplicates += 1,
            None => {
                seen.insert(entry.filename.clone(), entry.storage_locator.clone());
                fresh.push(entry);
            }
        }
    }
    Ok((fresh, duplicates))
}
