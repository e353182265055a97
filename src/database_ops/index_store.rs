//! Persisted index store contract.
//!
//! Every write is keyed by `filename` with insert-or-replace semantics, so a
//! retried or repeated write never produces a second row for the same image.
//! Full rebuilds write into a staging key space and [`IndexStore::commit_staging`]
//! swaps it in atomically; readers only ever see the live key space.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::database_ops::image_index::{ImageIndex, ImageRecord, UnparsedImage};
use crate::error::StoreError;
use crate::util::retry::{retry_async, RetryPolicy};

#[async_trait]
pub trait IndexStore: Send + Sync {
    /// Insert or replace live records; also clears any unparsed entry with the same filename.
    async fn upsert_records(&self, records: &[ImageRecord]) -> Result<u64, StoreError>;

    /// Insert or replace live unparsed entries; also clears any record with the same filename.
    async fn upsert_unparsed(&self, items: &[UnparsedImage]) -> Result<u64, StoreError>;

    /// Remove filenames from the live records and the unparsed bucket.
    async fn delete_records(&self, filenames: &[String]) -> Result<u64, StoreError>;

    /// Live records with `filename > after`, ordered by filename.
    async fn scan_records_page(
        &self,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ImageRecord>, StoreError>;

    async fn scan_unparsed_page(
        &self,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<UnparsedImage>, StoreError>;

    async fn stage_records(&self, records: &[ImageRecord]) -> Result<u64, StoreError>;

    async fn stage_unparsed(&self, items: &[UnparsedImage]) -> Result<u64, StoreError>;

    async fn clear_staging(&self) -> Result<(), StoreError>;

    /// Replace the live key space with the staged one in one step; returns live record count.
    async fn commit_staging(&self) -> Result<u64, StoreError>;

    async fn count_records(&self) -> Result<u64, StoreError>;

    async fn count_unparsed(&self) -> Result<u64, StoreError>;
}

#[derive(Debug, Default)]
struct MemoryState {
    records: BTreeMap<String, ImageRecord>,
    unparsed: BTreeMap<String, UnparsedImage>,
    staged_records: BTreeMap<String, ImageRecord>,
    staged_unparsed: BTreeMap<String, UnparsedImage>,
}

/// `IndexStore` over in-process maps, with write fault injection for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryIndexStore {
    state: RwLock<MemoryState>,
    transient_failures: AtomicU32,
    poisoned: Mutex<BTreeSet<String>>,
    writes: AtomicU64,
}

impl MemoryIndexStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `n` write calls fail with a transient error.
    pub fn fail_next_writes(&self, n: u32) {
        self.transient_failures.store(n, Ordering::SeqCst);
    }

    /// Every write touching `filename` fails transiently, forever.
    pub fn poison(&self, filename: impl Into<String>) {
        if let Ok(mut set) = self.poisoned.lock() {
            set.insert(filename.into());
        }
    }

    /// Write calls attempted so far, failed ones included.
    pub fn write_calls(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    pub async fn staged_count(&self) -> usize {
        let state = self.state.read().await;
        state.staged_records.len() + state.staged_unparsed.len()
    }

    fn check_write<'a>(&self, keys: impl IntoIterator<Item = &'a str>) -> Result<(), StoreError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let pending = self.transient_failures.load(Ordering::SeqCst);
        if pending > 0 {
            self.transient_failures.store(pending - 1, Ordering::SeqCst);
            return Err(StoreError::Transient("injected transient failure".into()));
        }
        let poisoned = self
            .poisoned
            .lock()
            .map_err(|_| StoreError::Permanent("fault registry poisoned".into()))?;
        if let Some(key) = keys.into_iter().find(|k| poisoned.contains(*k)) {
            return Err(StoreError::Transient(format!("injected failure for {key}")));
        }
        Ok(())
    }
}

fn page_after<V: Clone>(map: &BTreeMap<String, V>, after: Option<&str>, limit: usize) -> Vec<V> {
    let lower = match after {
        Some(a) => Bound::Excluded(a),
        None => Bound::Unbounded,
    };
    map.range::<str, _>((lower, Bound::Unbounded))
        .take(limit)
        .map(|(_, v)| v.clone())
        .collect()
}

#[async_trait]
impl IndexStore for MemoryIndexStore {
    async fn upsert_records(&self, records: &[ImageRecord]) -> Result<u64, StoreError> {
        self.check_write(records.iter().map(|r| r.filename.as_str()))?;
        let mut state = self.state.write().await;
        for record in records {
            state.unparsed.remove(&record.filename);
            state.records.insert(record.filename.clone(), record.clone());
        }
        Ok(records.len() as u64)
    }

    async fn upsert_unparsed(&self, items: &[UnparsedImage]) -> Result<u64, StoreError> {
        self.check_write(items.iter().map(|u| u.filename.as_str()))?;
        let mut state = self.state.write().await;
        for item in items {
            state.records.remove(&item.filename);
            state.unparsed.insert(item.filename.clone(), item.clone());
        }
        Ok(items.len() as u64)
    }

    async fn delete_records(&self, filenames: &[String]) -> Result<u64, StoreError> {
        self.check_write(filenames.iter().map(String::as_str))?;
        let mut state = self.state.write().await;
        let mut removed = 0;
        for name in filenames {
            let a = state.records.remove(name).is_some();
            let b = state.unparsed.remove(name).is_some();
            if a || b {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn scan_records_page(
        &self,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ImageRecord>, StoreError> {
        let state = self.state.read().await;
        Ok(page_after(&state.records, after, limit))
    }

    async fn scan_unparsed_page(
        &self,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<UnparsedImage>, StoreError> {
        let state = self.state.read().await;
        Ok(page_after(&state.unparsed, after, limit))
    }

    async fn stage_records(&self, records: &[ImageRecord]) -> Result<u64, StoreError> {
        self.check_write(records.iter().map(|r| r.filename.as_str()))?;
        let mut state = self.state.write().await;
        for record in records {
            state
                .staged_records
                .insert(record.filename.clone(), record.clone());
        }
        Ok(records.len() as u64)
    }

    async fn stage_unparsed(&self, items: &[UnparsedImage]) -> Result<u64, StoreError> {
        self.check_write(items.iter().map(|u| u.filename.as_str()))?;
        let mut state = self.state.write().await;
        for item in items {
            state
                .staged_unparsed
                .insert(item.filename.clone(), item.clone());
        }
        Ok(items.len() as u64)
    }

    async fn clear_staging(&self) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        state.staged_records.clear();
        state.staged_unparsed.clear();
        Ok(())
    }

    async fn commit_staging(&self) -> Result<u64, StoreError> {
        self.check_write(std::iter::empty())?;
        let mut state = self.state.write().await;
        state.records = std::mem::take(&mut state.staged_records);
        state.unparsed = std::mem::take(&mut state.staged_unparsed);
        Ok(state.records.len() as u64)
    }

    async fn count_records(&self) -> Result<u64, StoreError> {
        Ok(self.state.read().await.records.len() as u64)
    }

    async fn count_unparsed(&self) -> Result<u64, StoreError> {
        Ok(self.state.read().await.unparsed.len() as u64)
    }
}

/// Rebuild the in-memory index plus the unparsed bucket from the live key space.
pub async fn load_index(
    store: &dyn IndexStore,
    page_size: usize,
    retry: RetryPolicy,
) -> Result<(ImageIndex, Vec<UnparsedImage>), StoreError> {
    let page_size = page_size.max(1);
    let mut index = ImageIndex::new();
    let mut after: Option<String> = None;
    let mut pages = 0u64;
    loop {
        let cursor = after.clone();
        let page = retry_async("scan_records_page", retry, || {
            store.scan_records_page(cursor.as_deref(), page_size)
        })
        .await?;
        let done = page.len() < page_size;
        after = page.last().map(|r| r.filename.clone());
        for record in page {
            index.insert(record);
        }
        pages += 1;
        if done || after.is_none() {
            break;
        }
    }

    let mut unparsed = Vec::new();
    let mut after: Option<String> = None;
    loop {
        let cursor = after.clone();
        let page = retry_async("scan_unparsed_page", retry, || {
            store.scan_unparsed_page(cursor.as_deref(), page_size)
        })
        .await?;
        let done = page.len() < page_size;
        after = page.last().map(|u| u.filename.clone());
        unparsed.extend(page);
        if done || after.is_none() {
            break;
        }
    }
    debug!(target = "index_store", pages, "scan complete");
    info!(
        target = "index_store",
        records = index.record_count(),
        models = index.model_count(),
        unparsed = unparsed.len(),
        "index loaded"
    );
    Ok((index, unparsed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database_ops::listing::RawImageEntry;
    use crate::normalization::filename::{FilenameParser, ParseFailure};

    fn record(filename: &str, locator: &str) -> ImageRecord {
        let parsed = FilenameParser::with_defaults().parse(filename).unwrap();
        ImageRecord::from_parse(&RawImageEntry::new(filename, locator), parsed)
    }

    fn unparsed(filename: &str) -> UnparsedImage {
        UnparsedImage {
            filename: filename.into(),
            storage_locator: format!("mem://{filename}"),
            reason: ParseFailure::NoDelimiter,
        }
    }

    #[tokio::test]
    async fn upsert_replaces_by_filename() {
        let store = MemoryIndexStore::new();
        store.upsert_records(&[record("PD1234_RED_1.jpg", "a")]).await.unwrap();
        store.upsert_records(&[record("PD1234_RED_1.jpg", "b")]).await.unwrap();
        assert_eq!(store.count_records().await.unwrap(), 1);
        let page = store.scan_records_page(None, 10).await.unwrap();
        assert_eq!(page[0].storage_locator, "b");
    }

    #[tokio::test]
    async fn record_and_unparsed_buckets_are_exclusive() {
        let store = MemoryIndexStore::new();
        store.upsert_unparsed(&[unparsed("PD1234_RED_1.jpg")]).await.unwrap();
        store.upsert_records(&[record("PD1234_RED_1.jpg", "a")]).await.unwrap();
        assert_eq!(store.count_unparsed().await.unwrap(), 0);
        assert_eq!(store.count_records().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn keyset_pages_walk_in_filename_order() {
        let store = MemoryIndexStore::new();
        let records: Vec<ImageRecord> = ["PD1234_C_1.jpg", "PD1234_A_1.jpg", "PD1234_B_1.jpg"]
            .iter()
            .map(|n| record(n, "x"))
            .collect();
        store.upsert_records(&records).await.unwrap();
        let first = store.scan_records_page(None, 2).await.unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].filename, "PD1234_A_1.jpg");
        let rest = store
            .scan_records_page(Some(first[1].filename.as_str()), 2)
            .await
            .unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].filename, "PD1234_C_1.jpg");
    }

    #[tokio::test]
    async fn staging_is_invisible_until_commit() {
        let store = MemoryIndexStore::new();
        store.upsert_records(&[record("OLD1234_RED_1.jpg", "old")]).await.unwrap();
        store.stage_records(&[record("NEW1234_RED_1.jpg", "new")]).await.unwrap();
        store.stage_unparsed(&[unparsed("banner.jpg")]).await.unwrap();
        let live = store.scan_records_page(None, 10).await.unwrap();
        assert_eq!(live[0].filename, "OLD1234_RED_1.jpg");

        assert_eq!(store.commit_staging().await.unwrap(), 1);
        let live = store.scan_records_page(None, 10).await.unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].filename, "NEW1234_RED_1.jpg");
        assert_eq!(store.count_unparsed().await.unwrap(), 1);
        assert_eq!(store.staged_count().await, 0);
    }

    #[tokio::test]
    async fn delete_covers_both_buckets() {
        let store = MemoryIndexStore::new();
        store.upsert_records(&[record("PD1234_RED_1.jpg", "a")]).await.unwrap();
        store.upsert_unparsed(&[unparsed("banner.jpg")]).await.unwrap();
        let removed = store
            .delete_records(&["PD1234_RED_1.jpg".into(), "banner.jpg".into(), "missing.jpg".into()])
            .await
            .unwrap();
        assert_eq!(removed, 2);
        assert_eq!(store.count_records().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn injected_faults_are_transient() {
        let store = MemoryIndexStore::new();
        store.fail_next_writes(1);
        let err = store.upsert_records(&[record("PD1234_RED_1.jpg", "a")]).await.unwrap_err();
        assert!(err.is_transient());
        assert!(store.upsert_records(&[record("PD1234_RED_1.jpg", "a")]).await.is_ok());

        store.poison("PD1234_RED_2.jpg");
        for _ in 0..3 {
            assert!(store.upsert_records(&[record("PD1234_RED_2.jpg", "a")]).await.is_err());
        }
        assert_eq!(store.write_calls(), 5);
    }

    #[tokio::test]
    async fn load_index_rebuilds_from_pages() {
        let store = MemoryIndexStore::new();
        let records: Vec<ImageRecord> = (0..7)
            .map(|i| record(&format!("PD12{i:02}_RED_{i}.jpg"), "x"))
            .collect();
        store.upsert_records(&records).await.unwrap();
        store.upsert_unparsed(&[unparsed("banner.jpg")]).await.unwrap();
        let (index, bucket) = load_index(&store, 3, RetryPolicy::no_wait(2)).await.unwrap();
        assert_eq!(index.record_count(), 7);
        assert_eq!(index, ImageIndex::from_records(records));
        assert_eq!(bucket.len(), 1);
    }
}
