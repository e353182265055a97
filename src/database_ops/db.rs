use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::{info, instrument};

use crate::database_ops::image_index::{ImageRecord, UnparsedImage};
use crate::database_ops::index_builder::BuildReport;
use crate::database_ops::index_store::IndexStore;
use crate::error::StoreError;
use crate::normalization::filename::{ParseConfidence, ParseFailure};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS image_records (
        filename TEXT PRIMARY KEY NOT NULL,
        model_ref TEXT NOT NULL,
        color TEXT NOT NULL,
        view_tag TEXT,
        storage_locator TEXT NOT NULL,
        parse_confidence TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS image_records_model_idx ON image_records (model_ref, color)",
    "CREATE TABLE IF NOT EXISTS image_records_staging (
        filename TEXT PRIMARY KEY NOT NULL,
        model_ref TEXT NOT NULL,
        color TEXT NOT NULL,
        view_tag TEXT,
        storage_locator TEXT NOT NULL,
        parse_confidence TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS unparsed_images (
        filename TEXT PRIMARY KEY NOT NULL,
        storage_locator TEXT NOT NULL,
        reason TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS unparsed_images_staging (
        filename TEXT PRIMARY KEY NOT NULL,
        storage_locator TEXT NOT NULL,
        reason TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS index_runs (
        run_id TEXT PRIMARY KEY NOT NULL,
        mode TEXT NOT NULL,
        started_at TEXT NOT NULL,
        finished_at TEXT NOT NULL,
        total_listed INTEGER NOT NULL,
        parsed INTEGER NOT NULL,
        unparsed INTEGER NOT NULL,
        duplicates INTEGER NOT NULL,
        failed_pages INTEGER NOT NULL,
        swapped INTEGER NOT NULL,
        fingerprint TEXT NOT NULL
    )",
];

const UPSERT_RECORD: &str = "INSERT INTO {table} (filename, model_ref, color, view_tag, storage_locator, parse_confidence, updated_at)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
     ON CONFLICT(filename) DO UPDATE SET
        model_ref = excluded.model_ref,
        color = excluded.color,
        view_tag = excluded.view_tag,
        storage_locator = excluded.storage_locator,
        parse_confidence = excluded.parse_confidence,
        updated_at = excluded.updated_at";

const UPSERT_UNPARSED: &str = "INSERT INTO {table} (filename, storage_locator, reason, updated_at)
     VALUES (?1, ?2, ?3, ?4)
     ON CONFLICT(filename) DO UPDATE SET
        storage_locator = excluded.storage_locator,
        reason = excluded.reason,
        updated_at = excluded.updated_at";

/// One row of `index_runs`.
#[derive(Debug, Clone, Serialize)]
pub struct RunRow {
    pub run_id: String,
    pub mode: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub total_listed: i64,
    pub parsed: i64,
    pub unparsed: i64,
    pub duplicates: i64,
    pub failed_pages: i64,
    pub swapped: bool,
    pub fingerprint: String,
}

/// SQLite-backed index store.
#[derive(Clone, Debug)]
pub struct Db {
    pub pool: SqlitePool,
}

impl Db {
    // SECURITY: never include raw DSNs in tracing spans.
    #[instrument(skip(database_url))]
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let in_memory = database_url.contains(":memory:");
        let mut options = SqliteConnectOptions::from_str(database_url)
            .context("invalid sqlite url")?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));
        if !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        // an in-memory database lives and dies with its single connection
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new()
                .max_connections(max_connections.max(1))
                .acquire_timeout(Duration::from_secs(10))
                .idle_timeout(Duration::from_secs(600))
        };
        let pool = pool_options.connect_with(options).await?;
        info!(in_memory, "connected to index db");

        let db = Self { pool };
        db.ensure_schema().await?;
        Ok(db)
    }

    async fn ensure_schema(&self) -> Result<()> {
        for stmt in SCHEMA {
            sqlx::query(stmt)
                .execute(&self.pool)
                .await
                .context("creating index schema")?;
        }
        Ok(())
    }

    pub async fn record_run(&self, report: &BuildReport) -> Result<()> {
        sqlx::query(
            "INSERT INTO index_runs (run_id, mode, started_at, finished_at, total_listed, parsed, unparsed, duplicates, failed_pages, swapped, fingerprint)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        )
        .bind(report.run_id.to_string())
        .bind(report.mode.as_str())
        .bind(report.started_at)
        .bind(report.finished_at)
        .bind(report.total_listed as i64)
        .bind(report.parsed as i64)
        .bind(report.unparsed as i64)
        .bind(report.duplicates as i64)
        .bind(report.failed_pages.len() as i64)
        .bind(report.swapped)
        .bind(&report.fingerprint)
        .execute(&self.pool)
        .await
        .context("recording index run")?;
        Ok(())
    }

    pub async fn recent_runs(&self, limit: i64) -> Result<Vec<RunRow>> {
        let rows = sqlx::query(
            "SELECT run_id, mode, started_at, finished_at, total_listed, parsed, unparsed, duplicates, failed_pages, swapped, fingerprint
             FROM index_runs ORDER BY started_at DESC LIMIT ?1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| -> Result<RunRow> {
                Ok(RunRow {
                    run_id: r.try_get("run_id")?,
                    mode: r.try_get("mode")?,
                    started_at: r.try_get("started_at")?,
                    finished_at: r.try_get("finished_at")?,
                    total_listed: r.try_get("total_listed")?,
                    parsed: r.try_get("parsed")?,
                    unparsed: r.try_get("unparsed")?,
                    duplicates: r.try_get("duplicates")?,
                    failed_pages: r.try_get("failed_pages")?,
                    swapped: r.try_get("swapped")?,
                    fingerprint: r.try_get("fingerprint")?,
                })
            })
            .collect()
    }

    /// `(model_ref, image count)` for the most populated model refs.
    pub async fn top_models(&self, limit: i64) -> Result<Vec<(String, i64)>> {
        let rows = sqlx::query(
            "SELECT model_ref, COUNT(*) AS n FROM image_records GROUP BY model_ref ORDER BY n DESC, model_ref LIMIT ?1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| -> Result<(String, i64)> { Ok((r.try_get("model_ref")?, r.try_get("n")?)) })
            .collect()
    }

    pub async fn count_low_confidence(&self) -> Result<i64> {
        let n: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM image_records WHERE parse_confidence = 'LOW'",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(n)
    }

    async fn write_records(&self, table: &str, records: &[ImageRecord]) -> Result<u64, StoreError> {
        let sql = UPSERT_RECORD.replace("{table}", table);
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        for r in records {
            sqlx::query(&sql)
                .bind(&r.filename)
                .bind(&r.raw_model_ref)
                .bind(&r.raw_color)
                .bind(r.view_tag.as_deref())
                .bind(&r.storage_locator)
                .bind(r.parse_confidence.as_str())
                .bind(now)
                .execute(&mut *tx)
                .await?;
            if table == "image_records" {
                sqlx::query("DELETE FROM unparsed_images WHERE filename = ?1")
                    .bind(&r.filename)
                    .execute(&mut *tx)
                    .await?;
            }
        }
        tx.commit().await?;
        Ok(records.len() as u64)
    }

    async fn write_unparsed(&self, table: &str, items: &[UnparsedImage]) -> Result<u64, StoreError> {
        let sql = UPSERT_UNPARSED.replace("{table}", table);
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        for u in items {
            sqlx::query(&sql)
                .bind(&u.filename)
                .bind(&u.storage_locator)
                .bind(u.reason.as_str())
                .bind(now)
                .execute(&mut *tx)
                .await?;
            if table == "unparsed_images" {
                sqlx::query("DELETE FROM image_records WHERE filename = ?1")
                    .bind(&u.filename)
                    .execute(&mut *tx)
                    .await?;
            }
        }
        tx.commit().await?;
        Ok(items.len() as u64)
    }
}

fn record_from_row(row: &SqliteRow) -> Result<ImageRecord, sqlx::Error> {
    let confidence: String = row.try_get("parse_confidence")?;
    Ok(ImageRecord {
        filename: row.try_get("filename")?,
        raw_model_ref: row.try_get("model_ref")?,
        raw_color: row.try_get("color")?,
        view_tag: row.try_get("view_tag")?,
        storage_locator: row.try_get("storage_locator")?,
        parse_confidence: ParseConfidence::from_db(&confidence),
    })
}

fn unparsed_from_row(row: &SqliteRow) -> Result<UnparsedImage, sqlx::Error> {
    let reason: String = row.try_get("reason")?;
    Ok(UnparsedImage {
        filename: row.try_get("filename")?,
        storage_locator: row.try_get("storage_locator")?,
        reason: ParseFailure::from_db(&reason),
    })
}

#[async_trait]
impl IndexStore for Db {
    async fn upsert_records(&self, records: &[ImageRecord]) -> Result<u64, StoreError> {
        self.write_records("image_records", records).await
    }

    async fn upsert_unparsed(&self, items: &[UnparsedImage]) -> Result<u64, StoreError> {
        self.write_unparsed("unparsed_images", items).await
    }

    async fn delete_records(&self, filenames: &[String]) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut removed = 0u64;
        for name in filenames {
            let a = sqlx::query("DELETE FROM image_records WHERE filename = ?1")
                .bind(name)
                .execute(&mut *tx)
                .await?
                .rows_affected();
            let b = sqlx::query("DELETE FROM unparsed_images WHERE filename = ?1")
                .bind(name)
                .execute(&mut *tx)
                .await?
                .rows_affected();
            if a + b > 0 {
                removed += 1;
            }
        }
        tx.commit().await?;
        Ok(removed)
    }

    async fn scan_records_page(
        &self,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ImageRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT filename, model_ref, color, view_tag, storage_locator, parse_confidence
             FROM image_records WHERE (?1 IS NULL OR filename > ?1) ORDER BY filename LIMIT ?2",
        )
        .bind(after)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| record_from_row(r).map_err(StoreError::from))
            .collect()
    }

    async fn scan_unparsed_page(
        &self,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<UnparsedImage>, StoreError> {
        let rows = sqlx::query(
            "SELECT filename, storage_locator, reason
             FROM unparsed_images WHERE (?1 IS NULL OR filename > ?1) ORDER BY filename LIMIT ?2",
        )
        .bind(after)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| unparsed_from_row(r).map_err(StoreError::from))
            .collect()
    }

    async fn stage_records(&self, records: &[ImageRecord]) -> Result<u64, StoreError> {
        self.write_records("image_records_staging", records).await
    }

    async fn stage_unparsed(&self, items: &[UnparsedImage]) -> Result<u64, StoreError> {
        self.write_unparsed("unparsed_images_staging", items).await
    }

    async fn clear_staging(&self) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM image_records_staging")
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM unparsed_images_staging")
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn commit_staging(&self) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM image_records").execute(&mut *tx).await?;
        sqlx::query(
            "INSERT INTO image_records (filename, model_ref, color, view_tag, storage_locator, parse_confidence, updated_at)
             SELECT filename, model_ref, color, view_tag, storage_locator, parse_confidence, updated_at
             FROM image_records_staging",
        )
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM unparsed_images").execute(&mut *tx).await?;
        sqlx::query(
            "INSERT INTO unparsed_images (filename, storage_locator, reason, updated_at)
             SELECT filename, storage_locator, reason, updated_at FROM unparsed_images_staging",
        )
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM image_records_staging")
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM unparsed_images_staging")
            .execute(&mut *tx)
            .await?;
        let live: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM image_records")
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;
        info!(target = "db", live, "staging committed");
        Ok(live as u64)
    }

    async fn count_records(&self) -> Result<u64, StoreError> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM image_records")
            .fetch_one(&self.pool)
            .await?;
        Ok(n as u64)
    }

    async fn count_unparsed(&self) -> Result<u64, StoreError> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM unparsed_images")
            .fetch_one(&self.pool)
            .await?;
        Ok(n as u64)
    }
}
