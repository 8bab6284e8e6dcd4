//! SQLite durable tier
//!
//! Holds the authoritative copy of every cache entry together with the usage
//! analytics (`project_library_usage`) and the append-only `query_log`.
//! Timestamps are stored as Unix milliseconds so range predicates compare
//! integers.

use crate::error::{CacheError, Result};
use crate::tier::{DurableTier, UsageStore};
use crate::types::{
    CacheEntry, DetectionSource, DurableSummary, NewEntry, ProjectLibraryUsage, QueryLogEntry,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Pool, Row, Sqlite};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS cache_entries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    fingerprint TEXT NOT NULL UNIQUE,
    library_id TEXT NOT NULL,
    library_version TEXT NOT NULL,
    intent TEXT NOT NULL,
    content TEXT NOT NULL,
    citations TEXT,
    query_count INTEGER NOT NULL DEFAULT 0,
    last_accessed_at INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    fetched_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_cache_entries_fingerprint ON cache_entries(fingerprint);
CREATE INDEX IF NOT EXISTS idx_cache_entries_last_accessed ON cache_entries(last_accessed_at DESC);

CREATE TABLE IF NOT EXISTS project_library_usage (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    project_path TEXT NOT NULL,
    library_id TEXT NOT NULL,
    version TEXT,
    detection_source TEXT NOT NULL CHECK (detection_source IN ('manifest', 'usage')),
    usage_count INTEGER NOT NULL DEFAULT 0,
    last_used_at INTEGER,
    UNIQUE(project_path, library_id)
);
CREATE INDEX IF NOT EXISTS idx_project_library_usage_project ON project_library_usage(project_path);

CREATE TABLE IF NOT EXISTS query_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    fingerprint TEXT NOT NULL,
    original_query TEXT,
    cache_hit INTEGER NOT NULL,
    response_time_ms INTEGER NOT NULL,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_query_log_fingerprint ON query_log(fingerprint);
"#;

const ENTRY_COLUMNS: &str = "fingerprint, library_id, library_version, intent, content, citations, \
     query_count, last_accessed_at, created_at, fetched_at";

/// SQLite-backed durable tier
#[derive(Clone)]
pub struct SqliteDurableTier {
    pool: Pool<Sqlite>,
}

impl SqliteDurableTier {
    /// Open (or create) a database file
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                CacheError::ConfigError(format!("cannot create {}: {}", parent.display(), e))
            })?;
        }

        let opts = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(opts)
            .await?;

        info!("Opened durable tier at {}", path.display());
        Self::with_pool(pool).await
    }

    /// Private in-memory database, used by tests and dry runs
    pub async fn in_memory() -> Result<Self> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")?;

        // Every connection to :memory: is a separate database; keep exactly one alive
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(opts)
            .await?;

        Self::with_pool(pool).await
    }

    async fn with_pool(pool: Pool<Sqlite>) -> Result<Self> {
        let tier = Self { pool };
        tier.migrate().await?;
        Ok(tier)
    }

    /// Create tables and indexes if missing
    pub async fn migrate(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA_SQL).execute(&self.pool).await?;
        debug!("Durable tier schema ready");
        Ok(())
    }

    /// Check database connectivity
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .ok_or_else(|| CacheError::SerializationError(format!("timestamp out of range: {}", ms)))
}

fn entry_from_row(row: &SqliteRow) -> Result<CacheEntry> {
    let citations: Option<String> = row.try_get("citations")?;
    let citations: Option<serde_json::Value> = citations
        .map(|raw| serde_json::from_str(&raw))
        .transpose()?;

    Ok(CacheEntry {
        fingerprint: row.try_get("fingerprint")?,
        library_id: row.try_get("library_id")?,
        library_major_version: row.try_get("library_version")?,
        intent_label: row.try_get("intent")?,
        content: row.try_get("content")?,
        citations,
        query_count: row.try_get::<i64, _>("query_count")?.max(0) as u64,
        last_accessed_at: from_millis(row.try_get("last_accessed_at")?)?,
        created_at: from_millis(row.try_get("created_at")?)?,
        fetched_at: from_millis(row.try_get("fetched_at")?)?,
    })
}

fn usage_from_row(row: &SqliteRow) -> Result<ProjectLibraryUsage> {
    let source: String = row.try_get("detection_source")?;
    let last_used_at: Option<i64> = row.try_get("last_used_at")?;

    Ok(ProjectLibraryUsage {
        project_path: row.try_get("project_path")?,
        library_id: row.try_get("library_id")?,
        library_major_version: row.try_get("version")?,
        detection_source: DetectionSource::from_str(&source)
            .map_err(CacheError::SerializationError)?,
        usage_count: row.try_get::<i64, _>("usage_count")?.max(0) as u64,
        last_used_at: last_used_at.map(from_millis).transpose()?,
    })
}

fn log_from_row(row: &SqliteRow) -> Result<QueryLogEntry> {
    Ok(QueryLogEntry {
        fingerprint: row.try_get("fingerprint")?,
        original_query: row.try_get("original_query")?,
        cache_hit: row.try_get::<i64, _>("cache_hit")? != 0,
        response_time_ms: row.try_get::<i64, _>("response_time_ms")?.max(0) as u64,
        created_at: from_millis(row.try_get("created_at")?)?,
    })
}

#[async_trait]
impl DurableTier for SqliteDurableTier {
    async fn fetch_entry(&self, fingerprint: &str) -> Result<Option<CacheEntry>> {
        let sql = format!("SELECT {} FROM cache_entries WHERE fingerprint = ?", ENTRY_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(fingerprint)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(entry_from_row).transpose()
    }

    async fn upsert_entry(&self, entry: &NewEntry, now: DateTime<Utc>) -> Result<()> {
        let citations = entry
            .citations
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let now = to_millis(now);

        sqlx::query(
            "INSERT INTO cache_entries \
                (fingerprint, library_id, library_version, intent, content, citations, \
                 query_count, last_accessed_at, created_at, fetched_at) \
             VALUES (?, ?, ?, ?, ?, ?, 0, ?, ?, ?) \
             ON CONFLICT(fingerprint) DO UPDATE SET \
                library_id = excluded.library_id, \
                library_version = excluded.library_version, \
                intent = excluded.intent, \
                content = excluded.content, \
                citations = excluded.citations, \
                fetched_at = excluded.fetched_at",
        )
        .bind(&entry.fingerprint)
        .bind(&entry.library_id)
        .bind(&entry.library_major_version)
        .bind(&entry.intent_label)
        .bind(&entry.content)
        .bind(citations)
        .bind(now)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete_entry(&self, fingerprint: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM cache_entries WHERE fingerprint = ?")
            .bind(fingerprint)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn record_hit(&self, fingerprint: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE cache_entries SET query_count = query_count + 1, last_accessed_at = ? \
             WHERE fingerprint = ?",
        )
        .bind(to_millis(at))
        .bind(fingerprint)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn stale_candidates(
        &self,
        fetched_before: DateTime<Utc>,
        accessed_after: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<CacheEntry>> {
        let sql = format!(
            "SELECT {} FROM cache_entries \
             WHERE fetched_at < ? AND last_accessed_at >= ? \
             ORDER BY last_accessed_at DESC LIMIT ?",
            ENTRY_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(to_millis(fetched_before))
            .bind(to_millis(accessed_after))
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(entry_from_row).collect()
    }

    async fn append_query_log(&self, entry: &QueryLogEntry) -> Result<()> {
        sqlx::query(
            "INSERT INTO query_log (fingerprint, original_query, cache_hit, response_time_ms, created_at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&entry.fingerprint)
        .bind(&entry.original_query)
        .bind(entry.cache_hit as i64)
        .bind(entry.response_time_ms as i64)
        .bind(to_millis(entry.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn query_log_for(&self, fingerprint: &str) -> Result<Vec<QueryLogEntry>> {
        let rows = sqlx::query(
            "SELECT fingerprint, original_query, cache_hit, response_time_ms, created_at \
             FROM query_log WHERE fingerprint = ? ORDER BY id",
        )
        .bind(fingerprint)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(log_from_row).collect()
    }

    async fn summary(&self) -> Result<DurableSummary> {
        let entries: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM cache_entries")
            .fetch_one(&self.pool)
            .await?;
        let row = sqlx::query(
            "SELECT COUNT(*) AS total, COALESCE(SUM(cache_hit), 0) AS hits FROM query_log",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(DurableSummary {
            entries: entries.max(0) as u64,
            logged_queries: row.try_get::<i64, _>("total")?.max(0) as u64,
            logged_hits: row.try_get::<i64, _>("hits")?.max(0) as u64,
        })
    }
}

#[async_trait]
impl UsageStore for SqliteDurableTier {
    async fn upsert_usage(
        &self,
        project_path: &str,
        library_id: &str,
        major_version: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO project_library_usage \
                (project_path, library_id, version, detection_source, usage_count, last_used_at) \
             VALUES (?, ?, ?, 'usage', 1, ?) \
             ON CONFLICT(project_path, library_id) DO UPDATE SET \
                usage_count = project_library_usage.usage_count + 1, \
                last_used_at = excluded.last_used_at, \
                version = COALESCE(excluded.version, project_library_usage.version)",
        )
        .bind(project_path)
        .bind(library_id)
        .bind(major_version)
        .bind(to_millis(at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_declared(
        &self,
        project_path: &str,
        library_id: &str,
        major_version: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO project_library_usage \
                (project_path, library_id, version, detection_source, usage_count, last_used_at) \
             VALUES (?, ?, ?, 'manifest', 0, NULL) \
             ON CONFLICT(project_path, library_id) DO UPDATE SET \
                detection_source = 'manifest', \
                version = COALESCE(excluded.version, project_library_usage.version)",
        )
        .bind(project_path)
        .bind(library_id)
        .bind(major_version)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn project_usage(&self, project_path: &str) -> Result<Vec<ProjectLibraryUsage>> {
        let rows = sqlx::query(
            "SELECT project_path, library_id, version, detection_source, usage_count, last_used_at \
             FROM project_library_usage WHERE project_path = ? ORDER BY library_id",
        )
        .bind(project_path)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(usage_from_row).collect()
    }
}
