//! Storage tiers
//!
//! The fast tier is a volatile key/value store with GET/SETEX/DEL semantics.
//! The durable tier is the relational source of truth for cached payloads,
//! usage counters and the query log.
//!
//! Key namespaces in the fast tier:
//! - `cache:{fingerprint}` holds a serialized [`CacheEntry`]
//! - `project:{project_path}:libs` holds the serialized usage rows of a project

pub mod memory;
pub mod sqlite;

use crate::error::Result;
use crate::types::{
    CacheEntry, DurableSummary, NewEntry, ProjectLibraryUsage, QueryLogEntry,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

pub use memory::MemoryFastTier;
pub use sqlite::SqliteDurableTier;

/// Which tier an operation touched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TierKind {
    Fast,
    Durable,
}

impl fmt::Display for TierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TierKind::Fast => write!(f, "fast"),
            TierKind::Durable => write!(f, "durable"),
        }
    }
}

/// Fast tier key for a cache entry
pub fn entry_key(fingerprint: &str) -> String {
    format!("cache:{}", fingerprint)
}

/// Fast tier key for a project's library list
pub fn project_key(project_path: &str) -> String {
    format!("project:{}:libs", project_path)
}

/// Volatile key/value tier
///
/// Implementations may lose data at any time. TTLs are advisory.
#[async_trait]
pub trait FastTier: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set_ex(&self, key: &str, value: String, ttl: Duration) -> Result<()>;

    /// Deleting an absent key is not an error
    async fn del(&self, key: &str) -> Result<()>;
}

/// Durable store for cache entries and the query log
#[async_trait]
pub trait DurableTier: Send + Sync {
    async fn fetch_entry(&self, fingerprint: &str) -> Result<Option<CacheEntry>>;

    /// Insert or fully replace the payload of an entry.
    ///
    /// Replacement keeps `created_at` and `query_count` and resets `fetched_at`.
    async fn upsert_entry(&self, entry: &NewEntry, now: DateTime<Utc>) -> Result<()>;

    /// Returns whether a row was removed
    async fn delete_entry(&self, fingerprint: &str) -> Result<bool>;

    /// Increment `query_count` and bump `last_accessed_at`
    async fn record_hit(&self, fingerprint: &str, at: DateTime<Utc>) -> Result<()>;

    /// Entries fetched before `fetched_before` and read after `accessed_after`,
    /// most recently accessed first
    async fn stale_candidates(
        &self,
        fetched_before: DateTime<Utc>,
        accessed_after: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<CacheEntry>>;

    async fn append_query_log(&self, entry: &QueryLogEntry) -> Result<()>;

    async fn query_log_for(&self, fingerprint: &str) -> Result<Vec<QueryLogEntry>>;

    async fn summary(&self) -> Result<DurableSummary>;
}

/// Durable store for per-project library usage
#[async_trait]
pub trait UsageStore: Send + Sync {
    /// Create or bump the usage row; new rows are `usage`-detected
    async fn upsert_usage(
        &self,
        project_path: &str,
        library_id: &str,
        major_version: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<()>;

    /// Create or promote a row to `manifest` detection without touching `usage_count`
    async fn mark_declared(
        &self,
        project_path: &str,
        library_id: &str,
        major_version: Option<&str>,
    ) -> Result<()>;

    async fn project_usage(&self, project_path: &str) -> Result<Vec<ProjectLibraryUsage>>;
}
