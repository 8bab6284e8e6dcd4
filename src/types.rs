//! Core records shared by the tiers, the manager and the usage tracker

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// A cached documentation answer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Unique key, see [`crate::fingerprint`]
    pub fingerprint: String,

    pub library_id: String,

    pub library_major_version: String,

    pub intent_label: String,

    /// Opaque payload returned by the provider
    pub content: String,

    /// Opaque provider metadata (sources, links)
    pub citations: Option<serde_json::Value>,

    /// Number of hits served
    pub query_count: u64,

    pub created_at: DateTime<Utc>,

    pub last_accessed_at: DateTime<Utc>,

    /// Last successful fetch from the provider; staleness is measured from here
    pub fetched_at: DateTime<Utc>,
}

impl CacheEntry {
    /// Time since the content was fetched
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.fetched_at)
            .to_std()
            .unwrap_or(Duration::from_secs(0))
    }

    /// Time since the entry was last read
    pub fn time_since_access(&self, now: DateTime<Utc>) -> Duration {
        (now - self.last_accessed_at)
            .to_std()
            .unwrap_or(Duration::from_secs(0))
    }

    /// Check if the content is older than `threshold`
    pub fn is_stale(&self, threshold: Duration, now: DateTime<Utc>) -> bool {
        self.age(now) > threshold
    }

    /// Check if the entry was read within `window`
    pub fn recently_accessed(&self, window: Duration, now: DateTime<Utc>) -> bool {
        self.time_since_access(now) <= window
    }

    /// Approximate size in bytes
    pub fn calculate_size(&self) -> usize {
        self.fingerprint.len()
            + self.content.len()
            + self
                .citations
                .as_ref()
                .map(|c| c.to_string().len())
                .unwrap_or(0)
            + std::mem::size_of::<Self>()
    }
}

/// Full replacement value written by `CacheManager::set`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEntry {
    pub fingerprint: String,
    pub library_id: String,
    pub library_major_version: String,
    pub intent_label: String,
    pub content: String,
    pub citations: Option<serde_json::Value>,
}

impl NewEntry {
    /// Materialize the entry as first written at `now`
    pub fn into_entry(self, now: DateTime<Utc>) -> CacheEntry {
        CacheEntry {
            fingerprint: self.fingerprint,
            library_id: self.library_id,
            library_major_version: self.library_major_version,
            intent_label: self.intent_label,
            content: self.content,
            citations: self.citations,
            query_count: 0,
            created_at: now,
            last_accessed_at: now,
            fetched_at: now,
        }
    }
}

/// Counters reported by `CacheManager::get_stats`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryStats {
    pub query_count: u64,
    pub last_accessed_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl From<&CacheEntry> for EntryStats {
    fn from(entry: &CacheEntry) -> Self {
        Self {
            query_count: entry.query_count,
            last_accessed_at: entry.last_accessed_at,
            created_at: entry.created_at,
        }
    }
}

/// How a library became known for a project
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionSource {
    /// Declared in the project manifest
    Manifest,
    /// Only seen in query activity
    Usage,
}

impl DetectionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetectionSource::Manifest => "manifest",
            DetectionSource::Usage => "usage",
        }
    }
}

impl fmt::Display for DetectionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DetectionSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manifest" => Ok(DetectionSource::Manifest),
            "usage" => Ok(DetectionSource::Usage),
            other => Err(format!("unknown detection source: {}", other)),
        }
    }
}

/// Per-project usage record for one library
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectLibraryUsage {
    pub project_path: String,
    pub library_id: String,
    /// Unknown until first real use or manifest sync
    pub library_major_version: Option<String>,
    pub detection_source: DetectionSource,
    pub usage_count: u64,
    pub last_used_at: Option<DateTime<Utc>>,
}

/// A library declared by the project manifest
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeclaredLibrary {
    pub library_id: String,
    pub major_version: Option<String>,
}

impl DeclaredLibrary {
    pub fn new(library_id: impl Into<String>, major_version: Option<&str>) -> Self {
        Self {
            library_id: library_id.into(),
            major_version: major_version.map(str::to_string),
        }
    }
}

/// Append-only query record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryLogEntry {
    pub fingerprint: String,
    pub original_query: Option<String>,
    pub cache_hit: bool,
    pub response_time_ms: u64,
    pub created_at: DateTime<Utc>,
}

impl QueryLogEntry {
    pub fn new(
        fingerprint: impl Into<String>,
        original_query: Option<String>,
        cache_hit: bool,
        response_time: Duration,
    ) -> Self {
        Self {
            fingerprint: fingerprint.into(),
            original_query,
            cache_hit,
            response_time_ms: response_time.as_millis() as u64,
            created_at: Utc::now(),
        }
    }
}

/// Aggregate view of the durable tier
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DurableSummary {
    pub entries: u64,
    pub logged_queries: u64,
    pub logged_hits: u64,
}

impl DurableSummary {
    /// Hit rate over the query log as a percentage
    pub fn hit_rate(&self) -> f64 {
        if self.logged_queries == 0 {
            0.0
        } else {
            (self.logged_hits as f64 / self.logged_queries as f64) * 100.0
        }
    }
}

/// In-process counters kept by the cache manager
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheMetrics {
    pub fast_hits: u64,
    pub durable_hits: u64,
    pub misses: u64,
    /// Lookups that could not consult the durable tier
    pub degraded: u64,
    pub writes: u64,
    pub failed_writes: u64,
    pub invalidations: u64,
}

impl CacheMetrics {
    pub fn hits(&self) -> u64 {
        self.fast_hits + self.durable_hits
    }

    /// Calculate cache hit rate as a percentage
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits() + self.misses + self.degraded;
        if total == 0 {
            0.0
        } else {
            (self.hits() as f64 / total as f64) * 100.0
        }
    }
}

impl fmt::Display for CacheMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CacheMetrics {{ fast_hits: {}, durable_hits: {}, misses: {}, degraded: {}, hit_rate: {:.2}%, writes: {}, failed_writes: {} }}",
            self.fast_hits,
            self.durable_hits,
            self.misses,
            self.degraded,
            self.hit_rate(),
            self.writes,
            self.failed_writes
        )
    }
}
