//! Scripted doubles shared by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ouroboros_doccache::{
    CacheConfig, CacheEntry, CacheError, CacheManager, DocumentationProvider, DurableSummary,
    DurableTier, FastTier, MemoryFastTier, NewEntry, ProjectLibraryUsage, ProviderDocument,
    QueryLogEntry, Result, SqliteDurableTier, TierKind, UsageStore,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Provider that counts calls and can be slowed down or broken per library
#[derive(Default)]
pub struct CountingProvider {
    calls: AtomicUsize,
    delay: Duration,
    slow_libraries: HashSet<String>,
    failing_libraries: HashSet<String>,
    fail_all: bool,
}

impl CountingProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Only these libraries wait for the delay
    pub fn slow_for(mut self, library: &str) -> Self {
        self.slow_libraries.insert(library.to_string());
        self
    }

    pub fn failing_for(mut self, library: &str) -> Self {
        self.failing_libraries.insert(library.to_string());
        self
    }

    pub fn always_failing(mut self) -> Self {
        self.fail_all = true;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DocumentationProvider for CountingProvider {
    async fn fetch(&self, library_id: &str, version: &str, query: &str) -> Result<ProviderDocument> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if self.slow_libraries.is_empty() || self.slow_libraries.contains(library_id) {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail_all || self.failing_libraries.contains(library_id) {
            return Err(CacheError::ProviderFailure(format!(
                "no docs for {}",
                library_id
            )));
        }

        Ok(ProviderDocument::new(format!(
            "{}@{} docs for {:?}",
            library_id, version, query
        )))
    }
}

/// Fast tier whose every call fails immediately
pub struct DownFastTier;

#[async_trait]
impl FastTier for DownFastTier {
    async fn get(&self, _key: &str) -> Result<Option<String>> {
        Err(CacheError::unavailable(TierKind::Fast, "connection refused"))
    }

    async fn set_ex(&self, _key: &str, _value: String, _ttl: Duration) -> Result<()> {
        Err(CacheError::unavailable(TierKind::Fast, "connection refused"))
    }

    async fn del(&self, _key: &str) -> Result<()> {
        Err(CacheError::unavailable(TierKind::Fast, "connection refused"))
    }
}

/// Fast tier whose every call hangs
pub struct HangingFastTier;

#[async_trait]
impl FastTier for HangingFastTier {
    async fn get(&self, _key: &str) -> Result<Option<String>> {
        std::future::pending().await
    }

    async fn set_ex(&self, _key: &str, _value: String, _ttl: Duration) -> Result<()> {
        std::future::pending().await
    }

    async fn del(&self, _key: &str) -> Result<()> {
        std::future::pending().await
    }
}

/// Durable tier whose every call fails immediately
pub struct DownDurableTier;

fn durable_down<T>() -> Result<T> {
    Err(CacheError::unavailable(TierKind::Durable, "database is locked"))
}

#[async_trait]
impl DurableTier for DownDurableTier {
    async fn fetch_entry(&self, _fingerprint: &str) -> Result<Option<CacheEntry>> {
        durable_down()
    }

    async fn upsert_entry(&self, _entry: &NewEntry, _now: DateTime<Utc>) -> Result<()> {
        durable_down()
    }

    async fn delete_entry(&self, _fingerprint: &str) -> Result<bool> {
        durable_down()
    }

    async fn record_hit(&self, _fingerprint: &str, _at: DateTime<Utc>) -> Result<()> {
        durable_down()
    }

    async fn stale_candidates(
        &self,
        _fetched_before: DateTime<Utc>,
        _accessed_after: DateTime<Utc>,
        _limit: usize,
    ) -> Result<Vec<CacheEntry>> {
        durable_down()
    }

    async fn append_query_log(&self, _entry: &QueryLogEntry) -> Result<()> {
        durable_down()
    }

    async fn query_log_for(&self, _fingerprint: &str) -> Result<Vec<QueryLogEntry>> {
        durable_down()
    }

    async fn summary(&self) -> Result<DurableSummary> {
        durable_down()
    }
}

/// Usage store whose every call hangs
pub struct HangingUsageStore;

#[async_trait]
impl UsageStore for HangingUsageStore {
    async fn upsert_usage(
        &self,
        _project_path: &str,
        _library_id: &str,
        _major_version: Option<&str>,
        _at: DateTime<Utc>,
    ) -> Result<()> {
        std::future::pending().await
    }

    async fn mark_declared(
        &self,
        _project_path: &str,
        _library_id: &str,
        _major_version: Option<&str>,
    ) -> Result<()> {
        std::future::pending().await
    }

    async fn project_usage(&self, _project_path: &str) -> Result<Vec<ProjectLibraryUsage>> {
        std::future::pending().await
    }
}

/// SQLite durable tier whose hit counter and query log writes are slow
pub struct SlowBookkeepingTier {
    pub inner: Arc<SqliteDurableTier>,
    pub delay: Duration,
}

#[async_trait]
impl DurableTier for SlowBookkeepingTier {
    async fn fetch_entry(&self, fingerprint: &str) -> Result<Option<CacheEntry>> {
        self.inner.fetch_entry(fingerprint).await
    }

    async fn upsert_entry(&self, entry: &NewEntry, now: DateTime<Utc>) -> Result<()> {
        self.inner.upsert_entry(entry, now).await
    }

    async fn delete_entry(&self, fingerprint: &str) -> Result<bool> {
        self.inner.delete_entry(fingerprint).await
    }

    async fn record_hit(&self, fingerprint: &str, at: DateTime<Utc>) -> Result<()> {
        tokio::time::sleep(self.delay).await;
        self.inner.record_hit(fingerprint, at).await
    }

    async fn stale_candidates(
        &self,
        fetched_before: DateTime<Utc>,
        accessed_after: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<CacheEntry>> {
        self.inner
            .stale_candidates(fetched_before, accessed_after, limit)
            .await
    }

    async fn append_query_log(&self, entry: &QueryLogEntry) -> Result<()> {
        tokio::time::sleep(self.delay).await;
        self.inner.append_query_log(entry).await
    }

    async fn query_log_for(&self, fingerprint: &str) -> Result<Vec<QueryLogEntry>> {
        self.inner.query_log_for(fingerprint).await
    }

    async fn summary(&self) -> Result<DurableSummary> {
        self.inner.summary().await
    }
}

pub fn test_config() -> CacheConfig {
    CacheConfig::builder()
        .fast_tier_timeout(Duration::from_millis(50))
        .durable_tier_timeout(Duration::from_millis(500))
        .staleness_threshold(Duration::from_secs(3600))
        .refresh_backoff_base(Duration::from_millis(1))
        .refresh_max_retries(1)
        .build()
}

pub fn new_entry(fingerprint: &str, content: &str) -> NewEntry {
    let (head, intent) = fingerprint.rsplit_once(':').unwrap();
    let (library, major) = head.rsplit_once('-').unwrap();
    NewEntry {
        fingerprint: fingerprint.to_string(),
        library_id: library.to_string(),
        library_major_version: major.to_string(),
        intent_label: intent.to_string(),
        content: content.to_string(),
        citations: None,
    }
}

/// Manager over a memory fast tier and an in-memory SQLite durable tier
pub async fn memory_manager(config: CacheConfig) -> (Arc<CacheManager>, Arc<SqliteDurableTier>) {
    let durable = Arc::new(SqliteDurableTier::in_memory().await.unwrap());
    let manager = Arc::new(CacheManager::new(
        config,
        Arc::new(MemoryFastTier::default()),
        durable.clone(),
    ));
    (manager, durable)
}
