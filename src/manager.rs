//! Cache manager
//!
//! Orchestrates reads across the two tiers (fast, then durable, then miss),
//! writes (durable first, fast tier best-effort), invalidation and per-entry
//! statistics. Tier failures never escape: they surface as [`Lookup::Miss`],
//! [`Lookup::Degraded`] or `false`. The only error a caller can see is
//! [`CacheError::MalformedInput`].

use crate::config::CacheConfig;
use crate::error::{CacheError, Result};
use crate::fingerprint::Fingerprint;
use crate::provider::{DocumentationProvider, ProviderDocument};
use crate::tier::{entry_key, DurableTier, FastTier, TierKind};
use crate::types::{
    CacheEntry, CacheMetrics, DurableSummary, EntryStats, NewEntry, QueryLogEntry,
};
use chrono::Utc;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Outcome of a cache read
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    Hit { entry: CacheEntry, tier: TierKind },
    /// Both tiers answered and neither has the entry
    Miss,
    /// The durable tier could not be consulted and the fast tier had nothing
    Degraded,
}

impl Lookup {
    pub fn is_hit(&self) -> bool {
        matches!(self, Lookup::Hit { .. })
    }

    pub fn entry(&self) -> Option<&CacheEntry> {
        match self {
            Lookup::Hit { entry, .. } => Some(entry),
            _ => None,
        }
    }

    pub fn into_entry(self) -> Option<CacheEntry> {
        match self {
            Lookup::Hit { entry, .. } => Some(entry),
            _ => None,
        }
    }

    pub fn tier(&self) -> Option<TierKind> {
        match self {
            Lookup::Hit { tier, .. } => Some(*tier),
            _ => None,
        }
    }
}

/// Outcome of [`CacheManager::get_or_fetch`]
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    /// Served from cache
    Cached { entry: CacheEntry, tier: TierKind },
    /// Fetched live; `stored` is false when the durable write failed
    Fetched {
        document: ProviderDocument,
        stored: bool,
    },
    /// Not cached and the provider failed
    Unavailable { reason: String },
}

impl FetchOutcome {
    pub fn content(&self) -> Option<&str> {
        match self {
            FetchOutcome::Cached { entry, .. } => Some(&entry.content),
            FetchOutcome::Fetched { document, .. } => Some(&document.content),
            FetchOutcome::Unavailable { .. } => None,
        }
    }

    pub fn was_cached(&self) -> bool {
        matches!(self, FetchOutcome::Cached { .. })
    }
}

/// Two-tier cache manager
///
/// Constructed explicitly and shared behind an `Arc`; owns its tier handles.
pub struct CacheManager {
    config: CacheConfig,
    fast: Arc<dyn FastTier>,
    durable: Arc<dyn DurableTier>,
    metrics: Mutex<CacheMetrics>,
    /// Fire-and-forget bookkeeping for cache hits
    background: Mutex<JoinSet<()>>,
    /// Fingerprints of stale entries that were just read
    stale_tx: Option<mpsc::Sender<String>>,
}

impl CacheManager {
    pub fn new(config: CacheConfig, fast: Arc<dyn FastTier>, durable: Arc<dyn DurableTier>) -> Self {
        info!(
            "Initializing cache manager (fast timeout: {:?}, durable timeout: {:?})",
            config.fast_tier_timeout, config.durable_tier_timeout
        );

        Self {
            config,
            fast,
            durable,
            metrics: Mutex::new(CacheMetrics::default()),
            background: Mutex::new(JoinSet::new()),
            stale_tx: None,
        }
    }

    /// Report stale entries hit by `get` on `tx` for on-demand refresh
    pub fn with_refresh_queue(mut self, tx: mpsc::Sender<String>) -> Self {
        self.stale_tx = Some(tx);
        self
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn metrics(&self) -> CacheMetrics {
        *self.metrics.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Look up an entry by fingerprint
    pub async fn get(&self, fingerprint: &str) -> Result<Lookup> {
        self.get_logged(fingerprint, None).await
    }

    /// Look up an entry, recording `original_query` in the query log
    pub async fn get_logged(&self, fingerprint: &str, original_query: Option<&str>) -> Result<Lookup> {
        Fingerprint::parse(fingerprint)?;
        let started = Instant::now();
        let original_query = original_query.map(str::to_string);

        match self
            .bounded(TierKind::Fast, "fast get", self.fast.get(&entry_key(fingerprint)))
            .await
        {
            Ok(Some(raw)) => match serde_json::from_str::<CacheEntry>(&raw) {
                Ok(entry) => {
                    debug!("Fast tier hit: {}", fingerprint);
                    self.bump(|m| m.fast_hits += 1);
                    self.spawn_hit_bookkeeping(fingerprint, original_query, started.elapsed());
                    self.report_if_stale(&entry);
                    return Ok(Lookup::Hit {
                        entry,
                        tier: TierKind::Fast,
                    });
                }
                Err(e) => {
                    warn!("Dropping undecodable fast tier value for {}: {}", fingerprint, e);
                    let _ = self
                        .bounded(TierKind::Fast, "fast del", self.fast.del(&entry_key(fingerprint)))
                        .await;
                }
            },
            Ok(None) => debug!("Fast tier miss: {}", fingerprint),
            Err(e) => debug!("Fast tier skipped for {}: {}", fingerprint, e),
        }

        match self
            .bounded(TierKind::Durable, "durable get", self.durable.fetch_entry(fingerprint))
            .await
        {
            Ok(Some(mut entry)) => {
                debug!("Durable tier hit: {}", fingerprint);
                self.bump(|m| m.durable_hits += 1);

                // Counters are bumped in the background; mirror the increment
                entry.query_count += 1;
                entry.last_accessed_at = Utc::now();

                self.write_fast(&entry).await;
                self.spawn_hit_bookkeeping(fingerprint, original_query, started.elapsed());
                self.report_if_stale(&entry);

                Ok(Lookup::Hit {
                    entry,
                    tier: TierKind::Durable,
                })
            }
            Ok(None) => {
                debug!("Cache miss: {}", fingerprint);
                self.bump(|m| m.misses += 1);
                self.append_log(QueryLogEntry::new(
                    fingerprint,
                    original_query,
                    false,
                    started.elapsed(),
                ))
                .await;
                Ok(Lookup::Miss)
            }
            Err(e) => {
                warn!("Durable tier unavailable for {}: {}", fingerprint, e);
                self.bump(|m| m.degraded += 1);
                Ok(Lookup::Degraded)
            }
        }
    }

    /// Store a full entry. Returns `true` iff the durable write succeeded.
    pub async fn set(&self, entry: NewEntry) -> Result<bool> {
        validate_new_entry(&entry)?;
        let started = Instant::now();
        let now = Utc::now();

        if let Err(e) = self
            .bounded(
                TierKind::Durable,
                "durable set",
                self.durable.upsert_entry(&entry, now),
            )
            .await
        {
            warn!("Durable write failed for {}: {}", entry.fingerprint, e);
            self.bump(|m| m.failed_writes += 1);
            return Ok(false);
        }

        // Mirror the authoritative row so counters survive a fast tier round trip
        let stored = match self
            .bounded(
                TierKind::Durable,
                "durable get",
                self.durable.fetch_entry(&entry.fingerprint),
            )
            .await
        {
            Ok(Some(stored)) => stored,
            _ => entry.clone().into_entry(now),
        };

        self.write_fast(&stored).await;
        self.append_log(QueryLogEntry::new(
            entry.fingerprint.as_str(),
            None,
            false,
            started.elapsed(),
        ))
        .await;
        self.bump(|m| m.writes += 1);
        debug!("Stored cache entry: {}", entry.fingerprint);
        Ok(true)
    }

    /// Remove an entry from both tiers. Absence is not an error.
    ///
    /// Returns `false` only when the durable tier could not be reached.
    pub async fn invalidate(&self, fingerprint: &str) -> Result<bool> {
        Fingerprint::parse(fingerprint)?;

        let durable = self
            .bounded(
                TierKind::Durable,
                "durable delete",
                self.durable.delete_entry(fingerprint),
            )
            .await;

        if let Err(e) = self
            .bounded(TierKind::Fast, "fast del", self.fast.del(&entry_key(fingerprint)))
            .await
        {
            debug!("Fast tier delete failed for {}: {}", fingerprint, e);
        }

        match durable {
            Ok(removed) => {
                if removed {
                    info!("Invalidated cache entry: {}", fingerprint);
                }
                self.bump(|m| m.invalidations += 1);
                Ok(true)
            }
            Err(e) => {
                warn!("Durable delete failed for {}: {}", fingerprint, e);
                Ok(false)
            }
        }
    }

    /// Counters of an entry, read from the durable tier
    pub async fn get_stats(&self, fingerprint: &str) -> Result<Option<EntryStats>> {
        Fingerprint::parse(fingerprint)?;

        match self
            .bounded(TierKind::Durable, "durable get", self.durable.fetch_entry(fingerprint))
            .await
        {
            Ok(entry) => Ok(entry.as_ref().map(EntryStats::from)),
            Err(e) => {
                warn!("Cannot read stats for {}: {}", fingerprint, e);
                Ok(None)
            }
        }
    }

    /// Read from cache, falling back to `provider` and storing the result
    pub async fn get_or_fetch(
        &self,
        fingerprint: &Fingerprint,
        provider: &dyn DocumentationProvider,
        original_query: Option<&str>,
    ) -> Result<FetchOutcome> {
        if let Lookup::Hit { entry, tier } = self.get_logged(&fingerprint.key, original_query).await? {
            return Ok(FetchOutcome::Cached { entry, tier });
        }

        let query = original_query.unwrap_or(&fingerprint.intent);
        let document = match self.fetch_from_provider(fingerprint, provider, query).await {
            Ok(document) => document,
            Err(e) => {
                warn!("Provider fetch failed for {}: {}", fingerprint, e);
                return Ok(FetchOutcome::Unavailable {
                    reason: e.to_string(),
                });
            }
        };

        let stored = self
            .set(NewEntry {
                fingerprint: fingerprint.key.clone(),
                library_id: fingerprint.library.clone(),
                library_major_version: fingerprint.major_version.clone(),
                intent_label: fingerprint.intent.clone(),
                content: document.content.clone(),
                citations: document.citations.clone(),
            })
            .await?;

        if !stored {
            warn!("Serving {} live without caching", fingerprint);
        }
        Ok(FetchOutcome::Fetched { document, stored })
    }

    /// Provider call bounded by `provider_timeout`
    pub async fn fetch_from_provider(
        &self,
        fingerprint: &Fingerprint,
        provider: &dyn DocumentationProvider,
        query: &str,
    ) -> Result<ProviderDocument> {
        let limit = self.config.provider_timeout;
        match tokio::time::timeout(
            limit,
            provider.fetch(&fingerprint.library, &fingerprint.major_version, query),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(CacheError::Timeout {
                operation: format!("provider fetch {}", fingerprint),
                timeout_ms: limit.as_millis() as u64,
            }),
        }
    }

    /// Cache-only read: no hit counting, no query log, no promotion
    pub async fn peek(&self, fingerprint: &str) -> Result<Lookup> {
        Fingerprint::parse(fingerprint)?;

        if let Ok(Some(raw)) = self
            .bounded(TierKind::Fast, "fast get", self.fast.get(&entry_key(fingerprint)))
            .await
        {
            if let Ok(entry) = serde_json::from_str::<CacheEntry>(&raw) {
                return Ok(Lookup::Hit {
                    entry,
                    tier: TierKind::Fast,
                });
            }
        }

        match self.durable_entry(fingerprint).await {
            Ok(Some(entry)) => Ok(Lookup::Hit {
                entry,
                tier: TierKind::Durable,
            }),
            Ok(None) => Ok(Lookup::Miss),
            Err(_) => Ok(Lookup::Degraded),
        }
    }

    /// Entry and query-log totals from the durable tier
    pub async fn summary(&self) -> Result<DurableSummary> {
        self.bounded(TierKind::Durable, "summary", self.durable.summary())
            .await
    }

    /// Query log of one fingerprint, oldest first
    pub async fn query_log(&self, fingerprint: &str) -> Result<Vec<QueryLogEntry>> {
        Fingerprint::parse(fingerprint)?;
        self.bounded(
            TierKind::Durable,
            "query log",
            self.durable.query_log_for(fingerprint),
        )
        .await
    }

    /// Authoritative copy of an entry; tier failures are reported, not hidden
    pub async fn durable_entry(&self, fingerprint: &str) -> Result<Option<CacheEntry>> {
        self.bounded(TierKind::Durable, "durable get", self.durable.fetch_entry(fingerprint))
            .await
    }

    /// Entries past the staleness threshold that were read within the recency window
    pub async fn stale_candidates(&self) -> Result<Vec<CacheEntry>> {
        let now = Utc::now();
        let fetched_before = now - to_chrono(self.config.staleness_threshold);
        let accessed_after = now - to_chrono(self.config.recency_window);

        self.bounded(
            TierKind::Durable,
            "stale scan",
            self.durable
                .stale_candidates(fetched_before, accessed_after, self.config.refresh_scan_limit),
        )
        .await
    }

    /// Wait for outstanding background bookkeeping
    pub async fn flush(&self) {
        let mut pending = {
            let mut guard = self.background.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *guard)
        };
        while pending.join_next().await.is_some() {}
    }

    async fn bounded<T, F>(&self, tier: TierKind, operation: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let limit = match tier {
            TierKind::Fast => self.config.fast_tier_timeout,
            TierKind::Durable => self.config.durable_tier_timeout,
        };
        with_timeout(limit, operation, fut).await
    }

    async fn write_fast(&self, entry: &CacheEntry) {
        let value = match serde_json::to_string(entry) {
            Ok(value) => value,
            Err(e) => {
                warn!("Cannot serialize {} for fast tier: {}", entry.fingerprint, e);
                return;
            }
        };

        if let Err(e) = self
            .bounded(
                TierKind::Fast,
                "fast set",
                self.fast.set_ex(
                    &entry_key(&entry.fingerprint),
                    value,
                    self.config.ttl_with_jitter(),
                ),
            )
            .await
        {
            debug!("Fast tier write skipped for {}: {}", entry.fingerprint, e);
        }
    }

    async fn append_log(&self, log: QueryLogEntry) {
        if let Err(e) = self
            .bounded(
                TierKind::Durable,
                "query log",
                self.durable.append_query_log(&log),
            )
            .await
        {
            debug!("Query log append failed for {}: {}", log.fingerprint, e);
        }
    }

    fn spawn_hit_bookkeeping(
        &self,
        fingerprint: &str,
        original_query: Option<String>,
        elapsed: Duration,
    ) {
        let durable = Arc::clone(&self.durable);
        let limit = self.config.durable_tier_timeout;
        let fingerprint = fingerprint.to_string();

        let task = async move {
            if let Err(e) =
                with_timeout(limit, "record hit", durable.record_hit(&fingerprint, Utc::now())).await
            {
                debug!("Hit counter update failed for {}: {}", fingerprint, e);
            }
            let log = QueryLogEntry::new(fingerprint.as_str(), original_query, true, elapsed);
            if let Err(e) = with_timeout(limit, "query log", durable.append_query_log(&log)).await {
                debug!("Query log append failed for {}: {}", fingerprint, e);
            }
        };

        let mut background = self.background.lock().unwrap_or_else(|e| e.into_inner());
        while background.try_join_next().is_some() {}
        background.spawn(task);
    }

    fn report_if_stale(&self, entry: &CacheEntry) {
        let Some(tx) = &self.stale_tx else {
            return;
        };
        if entry.is_stale(self.config.staleness_threshold, Utc::now()) {
            if let Err(e) = tx.try_send(entry.fingerprint.clone()) {
                debug!("On-demand refresh not queued for {}: {}", entry.fingerprint, e);
            }
        }
    }

    fn bump(&self, update: impl FnOnce(&mut CacheMetrics)) {
        let mut metrics = self.metrics.lock().unwrap_or_else(|e| e.into_inner());
        update(&mut metrics);
    }
}

async fn with_timeout<T, F>(limit: Duration, operation: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(CacheError::Timeout {
            operation: operation.to_string(),
            timeout_ms: limit.as_millis() as u64,
        }),
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(365))
}

fn validate_new_entry(entry: &NewEntry) -> Result<()> {
    let parsed = Fingerprint::parse(&entry.fingerprint)?;
    if parsed.library != entry.library_id
        || parsed.major_version != entry.library_major_version
        || parsed.intent != entry.intent_label
    {
        return Err(CacheError::MalformedInput(format!(
            "fingerprint {} does not match {}-{}:{}",
            entry.fingerprint, entry.library_id, entry.library_major_version, entry.intent_label
        )));
    }
    Ok(())
}
