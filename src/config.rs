//! Configuration for the documentation cache

use crate::error::{CacheError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Configuration shared by the manager, ranker, refresh scheduler and preloader
///
/// Timeouts bound every suspension point: a lookup that only touches the
/// cache must fit in `lookup_budget`, one that has to reach the provider in
/// `provider_timeout`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Per-call timeout for fast tier operations
    pub fast_tier_timeout: Duration,

    /// Per-call timeout for durable tier operations
    pub durable_tier_timeout: Duration,

    /// Timeout for a single provider fetch
    pub provider_timeout: Duration,

    /// Envelope for a cache-only lookup on the preload path
    pub lookup_budget: Duration,

    /// Advisory TTL passed to SETEX. Only bounds fast tier memory.
    pub fast_tier_ttl: Duration,

    /// TTL jitter factor (0.0 - 1.0), spreads fast tier expiry
    pub ttl_jitter: f64,

    /// Entry limit of the in-process fast tier
    pub fast_tier_max_entries: usize,

    /// Byte limit of the in-process fast tier
    pub fast_tier_max_bytes: usize,

    /// Age past which an entry becomes eligible for refresh
    pub staleness_threshold: Duration,

    /// An entry must have been read within this window to be refreshed in the background
    pub recency_window: Duration,

    /// Maximum provider fetches in flight during a refresh scan
    pub refresh_concurrency: usize,

    /// First backoff delay; doubles on each retry
    pub refresh_backoff_base: Duration,

    /// Retries after the first failed attempt before abandoning until next scan
    pub refresh_max_retries: u32,

    /// Maximum candidates pulled from the durable tier per scan
    pub refresh_scan_limit: usize,

    /// Delay between periodic scans
    pub refresh_interval: Duration,

    /// Hard wall-clock budget for a whole preload batch
    pub preload_budget: Duration,

    /// Default number of libraries to preload
    pub preload_candidates: usize,

    /// Maximum provider fetches in flight during a preload
    pub preload_concurrency: usize,

    /// Query text used to warm a library during preload
    pub preload_query: String,

    /// Ranking weights
    pub ranking: RankingWeights,
}

/// Weights used to score preload candidates
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RankingWeights {
    /// Score for a library declared in the project manifest
    pub manifest: u32,

    /// Score per recorded use
    pub per_use: u32,

    /// Upper bound on the usage contribution
    pub usage_cap: u32,
}

impl Default for RankingWeights {
    fn default() -> Self {
        Self {
            manifest: 2,
            per_use: 1,
            usage_cap: 5,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            fast_tier_timeout: Duration::from_millis(50),
            durable_tier_timeout: Duration::from_millis(500),
            provider_timeout: Duration::from_secs(5),
            lookup_budget: Duration::from_millis(150),
            fast_tier_ttl: Duration::from_secs(24 * 3600),
            // 12.5% jitter
            ttl_jitter: 0.125,
            fast_tier_max_entries: 10_000,
            // 64 MB
            fast_tier_max_bytes: 64 * 1024 * 1024,
            staleness_threshold: Duration::from_secs(24 * 3600),
            recency_window: Duration::from_secs(24 * 3600),
            refresh_concurrency: 3,
            refresh_backoff_base: Duration::from_secs(1),
            refresh_max_retries: 4,
            refresh_scan_limit: 100,
            refresh_interval: Duration::from_secs(3600),
            preload_budget: Duration::from_secs(8),
            preload_candidates: 5,
            preload_concurrency: 3,
            preload_query: "getting started".to_string(),
            ranking: RankingWeights::default(),
        }
    }
}

impl CacheConfig {
    /// Create a new builder for cache configuration
    pub fn builder() -> CacheConfigBuilder {
        CacheConfigBuilder::default()
    }

    /// Validate the configuration
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.fast_tier_timeout.is_zero() || self.durable_tier_timeout.is_zero() {
            return Err("tier timeouts must be greater than 0".to_string());
        }

        if self.provider_timeout.is_zero() {
            return Err("provider_timeout must be greater than 0".to_string());
        }

        if self.fast_tier_max_entries == 0 || self.fast_tier_max_bytes == 0 {
            return Err("fast tier limits must be greater than 0".to_string());
        }

        if self.ttl_jitter < 0.0 || self.ttl_jitter > 1.0 {
            return Err("ttl_jitter must be between 0.0 and 1.0".to_string());
        }

        if self.refresh_concurrency == 0 || self.preload_concurrency == 0 {
            return Err("concurrency caps must be greater than 0".to_string());
        }

        if self.ranking.usage_cap == 0 {
            return Err("ranking.usage_cap must be greater than 0".to_string());
        }

        Ok(())
    }

    /// Calculate actual fast tier TTL with jitter applied
    pub fn ttl_with_jitter(&self) -> Duration {
        if self.ttl_jitter == 0.0 {
            return self.fast_tier_ttl;
        }

        let base_secs = self.fast_tier_ttl.as_secs_f64();
        let jitter_range = base_secs * self.ttl_jitter;
        let jitter = (rand::random::<f64>() * 2.0 - 1.0) * jitter_range;
        let final_secs = (base_secs + jitter).max(1.0);

        Duration::from_secs_f64(final_secs)
    }

    /// Total time a refresh may spend sleeping between attempts for one entry
    pub fn max_backoff_total(&self) -> Duration {
        (0..self.refresh_max_retries)
            .map(|attempt| self.refresh_backoff_base * 2u32.saturating_pow(attempt))
            .sum()
    }

    /// Load configuration from `.env` and `DOCCACHE_*` environment variables
    ///
    /// Unset variables keep their defaults; unparsable values are rejected.
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        let mut config = Self::default();

        if let Some(ms) = env_u64("DOCCACHE_FAST_TIMEOUT_MS")? {
            config.fast_tier_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_u64("DOCCACHE_DURABLE_TIMEOUT_MS")? {
            config.durable_tier_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_u64("DOCCACHE_PROVIDER_TIMEOUT_MS")? {
            config.provider_timeout = Duration::from_millis(ms);
        }
        if let Some(secs) = env_u64("DOCCACHE_STALENESS_SECS")? {
            config.staleness_threshold = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("DOCCACHE_RECENCY_SECS")? {
            config.recency_window = Duration::from_secs(secs);
        }
        if let Some(n) = env_u64("DOCCACHE_REFRESH_CONCURRENCY")? {
            config.refresh_concurrency = n as usize;
        }
        if let Some(ms) = env_u64("DOCCACHE_PRELOAD_BUDGET_MS")? {
            config.preload_budget = Duration::from_millis(ms);
        }
        if let Some(n) = env_u64("DOCCACHE_PRELOAD_CANDIDATES")? {
            config.preload_candidates = n as usize;
        }

        config.validate().map_err(CacheError::ConfigError)?;
        debug!("Loaded cache config from environment: {:?}", config);
        Ok(config)
    }
}

fn env_u64(name: &str) -> Result<Option<u64>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|e| CacheError::ConfigError(format!("{}={:?}: {}", name, raw, e))),
        Err(_) => Ok(None),
    }
}

/// Builder for cache configuration
#[derive(Debug, Default)]
pub struct CacheConfigBuilder {
    fast_tier_timeout: Option<Duration>,
    durable_tier_timeout: Option<Duration>,
    provider_timeout: Option<Duration>,
    lookup_budget: Option<Duration>,
    fast_tier_ttl: Option<Duration>,
    ttl_jitter: Option<f64>,
    fast_tier_max_entries: Option<usize>,
    fast_tier_max_bytes: Option<usize>,
    staleness_threshold: Option<Duration>,
    recency_window: Option<Duration>,
    refresh_concurrency: Option<usize>,
    refresh_backoff_base: Option<Duration>,
    refresh_max_retries: Option<u32>,
    refresh_scan_limit: Option<usize>,
    refresh_interval: Option<Duration>,
    preload_budget: Option<Duration>,
    preload_candidates: Option<usize>,
    preload_concurrency: Option<usize>,
    preload_query: Option<String>,
    ranking: Option<RankingWeights>,
}

impl CacheConfigBuilder {
    /// Set the fast tier per-call timeout
    pub fn fast_tier_timeout(mut self, timeout: Duration) -> Self {
        self.fast_tier_timeout = Some(timeout);
        self
    }

    /// Set the durable tier per-call timeout
    pub fn durable_tier_timeout(mut self, timeout: Duration) -> Self {
        self.durable_tier_timeout = Some(timeout);
        self
    }

    /// Set the provider fetch timeout
    pub fn provider_timeout(mut self, timeout: Duration) -> Self {
        self.provider_timeout = Some(timeout);
        self
    }

    /// Set the cache-only lookup envelope
    pub fn lookup_budget(mut self, budget: Duration) -> Self {
        self.lookup_budget = Some(budget);
        self
    }

    /// Set the advisory fast tier TTL
    pub fn fast_tier_ttl(mut self, ttl: Duration) -> Self {
        self.fast_tier_ttl = Some(ttl);
        self
    }

    /// Set TTL jitter factor (0.0 - 1.0)
    pub fn ttl_jitter(mut self, jitter: f64) -> Self {
        self.ttl_jitter = Some(jitter);
        self
    }

    pub fn fast_tier_max_entries(mut self, max: usize) -> Self {
        self.fast_tier_max_entries = Some(max);
        self
    }

    pub fn fast_tier_max_bytes(mut self, max: usize) -> Self {
        self.fast_tier_max_bytes = Some(max);
        self
    }

    /// Set the staleness threshold
    pub fn staleness_threshold(mut self, threshold: Duration) -> Self {
        self.staleness_threshold = Some(threshold);
        self
    }

    /// Set the recent-access window for background refresh
    pub fn recency_window(mut self, window: Duration) -> Self {
        self.recency_window = Some(window);
        self
    }

    pub fn refresh_concurrency(mut self, n: usize) -> Self {
        self.refresh_concurrency = Some(n);
        self
    }

    /// Set the first refresh backoff delay
    pub fn refresh_backoff_base(mut self, base: Duration) -> Self {
        self.refresh_backoff_base = Some(base);
        self
    }

    pub fn refresh_max_retries(mut self, retries: u32) -> Self {
        self.refresh_max_retries = Some(retries);
        self
    }

    pub fn refresh_scan_limit(mut self, limit: usize) -> Self {
        self.refresh_scan_limit = Some(limit);
        self
    }

    pub fn refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = Some(interval);
        self
    }

    /// Set the wall-clock budget for a preload batch
    pub fn preload_budget(mut self, budget: Duration) -> Self {
        self.preload_budget = Some(budget);
        self
    }

    pub fn preload_candidates(mut self, n: usize) -> Self {
        self.preload_candidates = Some(n);
        self
    }

    pub fn preload_concurrency(mut self, n: usize) -> Self {
        self.preload_concurrency = Some(n);
        self
    }

    pub fn preload_query(mut self, query: impl Into<String>) -> Self {
        self.preload_query = Some(query.into());
        self
    }

    /// Set ranking weights
    pub fn ranking(mut self, weights: RankingWeights) -> Self {
        self.ranking = Some(weights);
        self
    }

    /// Build the cache configuration
    pub fn build(self) -> CacheConfig {
        let defaults = CacheConfig::default();

        CacheConfig {
            fast_tier_timeout: self.fast_tier_timeout.unwrap_or(defaults.fast_tier_timeout),
            durable_tier_timeout: self
                .durable_tier_timeout
                .unwrap_or(defaults.durable_tier_timeout),
            provider_timeout: self.provider_timeout.unwrap_or(defaults.provider_timeout),
            lookup_budget: self.lookup_budget.unwrap_or(defaults.lookup_budget),
            fast_tier_ttl: self.fast_tier_ttl.unwrap_or(defaults.fast_tier_ttl),
            ttl_jitter: self.ttl_jitter.unwrap_or(defaults.ttl_jitter),
            fast_tier_max_entries: self
                .fast_tier_max_entries
                .unwrap_or(defaults.fast_tier_max_entries),
            fast_tier_max_bytes: self
                .fast_tier_max_bytes
                .unwrap_or(defaults.fast_tier_max_bytes),
            staleness_threshold: self
                .staleness_threshold
                .unwrap_or(defaults.staleness_threshold),
            recency_window: self.recency_window.unwrap_or(defaults.recency_window),
            refresh_concurrency: self
                .refresh_concurrency
                .unwrap_or(defaults.refresh_concurrency),
            refresh_backoff_base: self
                .refresh_backoff_base
                .unwrap_or(defaults.refresh_backoff_base),
            refresh_max_retries: self
                .refresh_max_retries
                .unwrap_or(defaults.refresh_max_retries),
            refresh_scan_limit: self
                .refresh_scan_limit
                .unwrap_or(defaults.refresh_scan_limit),
            refresh_interval: self.refresh_interval.unwrap_or(defaults.refresh_interval),
            preload_budget: self.preload_budget.unwrap_or(defaults.preload_budget),
            preload_candidates: self
                .preload_candidates
                .unwrap_or(defaults.preload_candidates),
            preload_concurrency: self
                .preload_concurrency
                .unwrap_or(defaults.preload_concurrency),
            preload_query: self.preload_query.unwrap_or(defaults.preload_query),
            ranking: self.ranking.unwrap_or(defaults.ranking),
        }
    }
}

/// Preset configurations
impl CacheConfig {
    /// Tight budgets for an interactive session start
    pub fn interactive() -> Self {
        Self {
            provider_timeout: Duration::from_secs(3),
            preload_budget: Duration::from_secs(5),
            preload_candidates: 3,
            ..Default::default()
        }
    }

    /// Relaxed budgets for offline warming jobs
    pub fn batch() -> Self {
        Self {
            durable_tier_timeout: Duration::from_secs(2),
            provider_timeout: Duration::from_secs(15),
            preload_budget: Duration::from_secs(60),
            preload_candidates: 20,
            preload_concurrency: 5,
            refresh_scan_limit: 1_000,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CacheConfig::default();
        assert_eq!(config.fast_tier_timeout, Duration::from_millis(50));
        assert_eq!(config.durable_tier_timeout, Duration::from_millis(500));
        assert_eq!(config.staleness_threshold, Duration::from_secs(86_400));
        assert_eq!(config.refresh_concurrency, 3);
        assert_eq!(config.ranking, RankingWeights::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut invalid_config = CacheConfig::default();
        invalid_config.fast_tier_max_entries = 0;
        assert!(invalid_config.validate().is_err());

        let mut invalid_config = CacheConfig::default();
        invalid_config.ttl_jitter = 1.5;
        assert!(invalid_config.validate().is_err());

        let mut invalid_config = CacheConfig::default();
        invalid_config.refresh_concurrency = 0;
        assert!(invalid_config.validate().is_err());
    }

    #[test]
    fn test_config_builder() {
        let config = CacheConfig::builder()
            .staleness_threshold(Duration::from_secs(60))
            .refresh_backoff_base(Duration::from_millis(10))
            .preload_query("overview")
            .build();

        assert_eq!(config.staleness_threshold, Duration::from_secs(60));
        assert_eq!(config.refresh_backoff_base, Duration::from_millis(10));
        assert_eq!(config.preload_query, "overview");
        assert_eq!(config.recency_window, Duration::from_secs(86_400));
    }

    #[test]
    fn test_backoff_schedule_total() {
        // 1s + 2s + 4s + 8s
        let config = CacheConfig::default();
        assert_eq!(config.max_backoff_total(), Duration::from_secs(15));
    }

    #[test]
    fn test_ttl_with_jitter() {
        let config = CacheConfig {
            fast_tier_ttl: Duration::from_secs(3600),
            ttl_jitter: 0.1,
            ..Default::default()
        };

        let ttl = config.ttl_with_jitter();
        assert!(ttl.as_secs_f64() >= 3240.0);
        assert!(ttl.as_secs_f64() <= 3960.0);
    }

    #[test]
    fn test_preset_configs() {
        let interactive = CacheConfig::interactive();
        assert_eq!(interactive.preload_budget, Duration::from_secs(5));
        assert!(interactive.validate().is_ok());

        let batch = CacheConfig::batch();
        assert_eq!(batch.preload_candidates, 20);
        assert!(batch.validate().is_ok());
    }
}
