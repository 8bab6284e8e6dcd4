//! `DocCache`: the assembled cache
//!
//! Wires the manager, usage tracker, refresh scheduler and preloader over a
//! shared pair of tiers. `query` is the foreground path a host session calls
//! for every documentation lookup.

use crate::config::CacheConfig;
use crate::error::{CacheError, Result};
use crate::fingerprint::fingerprint;
use crate::manager::{CacheManager, FetchOutcome};
use crate::manifest::ManifestSource;
use crate::preload::{LoadOptions, PreloadSummary, Preloader};
use crate::provider::DocumentationProvider;
use crate::refresh::RefreshScheduler;
use crate::tier::{DurableTier, FastTier, MemoryFastTier, SqliteDurableTier, UsageStore};
use crate::types::{CacheMetrics, DeclaredLibrary, DurableSummary, EntryStats};
use crate::usage::UsageTracker;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Capacity of the on-demand refresh queue; overflow is dropped
const REFRESH_QUEUE_CAPACITY: usize = 64;

/// Answer to a foreground query
#[derive(Debug, Clone)]
pub struct QueryResponse {
    pub fingerprint: String,
    pub outcome: FetchOutcome,
    pub elapsed: Duration,
}

impl QueryResponse {
    pub fn content(&self) -> Option<&str> {
        self.outcome.content()
    }

    pub fn cache_hit(&self) -> bool {
        self.outcome.was_cached()
    }
}

struct Background {
    shutdown: watch::Sender<bool>,
    periodic: JoinHandle<()>,
    on_demand: Option<JoinHandle<()>>,
}

pub struct DocCache {
    config: CacheConfig,
    manager: Arc<CacheManager>,
    usage: Arc<UsageTracker>,
    refresh: RefreshScheduler,
    preloader: Preloader,
    provider: Arc<dyn DocumentationProvider>,
    refresh_queue: Mutex<Option<mpsc::Receiver<String>>>,
    background: Mutex<Option<Background>>,
}

impl DocCache {
    /// Assemble from explicit tiers and collaborators
    pub fn from_parts(
        config: CacheConfig,
        fast: Arc<dyn FastTier>,
        durable: Arc<dyn DurableTier>,
        usage_store: Arc<dyn UsageStore>,
        provider: Arc<dyn DocumentationProvider>,
        manifest: Arc<dyn ManifestSource>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(REFRESH_QUEUE_CAPACITY);

        let manager = Arc::new(
            CacheManager::new(config.clone(), Arc::clone(&fast), durable).with_refresh_queue(tx),
        );
        let usage = Arc::new(UsageTracker::new(config.clone(), usage_store, fast));
        let refresh = RefreshScheduler::new(Arc::clone(&manager), Arc::clone(&provider));
        let preloader = Preloader::new(
            Arc::clone(&manager),
            Arc::clone(&usage),
            manifest,
            Arc::clone(&provider),
        );

        Self {
            config,
            manager,
            usage,
            refresh,
            preloader,
            provider,
            refresh_queue: Mutex::new(Some(rx)),
            background: Mutex::new(None),
        }
    }

    /// In-process fast tier over a SQLite database file
    pub async fn open(
        path: impl AsRef<Path>,
        config: CacheConfig,
        provider: Arc<dyn DocumentationProvider>,
        manifest: Arc<dyn ManifestSource>,
    ) -> Result<Self> {
        config.validate().map_err(CacheError::ConfigError)?;

        let durable = Arc::new(SqliteDurableTier::open(path).await?);
        let fast = Arc::new(MemoryFastTier::new(
            config.fast_tier_max_entries,
            config.fast_tier_max_bytes,
        ));

        Ok(Self::from_parts(
            config,
            fast,
            durable.clone(),
            durable,
            provider,
            manifest,
        ))
    }

    /// Start the periodic refresh loop and the on-demand refresh worker.
    ///
    /// Calling it twice is a no-op.
    pub fn start_background(&self) {
        let mut background = self.background.lock().unwrap_or_else(|e| e.into_inner());
        if background.is_some() {
            return;
        }

        let (shutdown, shutdown_rx) = watch::channel(false);

        let scheduler = self.refresh.clone();
        let periodic = tokio::spawn(async move { scheduler.run(shutdown_rx).await });

        let on_demand = self
            .refresh_queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .map(|queue| self.refresh.spawn_on_demand_worker(queue));

        info!("Background refresh started");
        *background = Some(Background {
            shutdown,
            periodic,
            on_demand,
        });
    }

    /// Stop background work and wait for pending bookkeeping
    pub async fn shutdown(&self) {
        let background = self
            .background
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();

        if let Some(background) = background {
            let _ = background.shutdown.send(true);
            if let Err(e) = background.periodic.await {
                warn!("Periodic refresh task failed: {}", e);
            }

            // The on-demand queue stays open while the manager lives
            if let Some(worker) = background.on_demand {
                worker.abort();
                if let Err(e) = worker.await {
                    if !e.is_cancelled() {
                        warn!("On-demand refresh worker failed: {}", e);
                    }
                }
            }
        }

        self.manager.flush().await;
        info!("Documentation cache shut down");
    }

    /// Foreground lookup: fingerprint, count usage, serve from cache or provider
    pub async fn query(
        &self,
        project_path: &str,
        library: &str,
        version: Option<&str>,
        query_text: &str,
    ) -> Result<QueryResponse> {
        let started = Instant::now();
        let fp = fingerprint(library, version, query_text)?;

        self.usage.record_usage(project_path, library, version).await?;

        let outcome = self
            .manager
            .get_or_fetch(&fp, self.provider.as_ref(), Some(query_text))
            .await?;

        Ok(QueryResponse {
            fingerprint: fp.key,
            outcome,
            elapsed: started.elapsed(),
        })
    }

    pub async fn preload(
        &self,
        project_path: &str,
        max_candidates: usize,
        timeout: Duration,
    ) -> Result<PreloadSummary> {
        self.preloader
            .preload(project_path, max_candidates, timeout)
            .await
    }

    /// Preload with the configured candidate count and budget
    pub async fn preload_default(&self, project_path: &str) -> Result<PreloadSummary> {
        self.preload(
            project_path,
            self.config.preload_candidates,
            self.config.preload_budget,
        )
        .await
    }

    pub async fn load<S: AsRef<str>>(
        &self,
        library_names: &[S],
        options: LoadOptions,
    ) -> Result<PreloadSummary> {
        self.preloader.load(library_names, options).await
    }

    pub async fn invalidate(&self, fingerprint: &str) -> Result<bool> {
        self.manager.invalidate(fingerprint).await
    }

    pub async fn stats(&self, fingerprint: &str) -> Result<Option<EntryStats>> {
        self.manager.get_stats(fingerprint).await
    }

    pub async fn summary(&self) -> Result<DurableSummary> {
        self.manager.summary().await
    }

    pub async fn rank(
        &self,
        project_path: &str,
        declared: &[DeclaredLibrary],
        top_n: usize,
    ) -> Result<Vec<String>> {
        self.usage
            .rank_candidates(project_path, declared, top_n)
            .await
    }

    /// One refresh scan, outside the periodic schedule
    pub async fn refresh_now(&self) -> Result<usize> {
        self.refresh.scan_and_refresh().await
    }

    pub fn metrics(&self) -> CacheMetrics {
        self.manager.metrics()
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn manager(&self) -> &Arc<CacheManager> {
        &self.manager
    }

    pub fn usage(&self) -> &Arc<UsageTracker> {
        &self.usage
    }

    pub fn scheduler(&self) -> &RefreshScheduler {
        &self.refresh
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::StaticManifest;
    use crate::provider::ProviderDocument;
    use async_trait::async_trait;

    struct StaticProvider;

    #[async_trait]
    impl DocumentationProvider for StaticProvider {
        async fn fetch(&self, library: &str, _version: &str, query: &str) -> Result<ProviderDocument> {
            Ok(ProviderDocument::new(format!("{}: {}", library, query)))
        }
    }

    async fn doc_cache() -> DocCache {
        let durable = Arc::new(SqliteDurableTier::in_memory().await.unwrap());
        DocCache::from_parts(
            CacheConfig::default(),
            Arc::new(MemoryFastTier::default()),
            durable.clone(),
            durable,
            Arc::new(StaticProvider),
            Arc::new(StaticManifest::new()),
        )
    }

    #[tokio::test]
    async fn test_query_fetches_then_hits() {
        let cache = doc_cache().await;

        let first = cache
            .query("/app", "Rails", Some("7.1.2"), "Rails auth")
            .await
            .unwrap();
        assert_eq!(first.fingerprint, "rails-7:authentication");
        assert!(!first.cache_hit());
        assert_eq!(first.content(), Some("rails: Rails auth"));

        let second = cache
            .query("/app", "rails", Some("7"), "How to add authentication to Rails")
            .await
            .unwrap();
        assert!(second.cache_hit());
        assert_eq!(second.content(), Some("rails: Rails auth"));

        let rows = cache.usage().project_libraries("/app").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].usage_count, 2);
        cache.shutdown().await;
    }

    #[tokio::test]
    async fn test_query_rejects_malformed_library() {
        let cache = doc_cache().await;
        assert!(matches!(
            cache.query("/app", "  ", None, "anything").await,
            Err(CacheError::MalformedInput(_))
        ));
    }

    #[tokio::test]
    async fn test_background_start_and_shutdown() {
        let cache = doc_cache().await;
        cache.start_background();
        cache.start_background();
        cache.shutdown().await;
        assert_eq!(cache.refresh_now().await.unwrap(), 0);
    }
}
