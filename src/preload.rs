//! Speculative preloading
//!
//! `preload` picks the libraries a project is most likely to need (manifest
//! plus usage ranking) and makes sure an introductory entry for each is
//! cached. `load` does the same for an explicit list. Both run candidates
//! concurrently under one wall-clock budget; when the budget runs out the
//! remaining fetches are abandoned, not awaited. Preloading never counts as
//! usage.

use crate::config::CacheConfig;
use crate::error::{CacheError, Result};
use crate::fingerprint::{fingerprint, Fingerprint};
use crate::manager::{CacheManager, Lookup};
use crate::manifest::{ManifestSource, StaticManifest};
use crate::provider::DocumentationProvider;
use crate::types::{DeclaredLibrary, NewEntry};
use crate::usage::{rank, RankedLibrary, UsageTracker};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Result for one candidate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "detail")]
pub enum PreloadOutcome {
    /// Already in cache, nothing fetched
    Cached,
    /// Fetched and stored
    Loaded,
    /// Fetched but the durable write failed
    NotStored,
    Failed(String),
    /// Still running when the budget ran out
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreloadResult {
    pub library_id: String,
    pub fingerprint: Option<String>,
    pub outcome: PreloadOutcome,
}

/// Outcome of a preload batch
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PreloadSummary {
    pub project_path: Option<String>,
    pub results: Vec<PreloadResult>,
    pub elapsed_ms: u64,
}

impl PreloadSummary {
    fn count(&self, predicate: impl Fn(&PreloadOutcome) -> bool) -> usize {
        self.results.iter().filter(|r| predicate(&r.outcome)).count()
    }

    pub fn loaded(&self) -> usize {
        self.count(|o| matches!(o, PreloadOutcome::Loaded))
    }

    pub fn cached(&self) -> usize {
        self.count(|o| matches!(o, PreloadOutcome::Cached))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, PreloadOutcome::Failed(_) | PreloadOutcome::NotStored))
    }

    pub fn timed_out(&self) -> usize {
        self.count(|o| matches!(o, PreloadOutcome::TimedOut))
    }
}

impl fmt::Display for PreloadSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} candidates: {} loaded, {} cached, {} failed, {} timed out in {}ms",
            self.results.len(),
            self.loaded(),
            self.cached(),
            self.failed(),
            self.timed_out(),
            self.elapsed_ms
        )
    }
}

/// Options for [`Preloader::load`]
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// Query to fingerprint; defaults to the configured preload query
    pub query: Option<String>,
    /// Batch budget; defaults to the configured preload budget
    pub timeout: Option<Duration>,
    /// Fetch even when an entry is already cached
    pub force: bool,
}

pub struct Preloader {
    manager: Arc<CacheManager>,
    usage: Arc<UsageTracker>,
    manifest: Arc<dyn ManifestSource>,
    provider: Arc<dyn DocumentationProvider>,
    config: CacheConfig,
}

impl Preloader {
    pub fn new(
        manager: Arc<CacheManager>,
        usage: Arc<UsageTracker>,
        manifest: Arc<dyn ManifestSource>,
        provider: Arc<dyn DocumentationProvider>,
    ) -> Self {
        let config = manager.config().clone();
        Self {
            manager,
            usage,
            manifest,
            provider,
            config,
        }
    }

    /// Preload the top `max_candidates` libraries of a project within `timeout`
    pub async fn preload(
        &self,
        project_path: &str,
        max_candidates: usize,
        timeout: Duration,
    ) -> Result<PreloadSummary> {
        let started = Instant::now();
        if project_path.trim().is_empty() {
            return Err(CacheError::MalformedInput("empty project path".to_string()));
        }

        let deadline = tokio::time::Instant::now() + timeout;

        let declared = match tokio::time::timeout_at(
            deadline,
            self.manifest.list_declared_libraries(project_path),
        )
        .await
        {
            Ok(Ok(declared)) => declared,
            Ok(Err(e)) => {
                warn!("Manifest unavailable for {}: {}", project_path, e);
                Vec::new()
            }
            Err(_) => {
                warn!("Manifest listing timed out for {}", project_path);
                Vec::new()
            }
        };

        // Usage bookkeeping gets one durable round trip out of the budget
        let ranking_deadline =
            deadline.min(tokio::time::Instant::now() + self.config.durable_tier_timeout);
        let ranked = match tokio::time::timeout_at(
            ranking_deadline,
            self.sync_and_rank(project_path, &declared, max_candidates),
        )
        .await
        {
            Ok(ranked) => ranked?,
            Err(_) => {
                warn!(
                    "Usage history too slow for {}, ranking declared libraries only",
                    project_path
                );
                rank(&declared, &[], &self.config.ranking, max_candidates)
            }
        };
        info!(
            "Preloading {} candidates for {}",
            ranked.len(),
            project_path
        );

        let targets = ranked
            .into_iter()
            .map(|c| DeclaredLibrary {
                library_id: c.library_id,
                major_version: c.major_version,
            })
            .collect();

        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        let mut summary = self
            .run_batch(targets, &self.config.preload_query, remaining, false)
            .await;
        summary.project_path = Some(project_path.to_string());
        summary.elapsed_ms = started.elapsed().as_millis() as u64;
        info!("Preload of {} finished: {}", project_path, summary);
        Ok(summary)
    }

    async fn sync_and_rank(
        &self,
        project_path: &str,
        declared: &[DeclaredLibrary],
        max_candidates: usize,
    ) -> Result<Vec<RankedLibrary>> {
        if !declared.is_empty() {
            self.usage.sync_manifest(project_path, declared).await?;
        }
        self.usage
            .ranked_candidates(project_path, declared, max_candidates)
            .await
    }

    /// Load explicitly named libraries (`react@18`, `tokio`)
    pub async fn load<S: AsRef<str>>(
        &self,
        library_names: &[S],
        options: LoadOptions,
    ) -> Result<PreloadSummary> {
        let started = Instant::now();
        let targets = StaticManifest::parse_specs(library_names);
        let query = options
            .query
            .unwrap_or_else(|| self.config.preload_query.clone());
        let timeout = options.timeout.unwrap_or(self.config.preload_budget);

        let mut summary = self.run_batch(targets, &query, timeout, options.force).await;
        summary.elapsed_ms = started.elapsed().as_millis() as u64;
        info!("Load finished: {}", summary);
        Ok(summary)
    }

    async fn run_batch(
        &self,
        targets: Vec<DeclaredLibrary>,
        query: &str,
        budget: Duration,
        force: bool,
    ) -> PreloadSummary {
        let deadline = tokio::time::Instant::now() + budget;
        let permits = Arc::new(Semaphore::new(self.config.preload_concurrency.max(1)));
        let mut tasks = JoinSet::new();
        let mut order = Vec::with_capacity(targets.len());
        let mut results: HashMap<String, PreloadResult> = HashMap::new();
        let mut task_libraries: HashMap<tokio::task::Id, String> = HashMap::new();

        for target in targets {
            let library_id = target.library_id.clone();
            if order.contains(&library_id) {
                continue;
            }
            order.push(library_id.clone());

            let fp = match fingerprint(&library_id, target.major_version.as_deref(), query) {
                Ok(fp) => fp,
                Err(e) => {
                    results.insert(
                        library_id.clone(),
                        PreloadResult {
                            library_id,
                            fingerprint: None,
                            outcome: PreloadOutcome::Failed(e.to_string()),
                        },
                    );
                    continue;
                }
            };

            let manager = Arc::clone(&self.manager);
            let provider = Arc::clone(&self.provider);
            let permits = Arc::clone(&permits);
            let query = query.to_string();
            let task_library = library_id.clone();
            let handle = tasks.spawn(async move {
                let outcome = match permits.acquire_owned().await {
                    Ok(_permit) => load_one(&manager, provider.as_ref(), &fp, &query, force).await,
                    Err(e) => PreloadOutcome::Failed(e.to_string()),
                };
                PreloadResult {
                    library_id,
                    fingerprint: Some(fp.key),
                    outcome,
                }
            });
            task_libraries.insert(handle.id(), task_library);
        }

        loop {
            match tokio::time::timeout_at(deadline, tasks.join_next()).await {
                Ok(Some(Ok(result))) => {
                    debug!("Preload {}: {:?}", result.library_id, result.outcome);
                    results.insert(result.library_id.clone(), result);
                }
                Ok(Some(Err(e))) => {
                    warn!("Preload task failed: {}", e);
                    if let Some(library_id) = task_libraries.remove(&e.id()) {
                        results.insert(
                            library_id.clone(),
                            PreloadResult {
                                library_id,
                                fingerprint: None,
                                outcome: PreloadOutcome::Failed(e.to_string()),
                            },
                        );
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    warn!("Preload budget of {:?} exhausted, abandoning {} fetches", budget, tasks.len());
                    tasks.abort_all();
                    break;
                }
            }
        }

        let results = order
            .into_iter()
            .map(|library_id| {
                results.remove(&library_id).unwrap_or_else(|| PreloadResult {
                    fingerprint: None,
                    library_id,
                    outcome: PreloadOutcome::TimedOut,
                })
            })
            .collect();

        PreloadSummary {
            project_path: None,
            results,
            elapsed_ms: 0,
        }
    }
}

async fn load_one(
    manager: &CacheManager,
    provider: &dyn DocumentationProvider,
    fp: &Fingerprint,
    query: &str,
    force: bool,
) -> PreloadOutcome {
    if !force {
        let cached = tokio::time::timeout(manager.config().lookup_budget, manager.peek(&fp.key)).await;
        if let Ok(Ok(Lookup::Hit { .. })) = cached {
            return PreloadOutcome::Cached;
        }
    }

    let document = match manager.fetch_from_provider(fp, provider, query).await {
        Ok(document) => document,
        Err(e) => return PreloadOutcome::Failed(e.to_string()),
    };

    match manager
        .set(NewEntry {
            fingerprint: fp.key.clone(),
            library_id: fp.library.clone(),
            library_major_version: fp.major_version.clone(),
            intent_label: fp.intent.clone(),
            content: document.content,
            citations: document.citations,
        })
        .await
    {
        Ok(true) => PreloadOutcome::Loaded,
        Ok(false) => PreloadOutcome::NotStored,
        Err(e) => PreloadOutcome::Failed(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ProviderDocument;
    use crate::tier::{DurableTier, FastTier, MemoryFastTier, SqliteDurableTier, UsageStore};
    use async_trait::async_trait;

    struct EchoProvider;

    #[async_trait]
    impl DocumentationProvider for EchoProvider {
        async fn fetch(&self, library: &str, version: &str, query: &str) -> Result<ProviderDocument> {
            if library == "broken" {
                return Err(CacheError::ProviderFailure("no docs".to_string()));
            }
            if library == "panicky" {
                panic!("provider bug");
            }
            Ok(ProviderDocument::new(format!("{}@{}: {}", library, version, query)))
        }
    }

    async fn preloader(manifest: StaticManifest) -> (Preloader, Arc<SqliteDurableTier>) {
        let config = CacheConfig::default();
        let durable = Arc::new(SqliteDurableTier::in_memory().await.unwrap());
        let fast: Arc<dyn FastTier> = Arc::new(MemoryFastTier::default());
        let manager = Arc::new(CacheManager::new(
            config.clone(),
            fast.clone(),
            durable.clone() as Arc<dyn DurableTier>,
        ));
        let usage = Arc::new(UsageTracker::new(
            config,
            durable.clone() as Arc<dyn UsageStore>,
            fast,
        ));
        let preloader = Preloader::new(manager, usage, Arc::new(manifest), Arc::new(EchoProvider));
        (preloader, durable)
    }

    #[tokio::test]
    async fn test_preload_from_manifest() {
        let manifest = StaticManifest::new().with_project(
            "/app",
            vec![
                DeclaredLibrary::new("react", Some("^18.2.0")),
                DeclaredLibrary::new("broken", None),
            ],
        );
        let (preloader, durable) = preloader(manifest).await;

        let summary = preloader
            .preload("/app", 5, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(summary.loaded(), 1);
        assert_eq!(summary.failed(), 1);
        assert_eq!(summary.project_path.as_deref(), Some("/app"));

        let entry = durable
            .fetch_entry("react-18:getting_started")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.query_count, 0);

        // Preloading does not count as usage
        let rows = durable.project_usage("/app").await.unwrap();
        assert!(rows.iter().all(|r| r.usage_count == 0));

        let again = preloader
            .preload("/app", 5, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(again.cached(), 1);
    }

    #[tokio::test]
    async fn test_load_named_libraries() {
        let (preloader, _) = preloader(StaticManifest::new()).await;

        let summary = preloader
            .load(
                &["axum@0.7", "axum@0.7", "tokio"],
                LoadOptions {
                    query: Some("routing".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(summary.results.len(), 2);
        assert_eq!(
            summary.results[0].fingerprint.as_deref(),
            Some("axum-0:routing")
        );
        assert_eq!(summary.results[1].fingerprint.as_deref(), Some("tokio-latest:routing"));
        assert_eq!(summary.loaded(), 2);
    }

    #[tokio::test]
    async fn test_panicking_task_reported_as_failed() {
        let (preloader, _) = preloader(StaticManifest::new()).await;

        let summary = preloader
            .load(&["panicky", "tokio"], LoadOptions::default())
            .await
            .unwrap();

        assert_eq!(summary.results.len(), 2);
        assert_eq!(summary.results[0].library_id, "panicky");
        assert!(matches!(
            summary.results[0].outcome,
            PreloadOutcome::Failed(_)
        ));
        assert_eq!(summary.results[1].outcome, PreloadOutcome::Loaded);
        assert_eq!(summary.timed_out(), 0);
    }

    #[tokio::test]
    async fn test_empty_project_rejected() {
        let (preloader, _) = preloader(StaticManifest::new()).await;
        assert!(matches!(
            preloader.preload("", 3, Duration::from_secs(1)).await,
            Err(CacheError::MalformedInput(_))
        ));
    }
}
