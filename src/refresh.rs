//! Background refresh of stale entries
//!
//! Per-entry lifecycle:
//!
//! ```text
//! FRESH --(age > staleness threshold)--> STALE_CANDIDATE --(claimed)--> REFRESHING
//!   ^                                                                       |
//!   +---------------------------- fetch + set ok ---------------------------+
//!                      STALE_CANDIDATE <-- retries exhausted ---------------+
//! ```
//!
//! Only stale entries read within the recency window are picked up by a scan.
//! Stale entries nobody reads wait for a `get` to queue them on demand.
//! At most one refresh per fingerprint runs at any time; the old content
//! keeps being served until the replacement is written.

use crate::config::CacheConfig;
use crate::error::{CacheError, Result};
use crate::fingerprint::Fingerprint;
use crate::manager::CacheManager;
use crate::provider::DocumentationProvider;
use crate::types::{CacheEntry, NewEntry};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

/// Refresh state of a single entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshState {
    Fresh,
    StaleCandidate,
    Refreshing,
}

impl RefreshState {
    pub fn classify(
        entry: &CacheEntry,
        in_flight: bool,
        config: &CacheConfig,
        now: DateTime<Utc>,
    ) -> Self {
        if in_flight {
            RefreshState::Refreshing
        } else if entry.is_stale(config.staleness_threshold, now) {
            RefreshState::StaleCandidate
        } else {
            RefreshState::Fresh
        }
    }
}

/// What happened to one refresh attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    Refreshed,
    /// Another refresh of the same fingerprint holds the claim
    InFlight,
    /// Somebody refreshed it since it was selected
    AlreadyFresh,
    /// The entry was invalidated in the meantime
    Missing,
    /// Fetched, but the durable write failed
    NotStored,
    /// Retries exhausted; the entry stays a stale candidate until the next scan
    Abandoned { attempts: u32, last_error: String },
}

/// Releases the in-flight claim on drop
struct InFlightGuard {
    in_flight: Arc<Mutex<HashSet<String>>>,
    fingerprint: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        in_flight.remove(&self.fingerprint);
    }
}

/// Refreshes stale entries through the cache manager
#[derive(Clone)]
pub struct RefreshScheduler {
    manager: Arc<CacheManager>,
    provider: Arc<dyn DocumentationProvider>,
    config: CacheConfig,
    in_flight: Arc<Mutex<HashSet<String>>>,
    permits: Arc<Semaphore>,
}

impl RefreshScheduler {
    pub fn new(manager: Arc<CacheManager>, provider: Arc<dyn DocumentationProvider>) -> Self {
        let config = manager.config().clone();
        let permits = Arc::new(Semaphore::new(config.refresh_concurrency.max(1)));

        info!(
            "Refresh scheduler ready (concurrency: {}, staleness: {:?})",
            config.refresh_concurrency, config.staleness_threshold
        );

        Self {
            manager,
            provider,
            config,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            permits,
        }
    }

    /// Current state of `entry` as seen by this scheduler
    pub fn state_of(&self, entry: &CacheEntry) -> RefreshState {
        RefreshState::classify(
            entry,
            self.is_in_flight(&entry.fingerprint),
            &self.config,
            Utc::now(),
        )
    }

    pub fn is_in_flight(&self, fingerprint: &str) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(fingerprint)
    }

    /// Refresh every stale, recently read entry. Returns how many were refreshed.
    ///
    /// An unreachable durable tier is an error, not an empty scan.
    pub async fn scan_and_refresh(&self) -> Result<usize> {
        let candidates = self.manager.stale_candidates().await?;
        if candidates.is_empty() {
            debug!("No stale entries to refresh");
            return Ok(0);
        }

        debug!("Refreshing {} stale candidates", candidates.len());
        let mut tasks = JoinSet::new();
        for entry in candidates {
            let scheduler = self.clone();
            tasks.spawn(async move { scheduler.refresh(&entry.fingerprint).await });
        }

        let mut refreshed = 0;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(RefreshOutcome::Refreshed)) => refreshed += 1,
                Ok(Ok(RefreshOutcome::Abandoned {
                    attempts,
                    last_error,
                })) => warn!(
                    "Refresh abandoned after {} attempts: {}",
                    attempts, last_error
                ),
                Ok(Ok(outcome)) => debug!("Refresh skipped: {:?}", outcome),
                Ok(Err(e)) => warn!("Refresh failed: {}", e),
                Err(e) => warn!("Refresh task panicked: {}", e),
            }
        }

        info!("Refreshed {} stale entries", refreshed);
        Ok(refreshed)
    }

    /// Refresh one fingerprint if it is still stale and nobody else is on it
    pub async fn refresh(&self, fingerprint: &str) -> Result<RefreshOutcome> {
        let parsed = Fingerprint::parse(fingerprint)?;
        let Some(_guard) = self.try_claim(fingerprint) else {
            debug!("Refresh already in flight: {}", fingerprint);
            return Ok(RefreshOutcome::InFlight);
        };

        // Re-read under the claim; a refresh that just finished must not repeat
        let Some(entry) = self.manager.durable_entry(fingerprint).await? else {
            return Ok(RefreshOutcome::Missing);
        };
        if !entry.is_stale(self.config.staleness_threshold, Utc::now()) {
            return Ok(RefreshOutcome::AlreadyFresh);
        }

        let mut attempt = 0;
        loop {
            let fetched = {
                let _permit = self
                    .permits
                    .acquire()
                    .await
                    .map_err(|e| CacheError::Other(e.to_string()))?;
                self.manager
                    .fetch_from_provider(&parsed, self.provider.as_ref(), &entry.intent_label)
                    .await
            };

            match fetched {
                Ok(document) => {
                    let stored = self
                        .manager
                        .set(NewEntry {
                            fingerprint: entry.fingerprint.clone(),
                            library_id: entry.library_id.clone(),
                            library_major_version: entry.library_major_version.clone(),
                            intent_label: entry.intent_label.clone(),
                            content: document.content,
                            citations: document.citations,
                        })
                        .await?;

                    return Ok(if stored {
                        debug!("Refreshed {}", fingerprint);
                        RefreshOutcome::Refreshed
                    } else {
                        RefreshOutcome::NotStored
                    });
                }
                Err(e) if attempt < self.config.refresh_max_retries => {
                    let delay = self.backoff(attempt);
                    debug!(
                        "Refresh of {} failed ({}), retrying in {:?}",
                        fingerprint, e, delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    return Ok(RefreshOutcome::Abandoned {
                        attempts: attempt + 1,
                        last_error: e.to_string(),
                    });
                }
            }
        }
    }

    /// Scan every `refresh_interval` until `shutdown` turns true or is dropped
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.refresh_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(
            "Starting periodic refresh every {:?}",
            self.config.refresh_interval
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.scan_and_refresh().await {
                        warn!("Refresh scan failed: {}", e);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Periodic refresh stopped");
    }

    /// Refresh fingerprints reported by `get` hits on stale entries
    pub fn spawn_on_demand_worker(&self, mut queue: mpsc::Receiver<String>) -> JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move {
            let mut tasks = JoinSet::new();
            while let Some(fingerprint) = queue.recv().await {
                while tasks.try_join_next().is_some() {}
                if scheduler.is_in_flight(&fingerprint) {
                    continue;
                }

                let worker = scheduler.clone();
                tasks.spawn(async move {
                    match worker.refresh(&fingerprint).await {
                        Ok(outcome) => debug!("On-demand refresh of {}: {:?}", fingerprint, outcome),
                        Err(e) => warn!("On-demand refresh of {} failed: {}", fingerprint, e),
                    }
                });
            }
            while tasks.join_next().await.is_some() {}
        })
    }

    fn try_claim(&self, fingerprint: &str) -> Option<InFlightGuard> {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if !in_flight.insert(fingerprint.to_string()) {
            return None;
        }
        Some(InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
            fingerprint: fingerprint.to_string(),
        })
    }

    fn backoff(&self, attempt: u32) -> Duration {
        self.config
            .refresh_backoff_base
            .saturating_mul(2u32.saturating_pow(attempt))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ProviderDocument;
    use crate::tier::{DurableTier, FastTier, MemoryFastTier, SqliteDurableTier};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FlakyProvider {
        calls: AtomicUsize,
        failures: usize,
    }

    #[async_trait]
    impl DocumentationProvider for FlakyProvider {
        async fn fetch(&self, library: &str, version: &str, query: &str) -> Result<ProviderDocument> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(CacheError::ProviderFailure("upstream down".to_string()));
            }
            Ok(ProviderDocument::new(format!("{} {} {} v2", library, version, query)))
        }
    }

    async fn setup(failures: usize) -> (RefreshScheduler, Arc<FlakyProvider>, Arc<SqliteDurableTier>) {
        let config = CacheConfig::builder()
            .staleness_threshold(Duration::from_secs(3600))
            .refresh_backoff_base(Duration::from_millis(1))
            .refresh_max_retries(2)
            .build();
        let durable = Arc::new(SqliteDurableTier::in_memory().await.unwrap());
        let manager = Arc::new(CacheManager::new(
            config,
            Arc::new(MemoryFastTier::default()) as Arc<dyn FastTier>,
            durable.clone() as Arc<dyn DurableTier>,
        ));
        let provider = Arc::new(FlakyProvider {
            calls: AtomicUsize::new(0),
            failures,
        });
        let scheduler = RefreshScheduler::new(manager, provider.clone());
        (scheduler, provider, durable)
    }

    async fn seed_stale(durable: &SqliteDurableTier) {
        let two_hours_ago = Utc::now() - chrono::Duration::hours(2);
        durable
            .upsert_entry(
                &NewEntry {
                    fingerprint: "react-18:hooks".to_string(),
                    library_id: "react".to_string(),
                    library_major_version: "18".to_string(),
                    intent_label: "hooks".to_string(),
                    content: "v1".to_string(),
                    citations: None,
                },
                two_hours_ago,
            )
            .await
            .unwrap();
        durable.record_hit("react-18:hooks", Utc::now()).await.unwrap();
    }

    #[test]
    fn test_classify() {
        let config = CacheConfig::default();
        let now = Utc::now();
        let entry = NewEntry {
            fingerprint: "rails-7:routing".to_string(),
            library_id: "rails".to_string(),
            library_major_version: "7".to_string(),
            intent_label: "routing".to_string(),
            content: "x".to_string(),
            citations: None,
        }
        .into_entry(now - chrono::Duration::hours(30));

        assert_eq!(
            RefreshState::classify(&entry, false, &config, now),
            RefreshState::StaleCandidate
        );
        assert_eq!(
            RefreshState::classify(&entry, true, &config, now),
            RefreshState::Refreshing
        );
        assert_eq!(
            RefreshState::classify(&entry, false, &config, now - chrono::Duration::hours(10)),
            RefreshState::Fresh
        );
    }

    #[tokio::test]
    async fn test_scan_refreshes_stale_entry() {
        let (scheduler, provider, durable) = setup(0).await;
        seed_stale(&durable).await;

        assert_eq!(scheduler.scan_and_refresh().await.unwrap(), 1);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);

        let entry = durable.fetch_entry("react-18:hooks").await.unwrap().unwrap();
        assert_eq!(entry.content, "react 18 hooks v2");
        assert_eq!(entry.query_count, 1);
        assert!(entry.created_at < entry.fetched_at);
        assert_eq!(scheduler.state_of(&entry), RefreshState::Fresh);

        // Fresh now, nothing left to do
        assert_eq!(scheduler.scan_and_refresh().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_backoff_then_success() {
        let (scheduler, provider, durable) = setup(2).await;
        seed_stale(&durable).await;

        let outcome = scheduler.refresh("react-18:hooks").await.unwrap();
        assert_eq!(outcome, RefreshOutcome::Refreshed);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_abandon_after_retries() {
        let (scheduler, provider, durable) = setup(usize::MAX).await;
        seed_stale(&durable).await;

        let outcome = scheduler.refresh("react-18:hooks").await.unwrap();
        assert!(matches!(outcome, RefreshOutcome::Abandoned { attempts: 3, .. }));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
        assert!(!scheduler.is_in_flight("react-18:hooks"));

        let entry = durable.fetch_entry("react-18:hooks").await.unwrap().unwrap();
        assert_eq!(entry.content, "v1");
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let (scheduler, _, _) = setup(0).await;

        let guard = scheduler.try_claim("react-18:hooks");
        assert!(guard.is_some());
        assert!(scheduler.try_claim("react-18:hooks").is_none());
        assert_eq!(
            scheduler.refresh("react-18:hooks").await.unwrap(),
            RefreshOutcome::InFlight
        );

        drop(guard);
        assert!(!scheduler.is_in_flight("react-18:hooks"));
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (scheduler, _, _) = setup(0).await;
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(async move { scheduler.run(rx).await });
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
