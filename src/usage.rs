//! Usage tracker and preload ranker
//!
//! Records which libraries a project actually queries and scores candidates
//! for preloading. Manifest presence is worth a fixed weight; usage adds a
//! per-use weight up to a cap so one hot library cannot crowd out the rest.

use crate::config::{CacheConfig, RankingWeights};
use crate::error::{CacheError, Result};
use crate::fingerprint::{major_version, normalize_library};
use crate::tier::{project_key, FastTier, UsageStore};
use crate::types::{DeclaredLibrary, DetectionSource, ProjectLibraryUsage};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// A scored preload candidate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankedLibrary {
    pub library_id: String,
    pub major_version: Option<String>,
    pub score: u32,
    pub declared: bool,
    pub usage_count: u64,
    pub last_used_at: Option<DateTime<Utc>>,
}

/// Score and order candidates.
///
/// A library is declared if it is in `declared` or its usage row was
/// confirmed by a manifest scan. Ties break by most recent use, then by id.
pub fn rank(
    declared: &[DeclaredLibrary],
    usage: &[ProjectLibraryUsage],
    weights: &RankingWeights,
    top_n: usize,
) -> Vec<RankedLibrary> {
    let mut candidates: HashMap<String, RankedLibrary> = HashMap::new();

    let blank = |library_id: &str| RankedLibrary {
        library_id: library_id.to_string(),
        major_version: None,
        score: 0,
        declared: false,
        usage_count: 0,
        last_used_at: None,
    };

    for lib in declared {
        let Ok(library_id) = normalize_library(&lib.library_id) else {
            debug!("Skipping invalid declared library {:?}", lib.library_id);
            continue;
        };
        let candidate = candidates
            .entry(library_id.clone())
            .or_insert_with(|| blank(&library_id));
        candidate.declared = true;
        if candidate.major_version.is_none() {
            candidate.major_version = lib
                .major_version
                .as_deref()
                .map(|v| major_version(Some(v)));
        }
    }

    for row in usage {
        let candidate = candidates
            .entry(row.library_id.clone())
            .or_insert_with(|| blank(&row.library_id));
        candidate.declared |= row.detection_source == DetectionSource::Manifest;
        candidate.usage_count = row.usage_count;
        candidate.last_used_at = row.last_used_at;
        if row.library_major_version.is_some() {
            candidate.major_version = row.library_major_version.clone();
        }
    }

    let mut ranked: Vec<RankedLibrary> = candidates
        .into_values()
        .map(|mut candidate| {
            let manifest = if candidate.declared { weights.manifest } else { 0 };
            let uses = u32::try_from(candidate.usage_count).unwrap_or(u32::MAX);
            let usage = uses.saturating_mul(weights.per_use).min(weights.usage_cap);
            candidate.score = manifest.saturating_add(usage);
            candidate
        })
        .filter(|candidate| candidate.score > 0)
        .collect();

    ranked.sort_by(compare_candidates);
    ranked.truncate(top_n);
    ranked
}

fn compare_candidates(a: &RankedLibrary, b: &RankedLibrary) -> Ordering {
    b.score
        .cmp(&a.score)
        .then_with(|| b.last_used_at.cmp(&a.last_used_at))
        .then_with(|| a.library_id.cmp(&b.library_id))
}

/// Owner of the per-project usage rows
pub struct UsageTracker {
    store: Arc<dyn UsageStore>,
    fast: Arc<dyn FastTier>,
    config: CacheConfig,
}

impl UsageTracker {
    pub fn new(config: CacheConfig, store: Arc<dyn UsageStore>, fast: Arc<dyn FastTier>) -> Self {
        Self { store, fast, config }
    }

    /// Count one explicit query of `library` in `project_path`.
    ///
    /// Tier failures are logged and absorbed.
    pub async fn record_usage(
        &self,
        project_path: &str,
        library: &str,
        version: Option<&str>,
    ) -> Result<()> {
        let project_path = validate_project(project_path)?;
        let library_id = normalize_library(library)?;
        let major = version.map(|v| major_version(Some(v)));

        let written = tokio::time::timeout(
            self.config.durable_tier_timeout,
            self.store
                .upsert_usage(project_path, &library_id, major.as_deref(), Utc::now()),
        )
        .await;

        match written {
            Ok(Ok(())) => debug!("Recorded use of {} in {}", library_id, project_path),
            Ok(Err(e)) => warn!("Failed to record use of {}: {}", library_id, e),
            Err(_) => warn!("Timed out recording use of {}", library_id),
        }

        self.forget_cached(project_path).await;
        Ok(())
    }

    /// Mark manifest-declared libraries, promoting usage-only rows.
    ///
    /// Returns how many rows were written.
    pub async fn sync_manifest(
        &self,
        project_path: &str,
        declared: &[DeclaredLibrary],
    ) -> Result<usize> {
        let project_path = validate_project(project_path)?;
        let mut writes = JoinSet::new();

        for lib in declared {
            let library_id = match normalize_library(&lib.library_id) {
                Ok(id) => id,
                Err(e) => {
                    debug!("Skipping declared library: {}", e);
                    continue;
                }
            };
            let major = lib.major_version.as_deref().map(|v| major_version(Some(v)));
            let store = Arc::clone(&self.store);
            let project = project_path.to_string();
            let limit = self.config.durable_tier_timeout;

            writes.spawn(async move {
                let written = tokio::time::timeout(
                    limit,
                    store.mark_declared(&project, &library_id, major.as_deref()),
                )
                .await;
                match written {
                    Ok(Ok(())) => true,
                    Ok(Err(e)) => {
                        warn!("Failed to mark {} as declared: {}", library_id, e);
                        false
                    }
                    Err(_) => {
                        warn!("Timed out marking {} as declared", library_id);
                        false
                    }
                }
            });
        }

        let mut synced = 0;
        while let Some(joined) = writes.join_next().await {
            if let Ok(true) = joined {
                synced += 1;
            }
        }

        if synced > 0 {
            self.forget_cached(project_path).await;
        }
        info!(
            "Synced {}/{} manifest libraries for {}",
            synced,
            declared.len(),
            project_path
        );
        Ok(synced)
    }

    /// Usage rows of a project, read through the fast tier
    pub async fn project_libraries(&self, project_path: &str) -> Result<Vec<ProjectLibraryUsage>> {
        let project_path = validate_project(project_path)?;
        let key = project_key(project_path);

        if let Ok(Ok(Some(raw))) =
            tokio::time::timeout(self.config.fast_tier_timeout, self.fast.get(&key)).await
        {
            match serde_json::from_str::<Vec<ProjectLibraryUsage>>(&raw) {
                Ok(rows) => return Ok(rows),
                Err(e) => debug!("Ignoring undecodable project cache {}: {}", key, e),
            }
        }

        let rows = match tokio::time::timeout(
            self.config.durable_tier_timeout,
            self.store.project_usage(project_path),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => {
                return Err(CacheError::Timeout {
                    operation: format!("project usage {}", project_path),
                    timeout_ms: self.config.durable_tier_timeout.as_millis() as u64,
                })
            }
        };

        if let Ok(value) = serde_json::to_string(&rows) {
            let _ = tokio::time::timeout(
                self.config.fast_tier_timeout,
                self.fast.set_ex(&key, value, self.config.ttl_with_jitter()),
            )
            .await;
        }
        Ok(rows)
    }

    /// Top `top_n` library ids for preloading
    pub async fn rank_candidates(
        &self,
        project_path: &str,
        declared: &[DeclaredLibrary],
        top_n: usize,
    ) -> Result<Vec<String>> {
        Ok(self
            .ranked_candidates(project_path, declared, top_n)
            .await?
            .into_iter()
            .map(|candidate| candidate.library_id)
            .collect())
    }

    /// Like [`rank_candidates`](Self::rank_candidates) but keeps scores and versions.
    ///
    /// Without usage history (tier down) only declared libraries are ranked.
    pub async fn ranked_candidates(
        &self,
        project_path: &str,
        declared: &[DeclaredLibrary],
        top_n: usize,
    ) -> Result<Vec<RankedLibrary>> {
        let usage = match self.project_libraries(project_path).await {
            Ok(rows) => rows,
            Err(e @ CacheError::MalformedInput(_)) => return Err(e),
            Err(e) => {
                warn!("Ranking {} without usage history: {}", project_path, e);
                Vec::new()
            }
        };

        Ok(rank(declared, &usage, &self.config.ranking, top_n))
    }

    async fn forget_cached(&self, project_path: &str) {
        let _ = tokio::time::timeout(
            self.config.fast_tier_timeout,
            self.fast.del(&project_key(project_path)),
        )
        .await;
    }
}

fn validate_project(project_path: &str) -> Result<&str> {
    let trimmed = project_path.trim();
    if trimmed.is_empty() {
        return Err(CacheError::MalformedInput("empty project path".to_string()));
    }
    Ok(trimmed)
}
