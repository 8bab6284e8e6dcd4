//! # Ouroboros Documentation Cache (ouroboros-doccache)
//!
//! A proactive two-tier cache between a coding agent and a documentation
//! provider. Near-duplicate questions collapse onto one cache entry, libraries
//! the project is likely to need are preloaded, and stale entries are
//! refreshed in the background. Cache or provider outages never fail the
//! host session; at worst lookups get slower.
//!
//! ## Features
//!
//! - Deterministic query fingerprints (`{library}-{major}:{intent}`)
//! - Fast in-process tier with TTL and LRU eviction, SQLite durable tier
//! - Per-tier timeouts with graceful degradation
//! - Usage tracking and manifest-weighted preload ranking
//! - Background refresh with backoff and at most one refresh per entry
//!
//! ## Fingerprinting
//!
//! ```
//! use ouroboros_doccache::fingerprint;
//!
//! let a = fingerprint("rails", Some("7"), "Rails authentication").unwrap();
//! let b = fingerprint("rails", Some("7"), "How to add authentication to Rails").unwrap();
//! assert_eq!(a.key, "rails-7:authentication");
//! assert_eq!(a, b);
//! ```
//!
//! ## Querying through the cache
//!
//! ```no_run
//! use ouroboros_doccache::{CacheConfig, CommandProvider, DocCache, StaticManifest};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let cache = DocCache::open(
//!         "/tmp/doccache/cache.db",
//!         CacheConfig::default(),
//!         Arc::new(CommandProvider::new("docs-lookup")),
//!         Arc::new(StaticManifest::new()),
//!     )
//!     .await?;
//!     cache.start_background();
//!
//!     let response = cache
//!         .query("/work/app", "react", Some("18.2.0"), "how do I use useEffect")
//!         .await?;
//!     println!("{} (hit: {})", response.fingerprint, response.cache_hit());
//!
//!     cache.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Using the manager directly
//!
//! ```no_run
//! use ouroboros_doccache::{CacheConfig, CacheManager, Lookup, MemoryFastTier, SqliteDurableTier};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let manager = CacheManager::new(
//!         CacheConfig::interactive(),
//!         Arc::new(MemoryFastTier::default()),
//!         Arc::new(SqliteDurableTier::in_memory().await?),
//!     );
//!
//!     match manager.get("react-18:hooks").await? {
//!         Lookup::Hit { entry, tier } => println!("{} from {} tier", entry.content, tier),
//!         Lookup::Miss => println!("not cached"),
//!         Lookup::Degraded => println!("durable tier unreachable"),
//!     }
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod fingerprint;
pub mod manager;
pub mod manifest;
pub mod preload;
pub mod provider;
pub mod refresh;
pub mod service;
pub mod tier;
pub mod types;
pub mod usage;

// Re-export main types for convenience
pub use config::{CacheConfig, CacheConfigBuilder, RankingWeights};
pub use error::{CacheError, Result};
pub use fingerprint::{fingerprint, Fingerprint, Intent, IntentLabel, IntentTable};
pub use manager::{CacheManager, FetchOutcome, Lookup};
pub use manifest::{ManifestSource, StaticManifest};
pub use preload::{LoadOptions, PreloadOutcome, PreloadSummary, Preloader};
pub use provider::{CommandProvider, DocumentationProvider, ProviderDocument};
pub use refresh::{RefreshOutcome, RefreshScheduler, RefreshState};
pub use service::{DocCache, QueryResponse};
pub use tier::{
    DurableTier, FastTier, MemoryFastTier, SqliteDurableTier, TierKind, UsageStore,
};
pub use types::{
    CacheEntry, CacheMetrics, DeclaredLibrary, DetectionSource, DurableSummary, EntryStats,
    NewEntry, ProjectLibraryUsage, QueryLogEntry,
};
pub use usage::{rank, RankedLibrary, UsageTracker};
