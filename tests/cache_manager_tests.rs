//! Integration tests for the cache manager
//!
//! Covers tier fallback and promotion, the miss/fetch/hit scenario, and
//! degradation when either tier is down or hanging.

mod common;

use chrono::Utc;
use common::{
    memory_manager, new_entry, test_config, CountingProvider, DownDurableTier, DownFastTier,
    HangingFastTier, SlowBookkeepingTier,
};
use ouroboros_doccache::{
    fingerprint, CacheError, CacheManager, DurableTier, FetchOutcome, Lookup, MemoryFastTier,
    SqliteDurableTier, TierKind,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[tokio::test]
async fn test_end_to_end_miss_fetch_hit() {
    let (manager, durable) = memory_manager(test_config()).await;

    // Empty cache: miss plus one log row
    assert_eq!(manager.get("react-18:hooks").await.unwrap(), Lookup::Miss);
    let log = durable.query_log_for("react-18:hooks").await.unwrap();
    assert_eq!(log.len(), 1);
    assert!(!log[0].cache_hit);

    // Caller fetched and stores it
    assert!(manager
        .set(new_entry("react-18:hooks", "useState returns a pair"))
        .await
        .unwrap());
    let after_set = manager.get_stats("react-18:hooks").await.unwrap().unwrap();

    let lookup = manager.get("react-18:hooks").await.unwrap();
    assert_eq!(lookup.entry().unwrap().content, "useState returns a pair");
    manager.flush().await;

    let after_get = manager.get_stats("react-18:hooks").await.unwrap().unwrap();
    assert_eq!(after_get.query_count, after_set.query_count + 1);
    assert_eq!(after_get.created_at, after_set.created_at);

    let log = durable.query_log_for("react-18:hooks").await.unwrap();
    assert!(log.last().unwrap().cache_hit);
    assert_eq!(log.iter().filter(|row| row.cache_hit).count(), 1);
}

#[tokio::test]
async fn test_durable_only_entry_is_promoted() {
    let (manager, durable) = memory_manager(test_config()).await;
    durable
        .upsert_entry(&new_entry("rails-7:routing", "resources :photos"), Utc::now())
        .await
        .unwrap();

    let first = manager.get("rails-7:routing").await.unwrap();
    assert_eq!(first.tier(), Some(TierKind::Durable));

    let second = manager.get("rails-7:routing").await.unwrap();
    assert_eq!(second.tier(), Some(TierKind::Fast));
    assert_eq!(second.entry().unwrap().content, "resources :photos");
}

#[tokio::test]
async fn test_fast_tier_down_uses_durable() {
    let durable = Arc::new(SqliteDurableTier::in_memory().await.unwrap());
    let manager = CacheManager::new(test_config(), Arc::new(DownFastTier), durable.clone());

    assert!(manager.set(new_entry("django-5:forms", "ModelForm")).await.unwrap());

    let lookup = manager.get("django-5:forms").await.unwrap();
    assert_eq!(lookup.tier(), Some(TierKind::Durable));
    assert_eq!(lookup.entry().unwrap().content, "ModelForm");
    assert!(manager.invalidate("django-5:forms").await.unwrap());
}

#[tokio::test]
async fn test_hanging_fast_tier_stays_within_envelope() {
    let config = test_config();
    let durable = Arc::new(SqliteDurableTier::in_memory().await.unwrap());
    let manager = CacheManager::new(config.clone(), Arc::new(HangingFastTier), durable);

    let started = Instant::now();
    assert!(manager.set(new_entry("vue-3:routing", "createRouter")).await.unwrap());
    let lookup = manager.get("vue-3:routing").await.unwrap();
    let elapsed = started.elapsed();

    assert!(lookup.is_hit());
    // One fast tier timeout for set, two for get (read and promotion), plus slack
    let envelope = config.fast_tier_timeout * 3 + config.durable_tier_timeout * 4;
    assert!(elapsed < envelope, "took {:?}", elapsed);
}

#[tokio::test]
async fn test_durable_hit_does_not_wait_for_bookkeeping() {
    let inner = Arc::new(SqliteDurableTier::in_memory().await.unwrap());
    inner
        .upsert_entry(&new_entry("rails-7:testing", "rspec-rails"), Utc::now())
        .await
        .unwrap();
    let durable = Arc::new(SlowBookkeepingTier {
        inner: inner.clone(),
        delay: Duration::from_millis(300),
    });
    let manager = CacheManager::new(test_config(), Arc::new(MemoryFastTier::default()), durable);

    let started = Instant::now();
    let lookup = manager.get("rails-7:testing").await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(lookup.tier(), Some(TierKind::Durable));
    assert_eq!(lookup.entry().unwrap().query_count, 1);
    assert!(elapsed < Duration::from_millis(200), "took {:?}", elapsed);

    // Counters and the log row land once bookkeeping drains
    manager.flush().await;
    let stored = inner.fetch_entry("rails-7:testing").await.unwrap().unwrap();
    assert_eq!(stored.query_count, 1);
    let log = inner.query_log_for("rails-7:testing").await.unwrap();
    assert_eq!(log.len(), 1);
    assert!(log[0].cache_hit);
}

#[tokio::test]
async fn test_durable_down_serves_fast_tier_and_fails_writes() {
    let fast = Arc::new(MemoryFastTier::default());
    let healthy = Arc::new(SqliteDurableTier::in_memory().await.unwrap());

    // Populate the fast tier through a healthy manager sharing it
    let seeding = CacheManager::new(test_config(), fast.clone(), healthy);
    assert!(seeding.set(new_entry("express-4:routing", "app.get")).await.unwrap());

    let manager = CacheManager::new(test_config(), fast, Arc::new(DownDurableTier));

    let lookup = manager.get("express-4:routing").await.unwrap();
    assert_eq!(lookup.tier(), Some(TierKind::Fast));
    manager.flush().await;

    assert_eq!(manager.get("express-4:hooks").await.unwrap(), Lookup::Degraded);
    assert!(!manager.set(new_entry("express-4:hooks", "x")).await.unwrap());
    assert!(!manager.invalidate("express-4:routing").await.unwrap());
    assert!(manager.get_stats("express-4:routing").await.unwrap().is_none());

    let metrics = manager.metrics();
    assert_eq!(metrics.fast_hits, 1);
    assert_eq!(metrics.degraded, 1);
    assert_eq!(metrics.failed_writes, 1);
}

#[tokio::test]
async fn test_invalidate_is_idempotent() {
    let (manager, _) = memory_manager(test_config()).await;

    assert!(manager.invalidate("flask-3:testing").await.unwrap());
    assert!(manager.set(new_entry("flask-3:testing", "pytest")).await.unwrap());
    assert!(manager.invalidate("flask-3:testing").await.unwrap());
    assert!(manager.invalidate("flask-3:testing").await.unwrap());
    assert_eq!(manager.get("flask-3:testing").await.unwrap(), Lookup::Miss);
}

#[tokio::test]
async fn test_malformed_fingerprints_are_errors() {
    let (manager, _) = memory_manager(test_config()).await;

    for bad in ["", "react", "react-18", ":hooks", "react-:hooks"] {
        assert!(
            matches!(manager.get(bad).await, Err(CacheError::MalformedInput(_))),
            "{:?} should be rejected",
            bad
        );
    }
}

#[tokio::test]
async fn test_get_or_fetch() {
    let (manager, _) = memory_manager(test_config()).await;
    let provider = CountingProvider::new();
    let fp = fingerprint("next", Some("14.1.0"), "app router layouts").unwrap();
    assert_eq!(fp.key, "next-14:routing");

    let first = manager
        .get_or_fetch(&fp, &provider, Some("app router layouts"))
        .await
        .unwrap();
    assert!(matches!(first, FetchOutcome::Fetched { stored: true, .. }));

    let second = manager
        .get_or_fetch(&fp, &provider, Some("nested routes"))
        .await
        .unwrap();
    assert!(second.was_cached());
    assert_eq!(provider.calls(), 1);
}

#[tokio::test]
async fn test_get_or_fetch_provider_failure_is_not_an_error() {
    let (manager, _) = memory_manager(test_config()).await;
    let provider = CountingProvider::new().always_failing();
    let fp = fingerprint("svelte", None, "stores").unwrap();

    let outcome = manager.get_or_fetch(&fp, &provider, None).await.unwrap();
    assert!(matches!(outcome, FetchOutcome::Unavailable { .. }));
    assert!(outcome.content().is_none());
    assert_eq!(manager.get(&fp.key).await.unwrap(), Lookup::Miss);
}

#[tokio::test]
async fn test_slow_provider_times_out() {
    let config = ouroboros_doccache::CacheConfig::builder()
        .provider_timeout(Duration::from_millis(20))
        .build();
    let (manager, _) = memory_manager(config).await;
    let provider = CountingProvider::new().with_delay(Duration::from_secs(5));
    let fp = fingerprint("astro", Some("4"), "deploy to netlify").unwrap();

    let started = Instant::now();
    let outcome = manager.get_or_fetch(&fp, &provider, None).await.unwrap();
    assert!(matches!(outcome, FetchOutcome::Unavailable { .. }));
    assert!(started.elapsed() < Duration::from_secs(2));
}
