//! Behavior-driven tests for the cache manager
//!
//! These tests verify HOW the cache protects upstreams under concurrency,
//! expiry and a misbehaving distributed tier.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::future::join_all;
use pubdata_core::{
    CacheBackendError, CacheManager, CacheSource, DistributedCache, InMemoryStore, KeyValueStore,
    LocalCache,
};
use pubdata_core::distributed::StoreFuture;
use pubdata_tests::{Arc, CacheKey};
use serde_json::json;

fn manager() -> CacheManager<String> {
    CacheManager::new(LocalCache::new(100), None)
}

// =============================================================================
// Cache: Stampede Protection
// =============================================================================

#[tokio::test(start_paused = true)]
async fn when_many_callers_miss_the_same_key_system_fetches_once() {
    // Given: A cold cache and a slow upstream
    let cache = manager();
    let fetches = Arc::new(AtomicUsize::new(0));

    // When: 20 callers ask for the same key at once
    let calls = (0..20).map(|_| {
        let cache = cache.clone();
        let fetches = Arc::clone(&fetches);
        async move {
            cache
                .get_or_fetch("financial:rates:", Duration::from_secs(60), move || async move {
                    fetches.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok(json!({ "usd_eur": 0.92 }))
                })
                .await
        }
    });
    let results = join_all(calls).await;

    // Then: Exactly one upstream fetch served everyone
    assert_eq!(fetches.load(Ordering::SeqCst), 1);
    for result in &results {
        assert_eq!(result.as_ref().expect("shared success").value["usd_eur"], 0.92);
    }
    let stats = cache.stats();
    assert_eq!(stats.coalesced, 19);
    assert_eq!(stats.in_flight, 0);
}

#[tokio::test(start_paused = true)]
async fn when_the_shared_fetch_fails_every_waiter_sees_the_error_and_nothing_is_cached() {
    // Given: An upstream that fails once, then recovers
    let cache = manager();
    let fetches = Arc::new(AtomicUsize::new(0));
    let fetch = |fetches: Arc<AtomicUsize>| {
        move || async move {
            let n = fetches.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            if n == 0 {
                Err(String::from("upstream exploded"))
            } else {
                Ok(json!({ "ok": true }))
            }
        }
    };

    // When: Five callers share the failing flight
    let results = join_all((0..5).map(|_| {
        cache.get_or_fetch("news:headlines:", Duration::from_secs(60), fetch(Arc::clone(&fetches)))
    }))
    .await;

    // Then: All five see the same error and nothing was stored
    assert!(results
        .iter()
        .all(|r| r.as_ref().err().map(String::as_str) == Some("upstream exploded")));
    assert!(cache.peek("news:headlines:").is_none());

    // And: The next caller triggers a fresh fetch
    let retry = cache
        .get_or_fetch("news:headlines:", Duration::from_secs(60), fetch(Arc::clone(&fetches)))
        .await
        .expect("recovered upstream");
    assert_eq!(retry.source, CacheSource::Fetched);
    assert_eq!(fetches.load(Ordering::SeqCst), 2);
}

// =============================================================================
// Cache: Expiry
// =============================================================================

#[tokio::test(start_paused = true)]
async fn when_an_entry_outlives_its_ttl_system_fetches_again() {
    // Given: A value cached for 30 seconds
    let cache = manager();
    let fetches = Arc::new(AtomicUsize::new(0));
    let fetch = || {
        let fetches = Arc::clone(&fetches);
        move || async move {
            fetches.fetch_add(1, Ordering::SeqCst);
            Ok(json!({ "kp_index": 3 }))
        }
    };
    cache
        .get_or_fetch("scientific:space_weather:", Duration::from_secs(30), fetch())
        .await
        .expect("first fetch");

    // When: 29 seconds pass
    tokio::time::advance(Duration::from_secs(29)).await;
    let fresh = cache
        .get_or_fetch("scientific:space_weather:", Duration::from_secs(30), fetch())
        .await
        .expect("cached");

    // Then: The cached value is served
    assert_eq!(fresh.source, CacheSource::Local);

    // When: The TTL elapses
    tokio::time::advance(Duration::from_secs(2)).await;
    let refetched = cache
        .get_or_fetch("scientific:space_weather:", Duration::from_secs(30), fetch())
        .await
        .expect("refetch");

    // Then: The upstream is called again
    assert_eq!(refetched.source, CacheSource::Fetched);
    assert_eq!(fetches.load(Ordering::SeqCst), 2);
}

// =============================================================================
// Cache: Distributed Tier
// =============================================================================

#[tokio::test]
async fn when_another_process_already_fetched_system_reads_the_distributed_tier() {
    // Given: Two cache managers sharing one external store
    let store = Arc::new(InMemoryStore::new());
    let tier = || DistributedCache::new(store.clone(), Duration::from_millis(250));
    let first: CacheManager<String> = CacheManager::new(LocalCache::new(10), Some(tier()));
    let second: CacheManager<String> = CacheManager::new(LocalCache::new(10), Some(tier()));

    // When: The first one fetches and the second one asks for the same key
    first
        .get_or_fetch("geographic:weather:", Duration::from_secs(60), || async {
            Ok(json!({ "temp_c": 4 }))
        })
        .await
        .expect("fetch");
    let lookup = second
        .get_or_fetch("geographic:weather:", Duration::from_secs(60), || async {
            Err(String::from("should not be called"))
        })
        .await
        .expect("distributed hit");

    // Then: The second process is served from the shared tier
    assert_eq!(lookup.source, CacheSource::Distributed);
    assert_eq!(lookup.value["temp_c"], 4);
    assert_eq!(second.stats().distributed_hits, 1);
    assert!(second.peek("geographic:weather:").is_some());
}

struct BrokenStore;

impl KeyValueStore for BrokenStore {
    fn get<'a>(&'a self, _key: &'a str) -> StoreFuture<'a, Option<String>> {
        Box::pin(async { Err(CacheBackendError::Unavailable(String::from("connection refused"))) })
    }

    fn set<'a>(&'a self, _key: &'a str, _value: String, _ttl: Duration) -> StoreFuture<'a, ()> {
        Box::pin(async { Err(CacheBackendError::Unavailable(String::from("connection refused"))) })
    }

    fn delete<'a>(&'a self, _key: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async { Err(CacheBackendError::Unavailable(String::from("connection refused"))) })
    }
}

#[tokio::test]
async fn when_the_distributed_backend_is_down_system_keeps_serving_locally() {
    // Given: A cache whose distributed tier always fails
    let cache: CacheManager<String> = CacheManager::new(
        LocalCache::new(10),
        Some(DistributedCache::new(Arc::new(BrokenStore), Duration::from_millis(50))),
    );

    // When: A value is fetched, read back and invalidated
    let fetched = cache
        .get_or_fetch("technology:repos:", Duration::from_secs(60), || async {
            Ok(json!({ "stars": 42 }))
        })
        .await
        .expect("fetch despite broken tier");
    let cached = cache
        .get_or_fetch("technology:repos:", Duration::from_secs(60), || async {
            Err(String::from("should be cached"))
        })
        .await
        .expect("local hit");
    cache.invalidate("technology:repos:").await;

    // Then: Callers never saw the backend failures, which were only counted
    assert_eq!(fetched.source, CacheSource::Fetched);
    assert_eq!(cached.source, CacheSource::Local);
    assert!(cache.peek("technology:repos:").is_none());
    assert_eq!(cache.stats().backend_errors, 3);
}

// =============================================================================
// Cache: Key Construction
// =============================================================================

#[test]
fn when_arguments_arrive_in_any_order_system_builds_the_same_key() {
    // Given: The same arguments supplied in different orders
    let a = CacheKey::builder("financial", "quote")
        .arg("symbol", "AAPL")
        .arg("interval", "1d")
        .build()
        .expect("valid key");
    let b = CacheKey::builder("financial", "quote")
        .arg("interval", "1d")
        .arg("symbol", "AAPL")
        .build()
        .expect("valid key");

    // Then: Both produce one identical key
    assert_eq!(a, b);
}

#[test]
fn when_arguments_are_huge_system_falls_back_to_a_digest_key() {
    // Given: An argument that would blow past the key length limit
    let key = CacheKey::builder("news", "search")
        .arg("q", "x".repeat(1_000))
        .build()
        .expect("valid key");

    // Then: The key is a bounded digest form
    assert!(key.is_digest());
    assert!(key.as_str().len() <= pubdata_core::cache_key::MAX_KEY_LEN);
}
