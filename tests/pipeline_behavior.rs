//! Behavior-driven tests for the resilient call pipeline
//!
//! These tests verify HOW an adapter call flows through cache, circuit
//! breaker, rate limiter and retry, and what the caller observes.

use std::time::Duration;

use futures::future::join_all;
use pubdata_core::{
    BucketConfig, CacheSource, CircuitBreakerConfig, CircuitState, CoreConfig, DeclaredSchema,
    Jitter, MetricsAggregator, ResourcePolicy, RetryPolicy, Verdict,
};
use pubdata_tests::{
    upstream_down, Arc, CallErrorKind, FetchError, FetchRequest, ResilientPipeline,
    ScriptedFetcher,
};
use serde_json::json;

fn quick_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::new(max_attempts, Duration::from_millis(100), Duration::from_secs(1))
        .with_jitter(Jitter::None)
}

fn apod() -> FetchRequest {
    FetchRequest::new("planetary/apod").expect("valid request")
}

// =============================================================================
// Pipeline: Retry and Cache
// =============================================================================

#[tokio::test(start_paused = true)]
async fn when_upstream_flaps_system_retries_and_caches_the_recovery() {
    // Given: NASA fails twice, then answers
    let nasa = Arc::new(
        ScriptedFetcher::new("scientific", "api.nasa.gov", Ok(json!({ "title": "M31" })))
            .then(Err(upstream_down()))
            .then(Err(upstream_down())),
    );
    let pipeline = ResilientPipeline::builder().with_retry(quick_retry(3)).build();

    // When: The call is made
    let first = pipeline
        .execute_enveloped(nasa.clone(), apod())
        .await
        .expect("third attempt succeeds");

    // Then: The caller sees only the success
    assert_eq!(first.data["title"], "M31");
    assert_eq!(first.meta.source, CacheSource::Fetched);
    assert_eq!(nasa.calls(), 3);
    assert_eq!(pipeline.stats().retries, 2);

    // When: The same request is repeated
    let second = pipeline
        .execute_enveloped(nasa.clone(), apod())
        .await
        .expect("cached");

    // Then: It is served from cache without touching the upstream
    assert!(second.was_cached());
    assert_eq!(nasa.calls(), 3);
    assert_eq!(second.meta.cache_key, first.meta.cache_key);
    assert_ne!(second.meta.call_id, first.meta.call_id);
}

#[tokio::test(start_paused = true)]
async fn when_many_callers_ask_for_the_same_data_upstream_sees_one_request() {
    // Given: A slow upstream
    let weather = Arc::new(
        ScriptedFetcher::new("geographic", "api.weather.gov", Ok(json!({ "temp_c": 9 })))
            .with_latency(Duration::from_millis(200)),
    );
    let pipeline = ResilientPipeline::builder().build();

    // When: Ten callers ask concurrently
    let calls = (0..10).map(|_| {
        let pipeline = pipeline.clone();
        let weather = weather.clone();
        async move {
            pipeline
                .execute_fetcher(weather, FetchRequest::new("forecast").expect("valid"))
                .await
        }
    });
    let results = join_all(calls).await;

    // Then: One upstream call served all ten
    assert!(results.iter().all(Result::is_ok));
    assert_eq!(weather.calls(), 1);
    assert_eq!(pipeline.rate_limiter().stats().granted, 1);
    assert_eq!(pipeline.cache().stats().coalesced, 9);
}

// =============================================================================
// Pipeline: Failure Kinds
// =============================================================================

#[tokio::test(start_paused = true)]
async fn when_upstream_keeps_failing_circuit_opens_and_later_calls_fail_fast() {
    // Given: A breaker that opens after two failures and no retries
    let github = Arc::new(ScriptedFetcher::new(
        "technology",
        "api.github.com",
        Err(upstream_down()),
    ));
    let pipeline = ResilientPipeline::builder()
        .with_retry(RetryPolicy::disabled())
        .with_circuit_breaker(CircuitBreakerConfig {
            failure_threshold: 2,
            ..CircuitBreakerConfig::default()
        })
        .build();
    let request = |n: u32| FetchRequest::new("repos").expect("valid").with_arg("page", n);

    // When: Two calls fail
    for page in 0..2 {
        let error = pipeline
            .execute_fetcher(github.clone(), request(page))
            .await
            .expect_err("upstream is down");
        assert_eq!(error.kind(), CallErrorKind::RetriesExhausted);
    }

    // Then: The third call is rejected without reaching the upstream
    let error = pipeline
        .execute_fetcher(github.clone(), request(2))
        .await
        .expect_err("circuit open");
    assert_eq!(error.kind(), CallErrorKind::CircuitOpen);
    assert_eq!(github.calls(), 2);
    assert_eq!(
        pipeline.circuits().get("api.github.com").state(),
        CircuitState::Open
    );
}

#[tokio::test(start_paused = true)]
async fn when_the_rate_budget_is_spent_system_reports_rate_limited() {
    // Given: One request per minute and a one second wait budget
    let news = Arc::new(ScriptedFetcher::new("news", "newsapi.org", Ok(json!({ "articles": [] }))));
    let pipeline = ResilientPipeline::builder()
        .with_rate_limit(BucketConfig::new(1, Duration::from_secs(60)))
        .with_max_wait(Duration::from_secs(1))
        .build();
    let search = |q: &str| FetchRequest::new("everything").expect("valid").with_arg("q", q);

    // When: Two distinct searches are made back to back
    pipeline
        .execute_fetcher(news.clone(), search("rust"))
        .await
        .expect("first call fits the budget");
    let error = pipeline
        .execute_fetcher(news.clone(), search("tokio"))
        .await
        .expect_err("budget spent");

    // Then: The second is refused and the upstream saw only one call
    assert_eq!(error.kind(), CallErrorKind::RateLimited);
    assert_eq!(error.resource_key(), "newsapi.org");
    assert_eq!(news.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn when_the_request_is_invalid_system_neither_retries_nor_trips_the_circuit() {
    // Given: An upstream that rejects the request outright
    let nasa = Arc::new(ScriptedFetcher::new(
        "scientific",
        "api.nasa.gov",
        Err(FetchError::from_status(400, "bad date")),
    ));
    let pipeline = ResilientPipeline::builder().with_retry(quick_retry(5)).build();

    // When: The call is made
    let error = pipeline
        .execute_fetcher(nasa.clone(), apod())
        .await
        .expect_err("invalid request");

    // Then: It fails once as a validation error with no circuit penalty
    assert_eq!(error.kind(), CallErrorKind::Validation);
    assert_eq!(error.attempts(), 1);
    assert_eq!(nasa.calls(), 1);
    assert_eq!(pipeline.circuits().get("api.nasa.gov").failure_count(), 0);
}

// =============================================================================
// Pipeline: Fallbacks
// =============================================================================

#[tokio::test(start_paused = true)]
async fn when_the_primary_fails_system_serves_the_first_working_fallback() {
    // Given: A failing primary with two fallbacks, the first also down
    let primary = Arc::new(ScriptedFetcher::new("markets", "api.coingecko.com", Err(upstream_down())));
    let broken = Arc::new(ScriptedFetcher::new("markets_mirror", "mirror.coingecko.com", Err(upstream_down())));
    let backup = Arc::new(ScriptedFetcher::new(
        "markets_backup",
        "api.coincap.io",
        Ok(json!({ "price": 64_000 })),
    ));
    let pipeline = ResilientPipeline::builder()
        .with_retry(RetryPolicy::disabled())
        .with_fallback("api.coingecko.com", broken.clone())
        .build();
    pipeline.register_fallback("api.coingecko.com", backup.clone());

    // When: The enveloped call is made
    let envelope = pipeline
        .execute_enveloped(primary.clone(), FetchRequest::new("simple/price").expect("valid"))
        .await
        .expect("backup answers");

    // Then: Each source was tried once, in order, and the caller is told who answered
    assert_eq!(envelope.data["price"], 64_000);
    assert_eq!(envelope.meta.resource_key, "api.coincap.io");
    assert_eq!(envelope.meta.warnings.len(), 1);
    assert_eq!((primary.calls(), broken.calls(), backup.calls()), (1, 1, 1));
    assert_eq!(pipeline.stats().fallbacks_served, 1);
}

#[tokio::test(start_paused = true)]
async fn when_every_fallback_fails_caller_sees_the_primary_error() {
    // Given: A rate-limited primary and a fallback that is down
    let primary = Arc::new(ScriptedFetcher::new("news", "newsapi.org", Ok(json!({ "articles": [] }))));
    let fallback = Arc::new(ScriptedFetcher::new("news_rss", "feeds.bbci.co.uk", Err(upstream_down())));
    let pipeline = ResilientPipeline::builder()
        .with_retry(RetryPolicy::disabled())
        .with_rate_limit(BucketConfig::new(1, Duration::from_secs(60)))
        .with_resource_policy(ResourcePolicy::new("feeds.bbci.co.uk", 100, Duration::from_secs(60)))
        .with_max_wait(Duration::ZERO)
        .with_fallback("newsapi.org", fallback.clone())
        .build();
    let search = |q: &str| FetchRequest::new("everything").expect("valid").with_arg("q", q);
    pipeline
        .execute_fetcher(primary.clone(), search("rust"))
        .await
        .expect("first call fits the budget");

    // When: The budget is spent and the fallback is down too
    let error = pipeline
        .execute_fetcher(primary.clone(), search("tokio"))
        .await
        .expect_err("nothing can answer");

    // Then: The primary's failure is reported
    assert_eq!(error.kind(), CallErrorKind::RateLimited);
    assert_eq!(error.resource_key(), "newsapi.org");
    assert_eq!(fallback.calls(), 1);
}

#[tokio::test]
async fn when_the_request_is_invalid_fallbacks_are_not_tried() {
    // Given: A primary that rejects the request and a healthy fallback
    let primary = Arc::new(ScriptedFetcher::new(
        "scientific",
        "api.nasa.gov",
        Err(FetchError::from_status(400, "bad date")),
    ));
    let fallback = Arc::new(ScriptedFetcher::new("scientific_mirror", "mirror.nasa.gov", Ok(json!({}))));
    let pipeline = ResilientPipeline::builder()
        .with_fallback("api.nasa.gov", fallback.clone())
        .build();

    // When: The call is made
    let error = pipeline
        .execute_fetcher(primary, apod())
        .await
        .expect_err("invalid request");

    // Then: The validation error is returned without consulting the fallback
    assert_eq!(error.kind(), CallErrorKind::Validation);
    assert_eq!(fallback.calls(), 0);
}

// =============================================================================
// Pipeline: Quality and Metrics
// =============================================================================

#[tokio::test]
async fn when_the_payload_reports_an_error_envelope_carries_a_poor_verdict() {
    // Given: An upstream that answers 200 with an error body
    let markets = Arc::new(ScriptedFetcher::new(
        "financial",
        "api.coingecko.com",
        Ok(json!({ "error": "coin not found", "price": null })),
    ));
    let pipeline = ResilientPipeline::builder().build();
    let request = FetchRequest::new("simple/price")
        .expect("valid")
        .with_arg("ids", "notacoin")
        .with_schema(DeclaredSchema::new(["price"], Duration::from_secs(60)));

    // When: The enveloped call is made
    let envelope = pipeline
        .execute_enveloped(markets, request)
        .await
        .expect("transport succeeded");

    // Then: The score is poor and the caller is warned
    let quality = envelope.meta.quality.expect("schema was declared");
    assert_eq!(quality.verdict, Verdict::Poor);
    assert_eq!(quality.completeness, 0.0);
    assert_eq!(envelope.meta.warnings.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn when_metrics_are_collected_snapshot_reflects_every_component() {
    // Given: A pipeline that served one miss, one hit and one failure
    let nasa = Arc::new(
        ScriptedFetcher::new("scientific", "api.nasa.gov", Err(upstream_down()))
            .then(Ok(json!({ "title": "M31" }))),
    );
    let pipeline = ResilientPipeline::builder()
        .with_retry(RetryPolicy::disabled())
        .build();
    pipeline.execute_fetcher(nasa.clone(), apod()).await.expect("miss");
    pipeline.execute_fetcher(nasa.clone(), apod()).await.expect("hit");
    let other = FetchRequest::new("neo/feed").expect("valid");
    pipeline
        .execute_fetcher(nasa.clone(), other)
        .await
        .expect_err("upstream down");

    // When: A snapshot is taken
    let snapshot = MetricsAggregator::for_pipeline(&pipeline).snapshot();

    // Then: Every component reports
    let cache = snapshot.cache.expect("cache stats");
    assert_eq!((cache.hits, cache.misses), (1, 1));
    let stats = snapshot.pipeline.expect("pipeline stats");
    assert_eq!((stats.calls, stats.successes, stats.retries_exhausted), (3, 2, 1));
    assert_eq!(snapshot.circuits[0].total_failures, 1);
}

// =============================================================================
// Pipeline: Configuration
// =============================================================================

#[tokio::test(start_paused = true)]
async fn when_stages_are_disabled_in_config_system_calls_straight_through() {
    // Given: A config with caching and retries turned off
    let config = CoreConfig::from_toml_str(
        r#"
        [cache]
        enabled = false

        [retry]
        enabled = false
        "#,
    )
    .expect("valid config");
    let pipeline = ResilientPipeline::from_config(&config, None).expect("pipeline");
    let nasa = Arc::new(
        ScriptedFetcher::new("scientific", "api.nasa.gov", Ok(json!({ "title": "M31" })))
            .then(Err(upstream_down())),
    );

    // When: The same request is made twice
    let first = pipeline.execute_fetcher(nasa.clone(), apod()).await;
    let second = pipeline.execute_fetcher(nasa.clone(), apod()).await;

    // Then: No retry hid the failure and nothing was cached
    assert_eq!(
        first.expect_err("not retried").kind(),
        CallErrorKind::RetriesExhausted
    );
    assert!(second.is_ok());
    assert_eq!(nasa.calls(), 2);
    assert!(!pipeline.stages().cache);
    assert_eq!(pipeline.cache().stats().entries, 0);
}
