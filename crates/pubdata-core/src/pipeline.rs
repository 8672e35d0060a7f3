//! The resilient call pipeline.
//!
//! Every adapter call runs through the same stages, in order:
//!
//! 1. cache lookup (single-flight on a miss)
//! 2. circuit breaker admission for the resource
//! 3. one rate-limit acquisition with a bounded wait
//! 4. upstream attempts with a per-attempt deadline and jittered backoff
//!
//! Callers get a payload or a [`CallError`] of exactly one of four kinds.
//! Fetcher calls may also fall back to substitute fetchers registered for
//! the primary's resource key.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::cache::{CacheLookup, CacheManager, CacheMode};
use crate::cache_key::CacheKey;
use crate::circuit_breaker::{CircuitBreakerConfig, CircuitPermit, CircuitRegistry};
use crate::config::CoreConfig;
use crate::distributed::{DistributedCache, KeyValueStore};
use crate::envelope::{Envelope, EnvelopeMeta};
use crate::error::{CallError, CallErrorKind, ConfigError, ValidationError};
use crate::fetcher::{FetchError, FetchErrorKind, FetchRequest, Fetcher, Payload};
use crate::local_cache::LocalCache;
use crate::quality::{FreshnessBands, QualityValidator};
use crate::resource_policy::ResourcePolicy;
use crate::retry::RetryPolicy;
use crate::throttling::{BucketConfig, RateLimiter};

/// Independently switchable pipeline stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageToggles {
    pub cache: bool,
    pub rate_limit: bool,
    pub circuit_breaker: bool,
    pub retry: bool,
    pub quality: bool,
}

impl Default for StageToggles {
    fn default() -> Self {
        Self {
            cache: true,
            rate_limit: true,
            circuit_breaker: true,
            retry: true,
            quality: true,
        }
    }
}

/// Point-in-time pipeline counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    pub calls: u64,
    pub successes: u64,
    pub cache_hits: u64,
    pub attempts: u64,
    pub retries: u64,
    pub validation_failures: u64,
    pub rate_limited: u64,
    pub circuit_open: u64,
    pub retries_exhausted: u64,
    /// Fetcher calls answered by a fallback after the primary failed.
    pub fallbacks_served: u64,
}

#[derive(Debug, Default)]
struct PipelineCounters {
    calls: AtomicU64,
    successes: AtomicU64,
    cache_hits: AtomicU64,
    attempts: AtomicU64,
    retries: AtomicU64,
    validation_failures: AtomicU64,
    rate_limited: AtomicU64,
    circuit_open: AtomicU64,
    retries_exhausted: AtomicU64,
    fallbacks_served: AtomicU64,
}

impl PipelineCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn record(&self, outcome: &Result<CacheLookup, CallError>) {
        match outcome {
            Ok(lookup) => {
                Self::bump(&self.successes);
                if lookup.was_cached() {
                    Self::bump(&self.cache_hits);
                }
            }
            Err(error) => Self::bump(match error.kind() {
                CallErrorKind::Validation => &self.validation_failures,
                CallErrorKind::RateLimited => &self.rate_limited,
                CallErrorKind::CircuitOpen => &self.circuit_open,
                CallErrorKind::RetriesExhausted => &self.retries_exhausted,
            }),
        }
    }

    fn snapshot(&self) -> PipelineStats {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        PipelineStats {
            calls: load(&self.calls),
            successes: load(&self.successes),
            cache_hits: load(&self.cache_hits),
            attempts: load(&self.attempts),
            retries: load(&self.retries),
            validation_failures: load(&self.validation_failures),
            rate_limited: load(&self.rate_limited),
            circuit_open: load(&self.circuit_open),
            retries_exhausted: load(&self.retries_exhausted),
            fallbacks_served: load(&self.fallbacks_served),
        }
    }
}

/// Who is being called, for error reporting.
#[derive(Debug, Clone)]
struct CallTarget {
    resource_key: String,
    operation: String,
}

impl CallTarget {
    fn error(&self, kind: CallErrorKind, message: impl Into<String>) -> CallError {
        CallError::new(kind, &self.resource_key, &self.operation, message)
    }
}

/// Ordered substitute fetchers, keyed by the primary's resource key.
#[derive(Default)]
struct FallbackChains(DashMap<String, Vec<Arc<dyn Fetcher>>>);

impl FallbackChains {
    fn push(&self, resource_key: String, fallback: Arc<dyn Fetcher>) {
        self.0.entry(resource_key).or_default().push(fallback);
    }

    fn for_resource(&self, resource_key: &str) -> Vec<Arc<dyn Fetcher>> {
        self.0
            .get(resource_key)
            .map(|chain| chain.value().clone())
            .unwrap_or_default()
    }
}

impl std::fmt::Debug for FallbackChains {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut map = f.debug_map();
        for chain in self.0.iter() {
            let names: Vec<&str> = chain.value().iter().map(|fetcher| fetcher.name()).collect();
            map.entry(chain.key(), &names);
        }
        map.finish()
    }
}

struct Inner {
    cache: CacheManager<CallError>,
    limiter: RateLimiter,
    circuits: CircuitRegistry,
    retry: RetryPolicy,
    quality: QualityValidator,
    stages: StageToggles,
    max_wait: Duration,
    call_timeout: Duration,
    default_ttl: Duration,
    fallbacks: FallbackChains,
    counters: PipelineCounters,
}

/// Shared entry point for every adapter call. Cheap to clone.
#[derive(Clone)]
pub struct ResilientPipeline {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ResilientPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilientPipeline")
            .field("stages", &self.inner.stages)
            .field("retry", &self.inner.retry)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl ResilientPipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::new()
    }

    /// Builds a pipeline from validated configuration.
    ///
    /// `store` backs the distributed tier when `cache.distributed_enabled` is set.
    pub fn from_config(
        config: &CoreConfig,
        store: Option<Arc<dyn KeyValueStore>>,
    ) -> Result<Self, ConfigError> {
        config.validate().map_err(ConfigError::Invalid)?;

        let mut builder = PipelineBuilder::new()
            .with_default_ttl(config.cache.default_ttl())
            .with_cache_max_size(config.cache.max_size)
            .with_rate_limit(config.rate_limit.bucket())
            .with_max_wait(config.rate_limit.max_wait())
            .with_circuit_breaker(config.circuit_breaker.config())
            .with_retry(config.retry.policy())
            .with_call_timeout(config.pipeline.call_timeout())
            .with_freshness_bands(config.quality.bands())
            .with_stages(StageToggles {
                cache: config.cache.enabled,
                rate_limit: config.rate_limit.enabled,
                circuit_breaker: config.circuit_breaker.enabled,
                retry: config.retry.enabled,
                quality: config.quality.enabled,
            });
        for policy in config.rate_limit.policies() {
            builder = builder.with_resource_policy(policy);
        }
        if let (true, Some(store)) = (config.cache.distributed_enabled, store) {
            builder = builder.with_distributed(DistributedCache::new(
                store,
                config.cache.distributed_timeout(),
            ));
        }

        Ok(builder.build())
    }

    /// Runs `operation` for `resource_key` behind cache, circuit, rate limit
    /// and retry.
    ///
    /// # Errors
    ///
    /// Returns a [`CallError`] whose kind is one of `Validation`,
    /// `RateLimited`, `CircuitOpen` or `RetriesExhausted`.
    pub async fn execute<F, Fut>(
        &self,
        resource_key: &str,
        cache_key: &CacheKey,
        ttl: Duration,
        operation: F,
    ) -> Result<Payload, CallError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Payload, FetchError>> + Send + 'static,
    {
        let target = CallTarget {
            resource_key: resource_key.to_owned(),
            operation: cache_key
                .operation()
                .unwrap_or_else(|| cache_key.as_str().to_owned()),
        };
        self.run(target, cache_key, ttl, operation)
            .await
            .map(|lookup| lookup.value)
    }

    /// Runs `request` through `fetcher`, deriving the resource key, cache key
    /// and TTL from them.
    ///
    /// # Errors
    ///
    /// When the primary fails with anything but a validation error, each
    /// fallback registered for its resource key is tried in order. If every
    /// fallback fails too, the primary's error is returned.
    pub async fn execute_fetcher(
        &self,
        fetcher: Arc<dyn Fetcher>,
        request: FetchRequest,
    ) -> Result<Payload, CallError> {
        self.run_with_fallbacks(fetcher, &request)
            .await
            .map(|served| served.lookup.value)
    }

    /// Like [`execute_fetcher`](Self::execute_fetcher), wrapped in an
    /// [`Envelope`] with call metadata and, when the request declares a
    /// schema, a quality score.
    pub async fn execute_enveloped(
        &self,
        fetcher: Arc<dyn Fetcher>,
        request: FetchRequest,
    ) -> Result<Envelope<Payload>, CallError> {
        let started = Instant::now();
        let Served {
            lookup,
            cache_key,
            fetcher,
            fallback_for,
        } = self.run_with_fallbacks(fetcher, &request).await?;
        let latency_ms = started.elapsed().as_millis() as u64;

        let mut meta = EnvelopeMeta::new(
            fetcher.resource_key(),
            &cache_key,
            lookup.source,
            lookup.fetched_at,
            latency_ms,
        );
        if let Some(primary) = fallback_for {
            meta.push_warning(format!(
                "served by fallback '{}' after '{primary}' failed",
                fetcher.name()
            ));
        }
        if let (true, Some(schema)) = (self.inner.stages.quality, &request.schema) {
            let score = self
                .inner
                .quality
                .score(&lookup.value, lookup.fetched_at, schema);
            meta = meta.with_quality(score);
        }

        Ok(Envelope::new(meta, lookup.value))
    }

    /// Appends `fallback` to the chain tried when fetchers for
    /// `resource_key` fail. Fallbacks run through the full pipeline under
    /// their own resource key.
    pub fn register_fallback(&self, resource_key: impl Into<String>, fallback: Arc<dyn Fetcher>) {
        self.inner.fallbacks.push(resource_key.into(), fallback);
    }

    pub async fn invalidate(&self, cache_key: &CacheKey) {
        self.inner.cache.invalidate(cache_key.as_str()).await;
    }

    pub fn cache(&self) -> &CacheManager<CallError> {
        &self.inner.cache
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.inner.limiter
    }

    pub fn circuits(&self) -> &CircuitRegistry {
        &self.inner.circuits
    }

    pub fn stages(&self) -> StageToggles {
        self.inner.stages
    }

    pub fn stats(&self) -> PipelineStats {
        self.inner.counters.snapshot()
    }

    async fn run_with_fallbacks(
        &self,
        primary: Arc<dyn Fetcher>,
        request: &FetchRequest,
    ) -> Result<Served, CallError> {
        let primary_error = match self.run_fetcher(Arc::clone(&primary), request).await {
            Ok((lookup, cache_key)) => {
                return Ok(Served {
                    lookup,
                    cache_key,
                    fetcher: primary,
                    fallback_for: None,
                })
            }
            Err(error) if error.kind() == CallErrorKind::Validation => return Err(error),
            Err(error) => error,
        };

        let chain = self.inner.fallbacks.for_resource(primary.resource_key());
        if chain.is_empty() {
            return Err(primary_error);
        }
        warn!(
            fetcher = primary.name(),
            resource_key = primary.resource_key(),
            error = %primary_error,
            fallbacks = chain.len(),
            "primary fetcher failed, trying fallbacks"
        );

        for (index, fallback) in chain.into_iter().enumerate() {
            match self.run_fetcher(Arc::clone(&fallback), request).await {
                Ok((lookup, cache_key)) => {
                    info!(fetcher = fallback.name(), fallback_index = index, "fallback succeeded");
                    PipelineCounters::bump(&self.inner.counters.fallbacks_served);
                    return Ok(Served {
                        lookup,
                        cache_key,
                        fetcher: fallback,
                        fallback_for: Some(primary.name().to_owned()),
                    });
                }
                Err(error) => {
                    warn!(
                        fetcher = fallback.name(),
                        fallback_index = index,
                        error = %error,
                        "fallback failed"
                    );
                }
            }
        }

        warn!(resource_key = primary.resource_key(), "all fallbacks failed");
        Err(primary_error)
    }

    async fn run_fetcher(
        &self,
        fetcher: Arc<dyn Fetcher>,
        request: &FetchRequest,
    ) -> Result<(CacheLookup, CacheKey), CallError> {
        let target = CallTarget {
            resource_key: fetcher.resource_key().to_owned(),
            operation: request.operation.clone(),
        };
        let cache_key = match request.cache_key(fetcher.name()) {
            Ok(key) => key,
            Err(error) => {
                PipelineCounters::bump(&self.inner.counters.calls);
                let error = CallError::validation(&target.resource_key, &target.operation, &error);
                self.inner.counters.record(&Err(error.clone()));
                return Err(error);
            }
        };
        let ttl = request.ttl.unwrap_or(self.inner.default_ttl);

        let shared_request = Arc::new(request.clone());
        let operation = move || {
            let fetcher = Arc::clone(&fetcher);
            let request = Arc::clone(&shared_request);
            async move { fetcher.fetch(&request).await }
        };

        let lookup = self.run(target, &cache_key, ttl, operation).await?;
        Ok((lookup, cache_key))
    }

    async fn run<F, Fut>(
        &self,
        target: CallTarget,
        cache_key: &CacheKey,
        ttl: Duration,
        operation: F,
    ) -> Result<CacheLookup, CallError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Payload, FetchError>> + Send + 'static,
    {
        let counters = &self.inner.counters;
        PipelineCounters::bump(&counters.calls);

        if target.resource_key.trim().is_empty() {
            let error = CallError::validation(
                &target.resource_key,
                &target.operation,
                &ValidationError::EmptyResourceKey,
            );
            counters.record(&Err(error.clone()));
            return Err(error);
        }

        let span = info_span!(
            "pipeline.call",
            resource_key = %target.resource_key,
            cache_key = %cache_key,
        );
        let mode = if self.inner.stages.cache {
            CacheMode::Use
        } else {
            CacheMode::Bypass
        };
        let inner = Arc::clone(&self.inner);

        let outcome = self
            .inner
            .cache
            .fetch_with_mode(cache_key.as_str(), ttl, mode, move || async move {
                inner.call_upstream(&target, operation).await
            })
            .instrument(span)
            .await;

        counters.record(&outcome);
        outcome
    }
}

impl Inner {
    async fn call_upstream<F, Fut>(&self, target: &CallTarget, operation: F) -> Result<Payload, CallError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Payload, FetchError>> + Send + 'static,
    {
        let breaker = self
            .stages
            .circuit_breaker
            .then(|| self.circuits.get(&target.resource_key));
        let mut permit = match &breaker {
            Some(breaker) => Some(breaker.try_acquire().ok_or_else(|| {
                target.error(CallErrorKind::CircuitOpen, "circuit is open; call rejected")
            })?),
            None => None,
        };

        if self.stages.rate_limit
            && !self
                .limiter
                .acquire_blocking(&target.resource_key, 1, self.max_wait)
                .await
        {
            return Err(target.error(
                CallErrorKind::RateLimited,
                format!("no rate budget within {} ms", self.max_wait.as_millis()),
            ));
        }

        let policy = if self.stages.retry {
            self.retry
        } else {
            RetryPolicy::disabled()
        };
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            PipelineCounters::bump(&self.counters.attempts);

            let error = match tokio::time::timeout(self.call_timeout, operation()).await {
                Ok(Ok(payload)) => {
                    settle(permit.take(), Settlement::Success);
                    debug!(attempts, "upstream call succeeded");
                    return Ok(payload);
                }
                Ok(Err(error)) => error,
                Err(_) => FetchError::timeout(format!(
                    "attempt exceeded {} ms deadline",
                    self.call_timeout.as_millis()
                )),
            };

            if error.kind() == FetchErrorKind::InvalidRequest {
                settle(permit.take(), Settlement::Neutral);
                return Err(target
                    .error(CallErrorKind::Validation, error.message())
                    .with_attempts(attempts)
                    .with_cause(error));
            }
            settle(permit.take(), Settlement::Failure);

            if !error.retryable() || !policy.allows_another(attempts) {
                warn!(attempts, error = %error, "upstream call failed");
                return Err(target
                    .error(
                        CallErrorKind::RetriesExhausted,
                        format!("upstream failed after {attempts} attempt(s)"),
                    )
                    .with_attempts(attempts)
                    .with_cause(error));
            }

            let delay = policy.compute_delay(attempts - 1);
            debug!(
                attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "retrying upstream call"
            );
            PipelineCounters::bump(&self.counters.retries);
            tokio::time::sleep(delay).await;

            if let Some(breaker) = &breaker {
                match breaker.try_acquire() {
                    Some(next) => permit = Some(next),
                    None => {
                        return Err(target
                            .error(
                                CallErrorKind::CircuitOpen,
                                "circuit opened during retries",
                            )
                            .with_attempts(attempts)
                            .with_cause(error));
                    }
                }
            }
        }
    }
}

/// A fetcher call's outcome and the fetcher that produced it.
struct Served {
    lookup: CacheLookup,
    cache_key: CacheKey,
    fetcher: Arc<dyn Fetcher>,
    /// Name of the failed primary when a fallback answered.
    fallback_for: Option<String>,
}

enum Settlement {
    Success,
    Failure,
    Neutral,
}

fn settle(permit: Option<CircuitPermit>, settlement: Settlement) {
    let Some(permit) = permit else {
        return;
    };
    match settlement {
        Settlement::Success => permit.record_success(),
        Settlement::Failure => permit.record_failure(),
        Settlement::Neutral => permit.release(),
    }
}

/// Builder for [`ResilientPipeline`].
///
/// ```rust,ignore
/// use std::time::Duration;
/// use pubdata_core::{ResilientPipeline, RetryPolicy};
///
/// let pipeline = ResilientPipeline::builder()
///     .with_retry(RetryPolicy::new(5, Duration::from_millis(100), Duration::from_secs(2)))
///     .with_call_timeout(Duration::from_secs(10))
///     .build();
/// ```
#[derive(Debug)]
pub struct PipelineBuilder {
    default_ttl: Duration,
    cache_max_size: usize,
    distributed: Option<DistributedCache>,
    bucket: BucketConfig,
    policies: Vec<ResourcePolicy>,
    max_wait: Duration,
    circuit_breaker: CircuitBreakerConfig,
    circuit_overrides: Vec<(String, CircuitBreakerConfig)>,
    retry: RetryPolicy,
    call_timeout: Duration,
    bands: FreshnessBands,
    stages: StageToggles,
    fallbacks: FallbackChains,
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineBuilder {
    pub fn new() -> Self {
        let config = CoreConfig::default();
        Self {
            default_ttl: config.cache.default_ttl(),
            cache_max_size: config.cache.max_size,
            distributed: None,
            bucket: config.rate_limit.bucket(),
            policies: Vec::new(),
            max_wait: config.rate_limit.max_wait(),
            circuit_breaker: config.circuit_breaker.config(),
            circuit_overrides: Vec::new(),
            retry: config.retry.policy(),
            call_timeout: config.pipeline.call_timeout(),
            bands: config.quality.bands(),
            stages: StageToggles::default(),
            fallbacks: FallbackChains::default(),
        }
    }

    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn with_cache_max_size(mut self, max_size: usize) -> Self {
        self.cache_max_size = max_size;
        self
    }

    pub fn with_distributed(mut self, tier: DistributedCache) -> Self {
        self.distributed = Some(tier);
        self
    }

    pub fn with_rate_limit(mut self, bucket: BucketConfig) -> Self {
        self.bucket = bucket;
        self
    }

    pub fn with_resource_policy(mut self, policy: ResourcePolicy) -> Self {
        self.policies.push(policy);
        self
    }

    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    pub fn with_circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = config;
        self
    }

    pub fn with_circuit_override(
        mut self,
        resource_key: impl Into<String>,
        config: CircuitBreakerConfig,
    ) -> Self {
        self.circuit_overrides.push((resource_key.into(), config));
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_freshness_bands(mut self, bands: FreshnessBands) -> Self {
        self.bands = bands;
        self
    }

    pub fn with_stages(mut self, stages: StageToggles) -> Self {
        self.stages = stages;
        self
    }

    /// See [`ResilientPipeline::register_fallback`].
    pub fn with_fallback(self, resource_key: impl Into<String>, fallback: Arc<dyn Fetcher>) -> Self {
        self.fallbacks.push(resource_key.into(), fallback);
        self
    }

    pub fn build(self) -> ResilientPipeline {
        let circuits = self
            .circuit_overrides
            .into_iter()
            .fold(CircuitRegistry::new(self.circuit_breaker), |registry, (key, config)| {
                registry.with_override(key, config)
            });

        ResilientPipeline {
            inner: Arc::new(Inner {
                cache: CacheManager::new(LocalCache::new(self.cache_max_size), self.distributed),
                limiter: RateLimiter::new(self.bucket).with_policies(&self.policies),
                circuits,
                retry: self.retry,
                quality: QualityValidator::new(self.bands),
                stages: self.stages,
                max_wait: self.max_wait,
                call_timeout: self.call_timeout,
                default_ttl: self.default_ttl,
                fallbacks: self.fallbacks,
                counters: PipelineCounters::default(),
            }),
        }
    }
}
