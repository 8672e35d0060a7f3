//! # Pubdata Core
//!
//! Caching and resilience layer shared by the pubdata public-API adapters.
//!
//! ## Overview
//!
//! Every upstream call made by an adapter goes through one pipeline:
//!
//! - **Cache** with stampede protection: concurrent misses on a key share one fetch
//! - **Optional distributed tier** behind the local cache, best effort only
//! - **Token-bucket rate limiter** keyed by upstream resource
//! - **Circuit breaker** per resource
//! - **Retry** with exponential backoff and full jitter
//! - **Quality scoring** of returned payloads
//! - **Fallbacks** to substitute fetchers when a primary fails
//! - **Metrics** snapshots across all of the above, plus upstream health
//!
//! ## Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`cache`] | Single-flight cache manager over local and distributed tiers |
//! | [`cache_key`] | Deterministic cache key construction |
//! | [`circuit_breaker`] | Per-resource circuit breakers and registry |
//! | [`config`] | TOML configuration with validation |
//! | [`distributed`] | Shared key-value tier contract |
//! | [`envelope`] | Response envelope with call metadata |
//! | [`error`] | Core error types |
//! | [`fetcher`] | Adapter fetch contract |
//! | [`health`] | Upstream health checks and overall rollup |
//! | [`json_http`] | Generic JSON-over-HTTP fetcher and its transport |
//! | [`local_cache`] | Bounded in-process TTL store |
//! | [`logging`] | Tracing subscriber setup |
//! | [`metrics`] | Stats aggregation and publishing |
//! | [`pipeline`] | Resilient call pipeline |
//! | [`quality`] | Payload completeness and freshness scoring |
//! | [`resource_policy`] | Per-resource quota presets |
//! | [`retry`] | Backoff policy and retryable status table |
//! | [`throttling`] | Token-bucket rate limiting |
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use pubdata_core::{FetchRequest, JsonFetcher, ReqwestTransport, ResilientPipeline};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let pipeline = ResilientPipeline::builder().build();
//!     let weather = JsonFetcher::new(
//!         "geographic",
//!         "api.weather.gov",
//!         "https://api.weather.gov",
//!         Arc::new(ReqwestTransport::new()),
//!     );
//!
//!     let request = FetchRequest::new("points/39.7456,-97.0892")?;
//!     let envelope = pipeline.execute_enveloped(Arc::new(weather), request).await?;
//!     println!("cached: {}", envelope.was_cached());
//!     Ok(())
//! }
//! ```
//!
//! ## Error Handling
//!
//! Pipeline calls fail with a [`CallError`] whose kind tells the caller what to do:
//!
//! ```rust
//! use pubdata_core::{CallError, CallErrorKind};
//!
//! fn handle_error(error: CallError) {
//!     match error.kind() {
//!         CallErrorKind::RateLimited | CallErrorKind::CircuitOpen => {
//!             // Back off and try later
//!         }
//!         CallErrorKind::Validation => {
//!             // Report to user
//!         }
//!         CallErrorKind::RetriesExhausted => {}
//!     }
//! }
//! ```

pub mod cache;
pub mod cache_key;
pub mod circuit_breaker;
pub mod config;
pub mod distributed;
pub mod envelope;
pub mod error;
pub mod fetcher;
pub mod health;
pub mod json_http;
pub mod local_cache;
pub mod logging;
pub mod metrics;
pub mod pipeline;
pub mod quality;
pub mod resource_policy;
pub mod retry;
pub mod throttling;

// Caching
pub use cache::{CacheLookup, CacheManager, CacheMode, CacheSource, CacheStats, WARM_RETRY_DELAY};
pub use cache_key::{CacheKey, CacheKeyBuilder};
pub use distributed::{DistributedCache, InMemoryStore, KeyValueStore};
pub use local_cache::{CacheEntry, LocalCache};

// Resilience
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitPermit, CircuitRegistry, CircuitState,
    CircuitStats,
};
pub use resource_policy::ResourcePolicy;
pub use retry::{is_retryable_status, Jitter, RetryPolicy};
pub use throttling::{BucketConfig, RateLimiter, RateLimiterStats};

// Pipeline
pub use envelope::{Envelope, EnvelopeMeta};
pub use pipeline::{PipelineBuilder, PipelineStats, ResilientPipeline, StageToggles};

// Adapter contract and transport
pub use fetcher::{FetchError, FetchErrorKind, FetchFuture, FetchRequest, Fetcher, Payload};
pub use json_http::{Credential, JsonFetcher, JsonGet, RawResponse, ReqwestTransport, Transport};

// Quality
pub use quality::{DeclaredSchema, FreshnessBands, QualityIssue, QualityScore, QualityValidator, Verdict};

// Configuration, logging and metrics
pub use config::{CoreConfig, LogFormat};
pub use logging::init_tracing;
pub use health::{HealthRecord, HealthRegistry, HealthStatus, OverallHealth, OverallStatus};
pub use metrics::{MetricsAggregator, MetricsSnapshot, StatsSource};

// Error types
pub use error::{CacheBackendError, CallError, CallErrorKind, ConfigError, ValidationError};
