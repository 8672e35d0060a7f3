//! Read-only aggregation of component counters.
//!
//! # Gauges
//! - `pubdata_cache_*`: hits, misses, hit ratio, entries, evictions, coalesced waiters
//! - `pubdata_rate_limit_*`: live buckets, granted and rejected acquisitions
//! - `pubdata_circuit_state{resource}`: 0 closed, 1 half-open, 2 open
//! - `pubdata_pipeline_*`: calls, successes and failures by kind
//! - `pubdata_health_*`: healthy percentage and per-service health (1 healthy, 0 not)
//!
//! Publishing goes through the `metrics` facade and is a no-op until the
//! embedding process installs a recorder.

use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;

use crate::cache::{CacheManager, CacheStats};
use crate::circuit_breaker::{CircuitRegistry, CircuitState, CircuitStats};
use crate::health::{HealthRegistry, OverallHealth};
use crate::pipeline::{PipelineStats, ResilientPipeline};
use crate::throttling::{RateLimiter, RateLimiterStats};

/// Everything the aggregator knows at one instant.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    #[serde(with = "time::serde::rfc3339")]
    pub taken_at: OffsetDateTime,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache: Option<CacheStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limiter: Option<RateLimiterStats>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub circuits: Vec<CircuitStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pipeline: Option<PipelineStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health: Option<OverallHealth>,
}

impl MetricsSnapshot {
    fn empty() -> Self {
        Self {
            taken_at: OffsetDateTime::now_utc(),
            cache: None,
            rate_limiter: None,
            circuits: Vec::new(),
            pipeline: None,
            health: None,
        }
    }
}

/// A component that can report its counters.
pub trait StatsSource: Send + Sync {
    fn contribute(&self, snapshot: &mut MetricsSnapshot);
}

impl<E> StatsSource for CacheManager<E>
where
    E: Clone + Send + Sync + 'static,
{
    fn contribute(&self, snapshot: &mut MetricsSnapshot) {
        snapshot.cache = Some(self.stats());
    }
}

impl StatsSource for RateLimiter {
    fn contribute(&self, snapshot: &mut MetricsSnapshot) {
        snapshot.rate_limiter = Some(self.stats());
    }
}

impl StatsSource for CircuitRegistry {
    fn contribute(&self, snapshot: &mut MetricsSnapshot) {
        snapshot.circuits = self.stats();
    }
}

impl StatsSource for ResilientPipeline {
    fn contribute(&self, snapshot: &mut MetricsSnapshot) {
        self.cache().contribute(snapshot);
        self.rate_limiter().contribute(snapshot);
        self.circuits().contribute(snapshot);
        snapshot.pipeline = Some(self.stats());
    }
}

impl StatsSource for HealthRegistry {
    fn contribute(&self, snapshot: &mut MetricsSnapshot) {
        snapshot.health = Some(self.overall());
    }
}

#[derive(Default, Clone)]
pub struct MetricsAggregator {
    sources: Vec<Arc<dyn StatsSource>>,
}

impl std::fmt::Debug for MetricsAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsAggregator")
            .field("sources", &self.sources.len())
            .finish()
    }
}

impl MetricsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_pipeline(pipeline: &ResilientPipeline) -> Self {
        Self::new().with_source(Arc::new(pipeline.clone()))
    }

    pub fn with_source(mut self, source: Arc<dyn StatsSource>) -> Self {
        self.sources.push(source);
        self
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut snapshot = MetricsSnapshot::empty();
        for source in &self.sources {
            source.contribute(&mut snapshot);
        }
        snapshot
    }

    /// Takes a snapshot and pushes it to the installed `metrics` recorder.
    pub fn publish(&self) -> MetricsSnapshot {
        let snapshot = self.snapshot();

        if let Some(cache) = &snapshot.cache {
            ::metrics::gauge!("pubdata_cache_hits").set(cache.hits as f64);
            ::metrics::gauge!("pubdata_cache_misses").set(cache.misses as f64);
            ::metrics::gauge!("pubdata_cache_hit_ratio").set(cache.hit_ratio);
            ::metrics::gauge!("pubdata_cache_entries").set(cache.entries as f64);
            ::metrics::gauge!("pubdata_cache_evictions").set(cache.evictions as f64);
            ::metrics::gauge!("pubdata_cache_coalesced").set(cache.coalesced as f64);
            ::metrics::gauge!("pubdata_cache_distributed_hits").set(cache.distributed_hits as f64);
            ::metrics::gauge!("pubdata_cache_backend_errors").set(cache.backend_errors as f64);
        }

        if let Some(limiter) = &snapshot.rate_limiter {
            ::metrics::gauge!("pubdata_rate_limit_buckets").set(limiter.buckets as f64);
            ::metrics::gauge!("pubdata_rate_limit_granted").set(limiter.granted as f64);
            ::metrics::gauge!("pubdata_rate_limit_rejected").set(limiter.rejected as f64);
        }

        for circuit in &snapshot.circuits {
            let state = match circuit.state {
                CircuitState::Closed => 0.0,
                CircuitState::HalfOpen => 1.0,
                CircuitState::Open => 2.0,
            };
            ::metrics::gauge!("pubdata_circuit_state", "resource" => circuit.key.clone()).set(state);
            ::metrics::gauge!("pubdata_circuit_failures", "resource" => circuit.key.clone())
                .set(f64::from(circuit.failure_count));
        }

        if let Some(pipeline) = &snapshot.pipeline {
            ::metrics::gauge!("pubdata_pipeline_calls").set(pipeline.calls as f64);
            ::metrics::gauge!("pubdata_pipeline_successes").set(pipeline.successes as f64);
            ::metrics::gauge!("pubdata_pipeline_retries").set(pipeline.retries as f64);
            ::metrics::gauge!("pubdata_pipeline_fallbacks_served").set(pipeline.fallbacks_served as f64);
            for (kind, count) in [
                ("validation", pipeline.validation_failures),
                ("rate_limited", pipeline.rate_limited),
                ("circuit_open", pipeline.circuit_open),
                ("retries_exhausted", pipeline.retries_exhausted),
            ] {
                ::metrics::gauge!("pubdata_pipeline_failures", "kind" => kind).set(count as f64);
            }
        }

        if let Some(health) = &snapshot.health {
            ::metrics::gauge!("pubdata_health_percentage").set(health.health_percentage);
            for (service, record) in &health.services {
                let healthy = if record.is_healthy() { 1.0 } else { 0.0 };
                ::metrics::gauge!("pubdata_service_healthy", "service" => service.clone()).set(healthy);
            }
        }

        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache_key::CacheKey;
    use crate::local_cache::LocalCache;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn pipeline_snapshot_covers_every_component() {
        let pipeline = ResilientPipeline::builder().build();
        let key = CacheKey::builder("geographic", "weather").build().unwrap();
        for _ in 0..2 {
            pipeline
                .execute("api.weather.gov", &key, Duration::from_secs(60), || async {
                    Ok(json!({ "temp_c": 12 }))
                })
                .await
                .unwrap();
        }

        let snapshot = MetricsAggregator::for_pipeline(&pipeline).publish();

        let cache = snapshot.cache.unwrap();
        assert_eq!((cache.hits, cache.misses), (1, 1));
        assert_eq!(snapshot.rate_limiter.unwrap().granted, 1);
        assert_eq!(snapshot.circuits.len(), 1);
        assert_eq!(snapshot.pipeline.unwrap().calls, 2);
    }

    #[tokio::test]
    async fn health_registry_reports_its_rollup() {
        let health = HealthRegistry::new();
        health.check("api.nasa.gov", || async { Ok::<_, String>(()) }).await;
        health.check("api.github.com", || async { Err::<(), _>("timeout") }).await;
        let aggregator = MetricsAggregator::new().with_source(Arc::new(health.clone()));

        let snapshot = aggregator.publish();

        let overall = snapshot.health.unwrap();
        assert_eq!(overall.status, crate::health::OverallStatus::Degraded);
        assert_eq!(overall.total_services, 2);
        assert!(snapshot.cache.is_none());
    }

    #[test]
    fn standalone_sources_serialize_only_what_they_report() {
        let cache: CacheManager<String> = CacheManager::new(LocalCache::new(8), None);
        let aggregator = MetricsAggregator::new().with_source(Arc::new(cache));

        let value = serde_json::to_value(aggregator.snapshot()).unwrap();

        assert_eq!(value["cache"]["max_size"], 8);
        assert!(value.get("pipeline").is_none());
        assert!(value.get("circuits").is_none());
        assert!(value.get("health").is_none());
    }
}
