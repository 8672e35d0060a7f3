//! Upstream health checks and the rollup reported in metrics snapshots.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use time::OffsetDateTime;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Share of healthy services at or above which the system is healthy.
pub const HEALTHY_PERCENTAGE: f64 = 80.0;
/// Share of healthy services at or above which the system is degraded.
pub const DEGRADED_PERCENTAGE: f64 = 50.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallStatus {
    Healthy,
    Degraded,
    Unhealthy,
    /// No service has been checked yet.
    Unknown,
}

/// Outcome of the latest check for one service.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthRecord {
    pub status: HealthStatus,
    pub response_time_ms: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub last_check: OffsetDateTime,
    pub error: Option<String>,
}

impl HealthRecord {
    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OverallHealth {
    pub status: OverallStatus,
    pub health_percentage: f64,
    pub healthy_services: usize,
    pub total_services: usize,
    pub services: BTreeMap<String, HealthRecord>,
}

/// Latest health record per service. Cheap to clone; clones share state.
#[derive(Debug, Clone, Default)]
pub struct HealthRegistry {
    services: Arc<DashMap<String, HealthRecord>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `check` for `service` and records how it went. Any `Err` marks
    /// the service unhealthy, with the error's text kept on the record.
    pub async fn check<F, Fut, T, E>(&self, service: &str, check: F) -> HealthRecord
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let started = Instant::now();
        let outcome = check().await;
        let response_time_ms = started.elapsed().as_millis() as u64;

        let record = match outcome {
            Ok(_) => {
                debug!(service, response_time_ms, "health check passed");
                HealthRecord {
                    status: HealthStatus::Healthy,
                    response_time_ms,
                    last_check: OffsetDateTime::now_utc(),
                    error: None,
                }
            }
            Err(err) => {
                warn!(service, response_time_ms, error = %err, "health check failed");
                HealthRecord {
                    status: HealthStatus::Unhealthy,
                    response_time_ms,
                    last_check: OffsetDateTime::now_utc(),
                    error: Some(err.to_string()),
                }
            }
        };

        self.services.insert(service.to_owned(), record.clone());
        record
    }

    pub fn get(&self, service: &str) -> Option<HealthRecord> {
        self.services.get(service).map(|record| record.value().clone())
    }

    pub fn overall(&self) -> OverallHealth {
        let services: BTreeMap<String, HealthRecord> = self
            .services
            .iter()
            .map(|record| (record.key().clone(), record.value().clone()))
            .collect();
        let total_services = services.len();
        if total_services == 0 {
            return OverallHealth {
                status: OverallStatus::Unknown,
                health_percentage: 0.0,
                healthy_services: 0,
                total_services,
                services,
            };
        }

        let healthy_services = services.values().filter(|record| record.is_healthy()).count();
        let health_percentage = healthy_services as f64 / total_services as f64 * 100.0;
        let status = if health_percentage >= HEALTHY_PERCENTAGE {
            OverallStatus::Healthy
        } else if health_percentage >= DEGRADED_PERCENTAGE {
            OverallStatus::Degraded
        } else {
            OverallStatus::Unhealthy
        };

        OverallHealth {
            status,
            health_percentage,
            healthy_services,
            total_services,
            services,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn record(registry: &HealthRegistry, service: &str, healthy: bool) {
        registry
            .check(service, || async move {
                if healthy {
                    Ok(())
                } else {
                    Err("connection refused")
                }
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn check_records_status_latency_and_error() {
        let registry = HealthRegistry::new();

        let up = registry
            .check("api.nasa.gov", || async {
                tokio::time::sleep(Duration::from_millis(120)).await;
                Ok::<_, String>(())
            })
            .await;
        let down = registry
            .check("api.github.com", || async { Err::<(), _>("503 service unavailable") })
            .await;

        assert_eq!(up.status, HealthStatus::Healthy);
        assert_eq!(up.response_time_ms, 120);
        assert_eq!(up.error, None);
        assert_eq!(down.status, HealthStatus::Unhealthy);
        assert_eq!(down.error.as_deref(), Some("503 service unavailable"));
        assert_eq!(registry.get("api.github.com"), Some(down));
    }

    #[test]
    fn nothing_checked_is_unknown() {
        let overall = HealthRegistry::new().overall();

        assert_eq!(overall.status, OverallStatus::Unknown);
        assert_eq!(overall.total_services, 0);
        assert!(overall.services.is_empty());
    }

    #[tokio::test]
    async fn overall_status_follows_the_healthy_share() {
        let registry = HealthRegistry::new();
        for (index, healthy) in [true, true, true, true, false].into_iter().enumerate() {
            record(&registry, &format!("service-{index}"), healthy).await;
        }
        let overall = registry.overall();
        assert_eq!(overall.status, OverallStatus::Healthy);
        assert_eq!((overall.healthy_services, overall.total_services), (4, 5));
        assert!((overall.health_percentage - 80.0).abs() < f64::EPSILON);

        record(&registry, "service-0", false).await;
        record(&registry, "service-1", false).await;
        assert_eq!(registry.overall().status, OverallStatus::Degraded);

        record(&registry, "service-2", false).await;
        let overall = registry.overall();
        assert_eq!(overall.status, OverallStatus::Unhealthy);
        assert_eq!(overall.healthy_services, 1);
    }

    #[tokio::test]
    async fn latest_check_replaces_the_previous_record() {
        let registry = HealthRegistry::new();
        record(&registry, "api.weather.gov", false).await;
        record(&registry, "api.weather.gov", true).await;

        let overall = registry.overall();
        assert_eq!(overall.total_services, 1);
        assert_eq!(overall.status, OverallStatus::Healthy);
        assert!(overall.services["api.weather.gov"].is_healthy());
    }
}
