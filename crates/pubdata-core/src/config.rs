//! Configuration schema and loading.
//!
//! Every section and field has a default, so an empty document is a valid
//! configuration. Semantic checks run after parsing and report every problem
//! at once.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::error::{ConfigError, ValidationError};
use crate::quality::FreshnessBands;
use crate::resource_policy::ResourcePolicy;
use crate::retry::{Jitter, RetryPolicy};
use crate::throttling::BucketConfig;

/// Root configuration for the resilience core.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct CoreConfig {
    pub cache: CacheSection,
    pub rate_limit: RateLimitSection,
    pub circuit_breaker: CircuitBreakerSection,
    pub retry: RetrySection,
    pub pipeline: PipelineSection,
    pub quality: QualitySection,
    pub logging: LoggingSection,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheSection {
    pub enabled: bool,
    pub default_ttl_secs: u64,
    pub max_size: usize,
    /// Use the distributed tier when the embedding process provides a store.
    pub distributed_enabled: bool,
    pub distributed_timeout_ms: u64,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            enabled: true,
            default_ttl_secs: 300,
            max_size: 1_000,
            distributed_enabled: false,
            distributed_timeout_ms: 250,
        }
    }
}

impl CacheSection {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    pub fn distributed_timeout(&self) -> Duration {
        Duration::from_millis(self.distributed_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitSection {
    pub enabled: bool,
    pub requests_per_window: u32,
    pub window_secs: u64,
    pub burst_limit: u32,
    /// Longest a call waits for a token before failing as rate limited.
    pub max_wait_ms: u64,
    pub overrides: Vec<RateLimitOverride>,
}

impl Default for RateLimitSection {
    fn default() -> Self {
        Self {
            enabled: true,
            requests_per_window: 60,
            window_secs: 60,
            burst_limit: 10,
            max_wait_ms: 5_000,
            overrides: Vec::new(),
        }
    }
}

impl RateLimitSection {
    pub fn bucket(&self) -> BucketConfig {
        BucketConfig::new(self.requests_per_window, Duration::from_secs(self.window_secs))
            .with_burst(self.burst_limit)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }

    pub fn policies(&self) -> Vec<ResourcePolicy> {
        self.overrides.iter().map(RateLimitOverride::policy).collect()
    }
}

/// Per-resource rate budget.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RateLimitOverride {
    pub resource_key: String,
    pub requests_per_window: u32,
    pub window_secs: u64,
    #[serde(default)]
    pub burst_limit: u32,
}

impl RateLimitOverride {
    pub fn policy(&self) -> ResourcePolicy {
        ResourcePolicy::new(
            self.resource_key.clone(),
            self.requests_per_window,
            Duration::from_secs(self.window_secs),
        )
        .with_burst(self.burst_limit)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct CircuitBreakerSection {
    pub enabled: bool,
    pub failure_threshold: u32,
    pub recovery_timeout_secs: u64,
    pub failure_window_secs: u64,
}

impl Default for CircuitBreakerSection {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 5,
            recovery_timeout_secs: 60,
            failure_window_secs: 60,
        }
    }
}

impl CircuitBreakerSection {
    pub fn config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            recovery_timeout: Duration::from_secs(self.recovery_timeout_secs),
            failure_window: Duration::from_secs(self.failure_window_secs),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RetrySection {
    pub enabled: bool,
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: bool,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            jitter: true,
        }
    }
}

impl RetrySection {
    /// The configured schedule, or a single attempt when disabled.
    pub fn policy(&self) -> RetryPolicy {
        if !self.enabled {
            return RetryPolicy::disabled();
        }
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
        )
        .with_jitter(if self.jitter { Jitter::Full } else { Jitter::None })
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct PipelineSection {
    /// Deadline for a single upstream attempt.
    pub call_timeout_ms: u64,
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            call_timeout_ms: 30_000,
        }
    }
}

impl PipelineSection {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct QualitySection {
    pub enabled: bool,
    pub excellent_fraction: f64,
    pub good_fraction: f64,
    pub fair_fraction: f64,
}

impl Default for QualitySection {
    fn default() -> Self {
        let bands = FreshnessBands::default();
        Self {
            enabled: true,
            excellent_fraction: bands.excellent,
            good_fraction: bands.good,
            fair_fraction: bands.fair,
        }
    }
}

impl QualitySection {
    pub fn bands(&self) -> FreshnessBands {
        FreshnessBands {
            excellent: self.excellent_fraction,
            good: self.good_fraction,
            fair: self.fair_fraction,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Default filter directive; `RUST_LOG` takes precedence.
    pub level: String,
    pub format: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: String::from("info"),
            format: String::from("pretty"),
        }
    }
}

impl LoggingSection {
    pub fn log_format(&self) -> Result<LogFormat, ValidationError> {
        match self.format.to_ascii_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            _ => Err(ValidationError::InvalidLogFormat {
                value: self.format.clone(),
            }),
        }
    }
}

impl CoreConfig {
    /// Parses and validates a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate().map_err(ConfigError::Invalid)?;
        Ok(config)
    }

    /// Loads and validates a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Checks cross-field constraints, collecting every violation.
    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();
        let mut positive = |field: &'static str, value: u64| {
            if value == 0 {
                errors.push(ValidationError::NotPositive { field });
            }
        };

        positive("cache.max_size", self.cache.max_size as u64);
        positive("cache.default_ttl_secs", self.cache.default_ttl_secs);
        positive("cache.distributed_timeout_ms", self.cache.distributed_timeout_ms);
        positive(
            "rate_limit.requests_per_window",
            u64::from(self.rate_limit.requests_per_window),
        );
        positive("rate_limit.window_secs", self.rate_limit.window_secs);
        positive(
            "circuit_breaker.failure_threshold",
            u64::from(self.circuit_breaker.failure_threshold),
        );
        positive(
            "circuit_breaker.recovery_timeout_secs",
            self.circuit_breaker.recovery_timeout_secs,
        );
        positive(
            "circuit_breaker.failure_window_secs",
            self.circuit_breaker.failure_window_secs,
        );
        positive("retry.max_attempts", u64::from(self.retry.max_attempts));
        positive("pipeline.call_timeout_ms", self.pipeline.call_timeout_ms);

        for policy in &self.rate_limit.overrides {
            if policy.resource_key.trim().is_empty() {
                errors.push(ValidationError::EmptyResourceKey);
            }
            if policy.requests_per_window == 0 {
                errors.push(ValidationError::NotPositive {
                    field: "rate_limit.overrides.requests_per_window",
                });
            }
            if policy.window_secs == 0 {
                errors.push(ValidationError::NotPositive {
                    field: "rate_limit.overrides.window_secs",
                });
            }
        }

        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            errors.push(ValidationError::ExceedsLimit {
                field: "retry.base_delay_ms",
                limit: "retry.max_delay_ms",
            });
        }
        if let Err(error) = self.quality.bands().validate() {
            errors.push(error);
        }
        if let Err(error) = self.logging.log_format() {
            errors.push(error);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
