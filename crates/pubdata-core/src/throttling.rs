//! Per-resource token buckets.
//!
//! Buckets are created lazily, refilled lazily from elapsed time on every
//! acquisition and kept in a sharded map so that traffic for one upstream never
//! contends with another.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::time::Instant;
use tracing::debug;

use crate::resource_policy::ResourcePolicy;

const INITIAL_WAIT: Duration = Duration::from_millis(10);
const MAX_WAIT: Duration = Duration::from_millis(200);
const MIN_WAIT: Duration = Duration::from_millis(1);

/// Shape of a token bucket: `capacity` tokens per `window`, plus an optional
/// burst allowance above steady state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketConfig {
    pub capacity: u32,
    pub window: Duration,
    pub burst_limit: u32,
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self {
            capacity: 60,
            window: Duration::from_secs(60),
            burst_limit: 10,
        }
    }
}

impl BucketConfig {
    pub fn new(capacity: u32, window: Duration) -> Self {
        Self {
            capacity,
            window,
            burst_limit: 0,
        }
    }

    pub fn with_burst(mut self, burst_limit: u32) -> Self {
        self.burst_limit = burst_limit;
        self
    }

    /// Highest balance a bucket can hold.
    pub fn ceiling(&self) -> f64 {
        f64::from(self.capacity) + f64::from(self.burst_limit)
    }

    /// Tokens added per second of elapsed time.
    pub fn refill_per_sec(&self) -> f64 {
        f64::from(self.capacity) / self.window.as_secs_f64().max(f64::EPSILON)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct TokenBucket {
    config: BucketConfig,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub(crate) fn new(config: BucketConfig, now: Instant) -> Self {
        Self {
            config,
            tokens: config.ceiling(),
            last_refill: now,
        }
    }

    pub(crate) fn tokens(&self) -> f64 {
        self.tokens
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        if elapsed.is_zero() {
            return;
        }
        let window = self.config.window.as_secs_f64().max(f64::EPSILON);
        let added = elapsed.as_secs_f64() * f64::from(self.config.capacity) / window;
        self.tokens = (self.tokens + added).min(self.config.ceiling());
        self.last_refill = now;
    }

    /// Takes `cost` tokens or reports how long until they could be available.
    /// `Duration::MAX` means the cost exceeds the ceiling and never fits.
    pub(crate) fn take(&mut self, cost: f64, now: Instant) -> Result<(), Duration> {
        self.refill(now);
        if cost > self.config.ceiling() {
            return Err(Duration::MAX);
        }
        if self.tokens >= cost {
            self.tokens -= cost;
            return Ok(());
        }

        let rate = self.config.refill_per_sec();
        if rate <= 0.0 {
            return Err(Duration::MAX);
        }
        Err(Duration::from_secs_f64((cost - self.tokens) / rate).max(MIN_WAIT))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RateLimiterStats {
    pub buckets: usize,
    pub granted: u64,
    pub rejected: u64,
}

/// Token-bucket rate limiter keyed by upstream resource.
#[derive(Debug)]
pub struct RateLimiter {
    buckets: DashMap<String, TokenBucket>,
    default: BucketConfig,
    overrides: HashMap<String, BucketConfig>,
    granted: AtomicU64,
    rejected: AtomicU64,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(BucketConfig::default())
    }
}

impl RateLimiter {
    pub fn new(default: BucketConfig) -> Self {
        Self {
            buckets: DashMap::new(),
            default,
            overrides: HashMap::new(),
            granted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    pub fn with_policy(mut self, policy: &ResourcePolicy) -> Self {
        self.overrides
            .insert(policy.resource_key.clone(), policy.bucket());
        self
    }

    pub fn with_policies<'a>(self, policies: impl IntoIterator<Item = &'a ResourcePolicy>) -> Self {
        policies
            .into_iter()
            .fold(self, |limiter, policy| limiter.with_policy(policy))
    }

    pub fn config_for(&self, resource_key: &str) -> BucketConfig {
        self.overrides
            .get(resource_key)
            .copied()
            .unwrap_or(self.default)
    }

    /// Non-blocking acquisition. A refusal leaves the balance untouched.
    pub fn try_acquire(&self, resource_key: &str, cost: u32) -> bool {
        let granted = self.take(resource_key, cost, Instant::now()).is_ok();
        self.count(resource_key, cost, granted);
        granted
    }

    /// Waits up to `timeout` for `cost` tokens.
    ///
    /// Sleeps start at 10ms and double up to 200ms, never past the deadline.
    /// Fails without sleeping when the tokens cannot accrue before the deadline.
    /// Dropping the returned future mid-wait leaves the bucket untouched.
    pub async fn acquire_blocking(&self, resource_key: &str, cost: u32, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut backoff = INITIAL_WAIT;

        loop {
            let now = Instant::now();
            let refill_in = match self.take(resource_key, cost, now) {
                Ok(()) => {
                    self.count(resource_key, cost, true);
                    return true;
                }
                Err(refill_in) => refill_in,
            };

            let remaining = deadline.saturating_duration_since(now);
            if refill_in > remaining {
                self.count(resource_key, cost, false);
                return false;
            }

            tokio::time::sleep(backoff.min(refill_in).min(remaining)).await;
            backoff = (backoff * 2).min(MAX_WAIT);
        }
    }

    /// Current balance after refill. Unknown keys report a full bucket.
    pub fn available(&self, resource_key: &str) -> f64 {
        match self.buckets.get_mut(resource_key) {
            Some(mut bucket) => {
                bucket.refill(Instant::now());
                bucket.tokens()
            }
            None => self.config_for(resource_key).ceiling(),
        }
    }

    pub fn stats(&self) -> RateLimiterStats {
        RateLimiterStats {
            buckets: self.buckets.len(),
            granted: self.granted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }

    fn take(&self, resource_key: &str, cost: u32, now: Instant) -> Result<(), Duration> {
        if let Some(mut bucket) = self.buckets.get_mut(resource_key) {
            return bucket.take(f64::from(cost), now);
        }
        self.buckets
            .entry(resource_key.to_owned())
            .or_insert_with(|| TokenBucket::new(self.config_for(resource_key), now))
            .take(f64::from(cost), now)
    }

    fn count(&self, resource_key: &str, cost: u32, granted: bool) {
        if granted {
            self.granted.fetch_add(1, Ordering::Relaxed);
        } else {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            debug!(resource_key, cost, "rate limit budget exhausted");
        }
    }
}
