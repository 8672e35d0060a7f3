use std::time::Duration;

use crate::throttling::BucketConfig;

/// Rate budget for one upstream resource, overriding the limiter default.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourcePolicy {
    pub resource_key: String,
    pub quota_window: Duration,
    pub quota_limit: u32,
    pub burst_limit: u32,
}

impl ResourcePolicy {
    pub fn new(resource_key: impl Into<String>, quota_limit: u32, quota_window: Duration) -> Self {
        Self {
            resource_key: resource_key.into(),
            quota_window,
            quota_limit,
            burst_limit: 0,
        }
    }

    pub fn with_burst(mut self, burst_limit: u32) -> Self {
        self.burst_limit = burst_limit;
        self
    }

    pub fn bucket(&self) -> BucketConfig {
        BucketConfig::new(self.quota_limit, self.quota_window).with_burst(self.burst_limit)
    }

    /// GitHub REST API without a token: 60 requests per hour.
    pub fn github_default() -> Self {
        Self::new("api.github.com", 60, Duration::from_secs(3_600))
    }

    /// CoinGecko public tier: roughly 30 calls per minute.
    pub fn coingecko_default() -> Self {
        Self::new("api.coingecko.com", 30, Duration::from_secs(60)).with_burst(5)
    }

    /// NewsAPI developer plan: 100 requests per day.
    pub fn newsapi_default() -> Self {
        Self::new("newsapi.org", 100, Duration::from_secs(86_400))
    }

    pub fn default_for(resource_key: &str) -> Option<Self> {
        match resource_key {
            "api.github.com" => Some(Self::github_default()),
            "api.coingecko.com" => Some(Self::coingecko_default()),
            "newsapi.org" => Some(Self::newsapi_default()),
            _ => None,
        }
    }
}
