//! Fetcher capability and the classified failures it reports.
//!
//! Adapters (financial, government, scientific, news, geographic, technology)
//! live outside this crate. The pipeline only sees them through [`Fetcher`],
//! which turns a [`FetchRequest`] into a JSON [`Payload`] or a [`FetchError`]
//! that says whether the failure is worth retrying.
//!
//! # Example
//!
//! ```rust,ignore
//! use pubdata_core::{FetchFuture, FetchRequest, Fetcher};
//!
//! struct CoinGecko;
//!
//! impl Fetcher for CoinGecko {
//!     fn name(&self) -> &str {
//!         "financial"
//!     }
//!
//!     fn resource_key(&self) -> &str {
//!         "api.coingecko.com"
//!     }
//!
//!     fn fetch<'a>(&'a self, request: &'a FetchRequest) -> FetchFuture<'a> {
//!         Box::pin(async move { Ok(serde_json::json!({ "op": request.operation })) })
//!     }
//! }
//! ```

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache_key::CacheKey;
use crate::error::ValidationError;
use crate::quality::DeclaredSchema;
use crate::retry::is_retryable_status;

/// Opaque payload produced by adapters.
pub type Payload = serde_json::Value;

/// Boxed future returned by [`Fetcher::fetch`].
pub type FetchFuture<'a> = Pin<Box<dyn Future<Output = Result<Payload, FetchError>> + Send + 'a>>;

/// Fetch failure classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchErrorKind {
    InvalidRequest,
    Network,
    Timeout,
    RateLimited,
    Upstream,
    Decode,
    Internal,
}

impl FetchErrorKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidRequest => "invalid_request",
            Self::Network => "network",
            Self::Timeout => "timeout",
            Self::RateLimited => "rate_limited",
            Self::Upstream => "upstream",
            Self::Decode => "decode",
            Self::Internal => "internal",
        }
    }
}

impl Display for FetchErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured failure reported by a fetcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchError {
    kind: FetchErrorKind,
    message: String,
    retryable: bool,
    status: Option<u16>,
}

impl FetchError {
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(FetchErrorKind::InvalidRequest, message, false)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(FetchErrorKind::Network, message, true)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(FetchErrorKind::Timeout, message, true)
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(FetchErrorKind::RateLimited, message, true).with_status(429)
    }

    pub fn upstream(message: impl Into<String>) -> Self {
        Self::new(FetchErrorKind::Upstream, message, true)
    }

    pub fn decode(message: impl Into<String>) -> Self {
        Self::new(FetchErrorKind::Decode, message, false)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(FetchErrorKind::Internal, message, false)
    }

    /// Classifies a non-success HTTP status code.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let error = match status {
            429 => Self::rate_limited(message),
            408 => Self::timeout(message),
            400..=499 => Self::invalid_request(message),
            _ => Self::new(FetchErrorKind::Upstream, message, is_retryable_status(status)),
        };
        error.with_status(status)
    }

    fn new(kind: FetchErrorKind, message: impl Into<String>, retryable: bool) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable,
            status: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub const fn kind(&self) -> FetchErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub const fn retryable(&self) -> bool {
        self.retryable
    }

    pub const fn status(&self) -> Option<u16> {
        self.status
    }

    pub const fn code(&self) -> &'static str {
        match self.kind {
            FetchErrorKind::InvalidRequest => "fetch.invalid_request",
            FetchErrorKind::Network => "fetch.network",
            FetchErrorKind::Timeout => "fetch.timeout",
            FetchErrorKind::RateLimited => "fetch.rate_limited",
            FetchErrorKind::Upstream => "fetch.upstream",
            FetchErrorKind::Decode => "fetch.decode",
            FetchErrorKind::Internal => "fetch.internal",
        }
    }
}

impl Display for FetchError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.status {
            Some(status) => write!(f, "{} (HTTP {status}, {})", self.message, self.code()),
            None => write!(f, "{} ({})", self.message, self.code()),
        }
    }
}

impl std::error::Error for FetchError {}

/// One adapter operation with its arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchRequest {
    pub operation: String,
    pub args: BTreeMap<String, String>,
    /// Overrides the pipeline's default TTL when set.
    pub ttl: Option<Duration>,
    /// Fields the adapter promises; enables quality scoring.
    pub schema: Option<DeclaredSchema>,
}

impl FetchRequest {
    pub fn new(operation: impl Into<String>) -> Result<Self, ValidationError> {
        let operation = operation.into();
        if operation.trim().is_empty() {
            return Err(ValidationError::EmptyOperation);
        }
        Ok(Self {
            operation,
            args: BTreeMap::new(),
            ttl: None,
            schema: None,
        })
    }

    pub fn with_arg(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.args.insert(name.into(), value.to_string());
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_schema(mut self, schema: DeclaredSchema) -> Self {
        self.schema = Some(schema);
        self
    }

    /// Cache key for this request as issued by `adapter`.
    pub fn cache_key(&self, adapter: &str) -> Result<CacheKey, ValidationError> {
        self.args
            .iter()
            .fold(CacheKey::builder(adapter, &self.operation), |builder, (name, value)| {
                builder.arg(name, value)
            })
            .build()
    }
}

/// Adapter capability consumed by the pipeline.
///
/// Implementations must be `Send + Sync`; a single fetcher is shared by every
/// concurrent call path that targets its upstream.
pub trait Fetcher: Send + Sync {
    /// Adapter name, used as the first cache key component.
    fn name(&self) -> &str;

    /// Upstream dependency key shared by rate limiting and circuit breaking.
    fn resource_key(&self) -> &str;

    /// Performs one upstream call.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError`] classified so the pipeline can decide whether the
    /// call is worth another attempt.
    fn fetch<'a>(&'a self, request: &'a FetchRequest) -> FetchFuture<'a>;
}
