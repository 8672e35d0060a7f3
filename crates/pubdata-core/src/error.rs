use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::fetcher::FetchError;

/// Validation and contract errors exposed by `pubdata-core`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("adapter name cannot be empty")]
    EmptyAdapter,
    #[error("operation name cannot be empty")]
    EmptyOperation,
    #[error("argument name cannot be empty")]
    EmptyArgumentName,
    #[error("resource key cannot be empty")]
    EmptyResourceKey,
    #[error("cache key cannot be empty")]
    EmptyCacheKey,

    #[error("field '{field}' must be greater than zero")]
    NotPositive { field: &'static str },
    #[error("field '{field}' must not exceed '{limit}'")]
    ExceedsLimit {
        field: &'static str,
        limit: &'static str,
    },
    #[error("freshness bands must increase within (0, 1]: excellent={excellent}, good={good}, fair={fair}")]
    InvalidFreshnessBands {
        excellent: String,
        good: String,
        fair: String,
    },

    #[error("invalid log format '{value}', expected one of pretty, json")]
    InvalidLogFormat { value: String },
}

/// Errors raised while loading configuration or installing the subscriber.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {}", join_errors(.0))]
    Invalid(Vec<ValidationError>),

    #[error("failed to install tracing subscriber: {0}")]
    Tracing(String),
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Distributed cache tier failure. Always absorbed by the cache manager.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CacheBackendError {
    #[error("distributed cache unavailable: {0}")]
    Unavailable(String),
    #[error("distributed cache operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("distributed cache entry is malformed: {0}")]
    Codec(String),
}

/// The four failure kinds that cross the pipeline boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallErrorKind {
    Validation,
    RateLimited,
    CircuitOpen,
    RetriesExhausted,
}

impl CallErrorKind {
    pub const ALL: [Self; 4] = [
        Self::Validation,
        Self::RateLimited,
        Self::CircuitOpen,
        Self::RetriesExhausted,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::RateLimited => "rate_limited",
            Self::CircuitOpen => "circuit_open",
            Self::RetriesExhausted => "retries_exhausted",
        }
    }

    pub const fn code(self) -> &'static str {
        match self {
            Self::Validation => "call.validation",
            Self::RateLimited => "call.rate_limited",
            Self::CircuitOpen => "call.circuit_open",
            Self::RetriesExhausted => "call.retries_exhausted",
        }
    }
}

impl Display for CallErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured error returned by the resilient call pipeline.
///
/// `Clone` so that a single-flight failure can be handed to every waiter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} calling '{resource_key}' ({operation}) after {attempts} attempt(s): {message}")]
pub struct CallError {
    kind: CallErrorKind,
    resource_key: String,
    operation: String,
    attempts: u32,
    message: String,
    #[source]
    cause: Option<FetchError>,
}

impl CallError {
    pub fn new(
        kind: CallErrorKind,
        resource_key: impl Into<String>,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            resource_key: resource_key.into(),
            operation: operation.into(),
            attempts: 0,
            message: message.into(),
            cause: None,
        }
    }

    pub fn validation(
        resource_key: impl Into<String>,
        operation: impl Into<String>,
        error: &ValidationError,
    ) -> Self {
        Self::new(
            CallErrorKind::Validation,
            resource_key,
            operation,
            error.to_string(),
        )
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn with_cause(mut self, cause: FetchError) -> Self {
        self.cause = Some(cause);
        self
    }

    pub const fn kind(&self) -> CallErrorKind {
        self.kind
    }

    pub fn resource_key(&self) -> &str {
        &self.resource_key
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn cause(&self) -> Option<&FetchError> {
        self.cause.as_ref()
    }

    pub const fn code(&self) -> &'static str {
        self.kind.code()
    }
}
