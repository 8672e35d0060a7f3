//! Deterministic cache keys for adapter requests.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use sha2::{Digest, Sha256};

use crate::error::ValidationError;

/// Keys longer than this are compacted to a digest form.
pub const MAX_KEY_LEN: usize = 250;

/// Cache key derived from adapter name, operation and sorted arguments.
///
/// Every component is percent-encoded before joining, so two distinct
/// requests can never render to the same plain key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn builder(adapter: impl Into<String>, operation: impl Into<String>) -> CacheKeyBuilder {
        CacheKeyBuilder {
            adapter: adapter.into(),
            operation: operation.into(),
            args: BTreeMap::new(),
        }
    }

    /// Wraps a key produced elsewhere, such as by an adapter's own scheme.
    pub fn from_raw(raw: impl Into<String>) -> Result<Self, ValidationError> {
        let raw = raw.into();
        if raw.trim().is_empty() {
            return Err(ValidationError::EmptyCacheKey);
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The decoded operation component, or `None` for a raw key that does not
    /// follow the `adapter:operation:args` layout.
    pub fn operation(&self) -> Option<String> {
        let mut parts = self.0.splitn(3, ':');
        let (_adapter, operation) = (parts.next()?, parts.next()?);
        if operation.is_empty() {
            return None;
        }
        let decoded = urlencoding::decode(operation).ok()?;
        Some(decoded.into_owned())
    }

    /// True when the key was compacted to its digest form.
    pub fn is_digest(&self) -> bool {
        self.0.contains(":sha256:")
    }
}

impl Display for CacheKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone)]
pub struct CacheKeyBuilder {
    adapter: String,
    operation: String,
    args: BTreeMap<String, String>,
}

impl CacheKeyBuilder {
    pub fn arg(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.args.insert(name.into(), value.to_string());
        self
    }

    pub fn build(self) -> Result<CacheKey, ValidationError> {
        if self.adapter.trim().is_empty() {
            return Err(ValidationError::EmptyAdapter);
        }
        if self.operation.trim().is_empty() {
            return Err(ValidationError::EmptyOperation);
        }
        if self.args.keys().any(|name| name.is_empty()) {
            return Err(ValidationError::EmptyArgumentName);
        }

        let prefix = format!(
            "{}:{}",
            urlencoding::encode(&self.adapter),
            urlencoding::encode(&self.operation)
        );
        let args = self
            .args
            .iter()
            .map(|(name, value)| {
                format!("{}={}", urlencoding::encode(name), urlencoding::encode(value))
            })
            .collect::<Vec<_>>()
            .join("&");
        let plain = format!("{prefix}:{args}");

        if plain.len() <= MAX_KEY_LEN {
            return Ok(CacheKey(plain));
        }

        let digest = Sha256::digest(plain.as_bytes());
        Ok(CacheKey(format!("{prefix}:sha256:{}", hex::encode(digest))))
    }
}
