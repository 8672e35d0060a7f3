//! Optional distributed cache tier.
//!
//! The external store only needs string `get`/`set`/`delete` with a TTL. Every
//! failure or timeout is logged and swallowed here so callers of the cache
//! manager never observe it; the manager simply runs local-only.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::CacheBackendError;
use crate::fetcher::Payload;
use crate::local_cache::CacheEntry;

pub type StoreFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, CacheBackendError>> + Send + 'a>>;

/// External key/value store contract.
pub trait KeyValueStore: Send + Sync {
    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<String>>;

    fn set<'a>(&'a self, key: &'a str, value: String, ttl: Duration) -> StoreFuture<'a, ()>;

    fn delete<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ()>;
}

/// Serialized form of a cache entry in the external store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct StoredEntry {
    payload: Payload,
    #[serde(with = "time::serde::rfc3339")]
    fetched_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    expires_at: OffsetDateTime,
    source_tag: String,
}

/// Best-effort pass-through to a [`KeyValueStore`].
pub struct DistributedCache {
    store: Arc<dyn KeyValueStore>,
    timeout: Duration,
    errors: AtomicU64,
}

impl std::fmt::Debug for DistributedCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedCache")
            .field("timeout", &self.timeout)
            .field("errors", &self.errors())
            .finish_non_exhaustive()
    }
}

impl DistributedCache {
    pub fn new(store: Arc<dyn KeyValueStore>, timeout: Duration) -> Self {
        Self {
            store,
            timeout,
            errors: AtomicU64::new(0),
        }
    }

    /// Looks up `key`, rebuilding a local entry with the remaining TTL.
    pub async fn get(&self, key: &str) -> Option<CacheEntry> {
        let raw = self.bounded("get", key, self.store.get(key)).await??;
        let stored: StoredEntry = match serde_json::from_str(&raw) {
            Ok(stored) => stored,
            Err(err) => {
                self.absorb("get", key, CacheBackendError::Codec(err.to_string()));
                return None;
            }
        };

        let remaining = stored.expires_at - OffsetDateTime::now_utc();
        let remaining = Duration::try_from(remaining).ok()?;
        CacheEntry::new(
            key,
            stored.payload,
            remaining,
            stored.fetched_at,
            stored.source_tag,
        )
    }

    /// Writes `entry` with its remaining TTL. Failures are logged only.
    pub async fn set(&self, entry: &CacheEntry) {
        let ttl = entry.remaining_ttl();
        if ttl.is_zero() {
            return;
        }
        let expires_at = OffsetDateTime::now_utc() + ttl;
        let stored = StoredEntry {
            payload: entry.value().clone(),
            fetched_at: entry.fetched_at(),
            expires_at,
            source_tag: entry.source_tag().to_owned(),
        };
        let raw = match serde_json::to_string(&stored) {
            Ok(raw) => raw,
            Err(err) => {
                self.absorb("set", entry.key(), CacheBackendError::Codec(err.to_string()));
                return;
            }
        };

        if self
            .bounded("set", entry.key(), self.store.set(entry.key(), raw, ttl))
            .await
            .is_some()
        {
            debug!(key = entry.key(), ttl_ms = ttl.as_millis() as u64, "distributed cache write");
        }
    }

    pub async fn delete(&self, key: &str) {
        let _ = self.bounded("delete", key, self.store.delete(key)).await;
    }

    /// Number of absorbed backend failures.
    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    async fn bounded<T>(
        &self,
        op: &'static str,
        key: &str,
        future: StoreFuture<'_, T>,
    ) -> Option<T> {
        match tokio::time::timeout(self.timeout, future).await {
            Ok(Ok(value)) => Some(value),
            Ok(Err(err)) => {
                self.absorb(op, key, err);
                None
            }
            Err(_) => {
                self.absorb(op, key, CacheBackendError::Timeout(self.timeout));
                None
            }
        }
    }

    fn absorb(&self, op: &'static str, key: &str, err: CacheBackendError) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        warn!(op, key, error = %err, "distributed cache degraded to local-only");
    }
}

/// Process-local [`KeyValueStore`] with per-key expiry.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    entries: DashMap<String, (String, Instant)>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries
            .get(key)
            .is_some_and(|entry| entry.1 > Instant::now())
    }
}

impl KeyValueStore for InMemoryStore {
    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<String>> {
        Box::pin(async move {
            let now = Instant::now();
            let value = self
                .entries
                .get(key)
                .filter(|entry| entry.1 > now)
                .map(|entry| entry.0.clone());
            if value.is_none() {
                self.entries.remove_if(key, |_, entry| entry.1 <= now);
            }
            Ok(value)
        })
    }

    fn set<'a>(&'a self, key: &'a str, value: String, ttl: Duration) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.entries
                .insert(key.to_owned(), (value, Instant::now() + ttl));
            Ok(())
        })
    }

    fn delete<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.entries.remove(key);
            Ok(())
        })
    }
}
