//! Two-tier response cache with single-flight fetch deduplication.
//!
//! Lookups hit the [`LocalCache`] first. On a miss exactly one caller per key
//! becomes the leader: it consults the optional [`DistributedCache`] and then
//! runs the caller-supplied fetch. Every concurrent caller for the same key
//! awaits that one flight and receives a clone of its outcome, success or
//! failure. Only successes are stored.

use std::future::Future;
use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::distributed::DistributedCache;
use crate::fetcher::Payload;
use crate::local_cache::{CacheEntry, LocalCache};

/// Defines how a single call interacts with the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheMode {
    /// Read from the cache if a non-expired entry is present;
    /// otherwise fetch and write the response to the cache. (Default)
    #[default]
    Use,
    /// Skip the read, fetch, and write the new response to the cache.
    Refresh,
    /// Fetch without reading from or writing to the cache.
    Bypass,
}

/// Where a lookup's value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheSource {
    Local,
    Distributed,
    /// This caller led the flight that fetched the value.
    Fetched,
    /// This caller awaited another caller's in-flight fetch.
    Coalesced,
}

/// Result of a cache lookup.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheLookup {
    pub value: Payload,
    pub fetched_at: OffsetDateTime,
    pub source: CacheSource,
}

impl CacheLookup {
    fn from_entry(entry: CacheEntry, source: CacheSource) -> Self {
        let fetched_at = entry.fetched_at();
        Self {
            value: entry.into_value(),
            fetched_at,
            source,
        }
    }

    pub fn was_cached(&self) -> bool {
        matches!(self.source, CacheSource::Local | CacheSource::Distributed)
    }
}

/// How long a warming task waits after a failed refresh before trying again.
pub const WARM_RETRY_DELAY: Duration = Duration::from_secs(60);

/// Point-in-time cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub hit_ratio: f64,
    pub entries: usize,
    pub max_size: usize,
    pub evictions: u64,
    pub expirations: u64,
    pub coalesced: u64,
    pub distributed_hits: u64,
    pub backend_errors: u64,
    pub in_flight: usize,
    /// Keys with an active warming task.
    pub warming: usize,
    /// Successful refreshes made by warming tasks.
    pub warm_refreshes: u64,
}

#[derive(Debug, Clone)]
struct Fetched {
    value: Payload,
    fetched_at: OffsetDateTime,
    from_distributed: bool,
}

type SharedFlight<E> = Shared<BoxFuture<'static, Result<Fetched, E>>>;

struct InFlight<E> {
    id: u64,
    future: SharedFlight<E>,
}

struct Inner<E> {
    local: LocalCache,
    distributed: Option<DistributedCache>,
    inflight: DashMap<String, InFlight<E>>,
    next_flight: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    coalesced: AtomicU64,
    distributed_hits: AtomicU64,
    warmers: DashMap<String, JoinHandle<()>>,
    warm_refreshes: AtomicU64,
}

impl<E> Drop for Inner<E> {
    fn drop(&mut self) {
        for warmer in self.warmers.iter() {
            warmer.abort();
        }
    }
}

/// Thread-safe cache manager. Cheap to clone; clones share state.
///
/// `E` is the error type produced by fetch closures. It must be `Clone` so a
/// failed flight can be handed to every waiter.
pub struct CacheManager<E> {
    inner: Arc<Inner<E>>,
}

impl<E> Clone for CacheManager<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E> std::fmt::Debug for CacheManager<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheManager")
            .field("entries", &self.inner.local.len())
            .field("distributed", &self.inner.distributed)
            .field("in_flight", &self.inner.inflight.len())
            .finish()
    }
}

impl<E> CacheManager<E>
where
    E: Clone + Send + Sync + 'static,
{
    pub fn new(local: LocalCache, distributed: Option<DistributedCache>) -> Self {
        Self {
            inner: Arc::new(Inner {
                local,
                distributed,
                inflight: DashMap::new(),
                next_flight: AtomicU64::new(0),
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                coalesced: AtomicU64::new(0),
                distributed_hits: AtomicU64::new(0),
                warmers: DashMap::new(),
                warm_refreshes: AtomicU64::new(0),
            }),
        }
    }

    /// Returns the cached value for `key`, or runs `fetch_fn` at most once
    /// across all concurrent callers and caches a success for `ttl`.
    ///
    /// A zero `ttl` still deduplicates the flight but stores nothing. The
    /// flight runs on its own Tokio task and completes even when every
    /// caller is dropped, so this must be called from within a runtime.
    ///
    /// # Errors
    ///
    /// Returns the fetch error, shared with every caller that awaited the same
    /// flight. Failures are never cached.
    pub async fn get_or_fetch<F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        fetch_fn: F,
    ) -> Result<CacheLookup, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Payload, E>> + Send + 'static,
    {
        self.fetch_with_mode(key, ttl, CacheMode::Use, fetch_fn).await
    }

    /// Like [`get_or_fetch`](Self::get_or_fetch) with an explicit [`CacheMode`].
    pub async fn fetch_with_mode<F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        mode: CacheMode,
        fetch_fn: F,
    ) -> Result<CacheLookup, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Payload, E>> + Send + 'static,
    {
        match mode {
            CacheMode::Use => {
                if let Some(entry) = self.inner.local.get(key) {
                    self.inner.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(CacheLookup::from_entry(entry, CacheSource::Local));
                }
                self.join_or_lead(key, ttl, true, fetch_fn).await
            }
            CacheMode::Refresh => self.join_or_lead(key, ttl, false, fetch_fn).await,
            CacheMode::Bypass => {
                let value = fetch_fn().await?;
                Ok(CacheLookup {
                    value,
                    fetched_at: OffsetDateTime::now_utc(),
                    source: CacheSource::Fetched,
                })
            }
        }
    }

    /// Returns the local entry for `key` without touching statistics.
    pub fn peek(&self, key: &str) -> Option<CacheEntry> {
        self.inner.local.get(key)
    }

    /// Removes `key` from both tiers and detaches any in-flight fetch, so the
    /// next lookup always fetches fresh.
    ///
    /// A detached fetch is not cancelled. It keeps running and its waiters
    /// still receive its outcome, but its result is never stored. The next
    /// lookup for `key` starts a new flight, so for a while two fetches for
    /// the same key can be running at once.
    pub async fn invalidate(&self, key: &str) {
        let detached = self.inner.inflight.remove(key).is_some();
        let removed = self.inner.local.remove(key);
        if let Some(tier) = &self.inner.distributed {
            tier.delete(key).await;
        }
        debug!(key, removed, detached, "cache entry invalidated");
    }

    /// Drops every local entry. In-flight fetches are detached as well.
    pub fn clear(&self) {
        self.inner.inflight.clear();
        self.inner.local.clear();
    }

    /// Removes every key containing `pattern` from the local tier and detaches
    /// matching in-flight fetches. The removed keys are also deleted from the
    /// distributed tier. An empty pattern matches every key.
    ///
    /// Returns how many local entries were removed.
    pub async fn clear_matching(&self, pattern: &str) -> usize {
        self.inner.inflight.retain(|key, _| !key.contains(pattern));
        let removed = self.inner.local.remove_matching(pattern);
        if let Some(tier) = &self.inner.distributed {
            for key in &removed {
                tier.delete(key).await;
            }
        }
        debug!(pattern, removed = removed.len(), "cache entries cleared by pattern");
        removed.len()
    }

    /// Keeps `key` warm by running `warm_fn` now and then every `interval`,
    /// storing each success for `ttl` in both tiers.
    ///
    /// A failed refresh is logged and retried after [`WARM_RETRY_DELAY`].
    /// Warming the same key again replaces its previous task. Tasks stop on
    /// [`stop_warming`](Self::stop_warming) or once every clone of this
    /// manager is dropped.
    pub fn warm<F, Fut>(&self, key: &str, ttl: Duration, interval: Duration, warm_fn: F)
    where
        E: Display,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Payload, E>> + Send + 'static,
    {
        let weak: Weak<Inner<E>> = Arc::downgrade(&self.inner);
        let task_key = key.to_owned();
        let handle = tokio::spawn(async move {
            loop {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let delay = match warm_fn().await {
                    Ok(value) => {
                        inner.store(&task_key, value, ttl).await;
                        inner.warm_refreshes.fetch_add(1, Ordering::Relaxed);
                        debug!(key = %task_key, "cache warmed");
                        interval
                    }
                    Err(err) => {
                        warn!(key = %task_key, error = %err, "cache warming failed");
                        WARM_RETRY_DELAY
                    }
                };
                drop(inner);
                tokio::time::sleep(delay).await;
            }
        });
        if let Some(previous) = self.inner.warmers.insert(key.to_owned(), handle) {
            previous.abort();
        }
    }

    /// Stops the warming task for `key`. Returns `false` if none was running.
    pub fn stop_warming(&self, key: &str) -> bool {
        match self.inner.warmers.remove(key) {
            Some((_, handle)) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn purge_expired(&self) -> usize {
        self.inner.local.purge_expired()
    }

    pub fn has_distributed_tier(&self) -> bool {
        self.inner.distributed.is_some()
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.inner.hits.load(Ordering::Relaxed);
        let misses = self.inner.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        CacheStats {
            hits,
            misses,
            hit_ratio: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
            entries: self.inner.local.len(),
            max_size: self.inner.local.max_size(),
            evictions: self.inner.local.evictions(),
            expirations: self.inner.local.expirations(),
            coalesced: self.inner.coalesced.load(Ordering::Relaxed),
            distributed_hits: self.inner.distributed_hits.load(Ordering::Relaxed),
            backend_errors: self
                .inner
                .distributed
                .as_ref()
                .map_or(0, DistributedCache::errors),
            in_flight: self.inner.inflight.len(),
            warming: self.inner.warmers.len(),
            warm_refreshes: self.inner.warm_refreshes.load(Ordering::Relaxed),
        }
    }

    async fn join_or_lead<F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        read_through: bool,
        fetch_fn: F,
    ) -> Result<CacheLookup, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Payload, E>> + Send + 'static,
    {
        let (flight, leader) = match self.inner.inflight.entry(key.to_owned()) {
            Entry::Occupied(existing) => (existing.get().future.clone(), false),
            Entry::Vacant(slot) => {
                // A previous leader may have stored its result since our miss.
                if read_through {
                    if let Some(entry) = self.inner.local.get(key) {
                        self.inner.hits.fetch_add(1, Ordering::Relaxed);
                        return Ok(CacheLookup::from_entry(entry, CacheSource::Local));
                    }
                }

                let id = self.inner.next_flight.fetch_add(1, Ordering::Relaxed);
                let future = Inner::fly(
                    Arc::clone(&self.inner),
                    key.to_owned(),
                    id,
                    ttl,
                    read_through,
                    fetch_fn(),
                )
                .boxed()
                .shared();
                slot.insert(InFlight {
                    id,
                    future: future.clone(),
                });
                (future, true)
            }
        };
        if leader {
            // The flight owns upstream resources such as a half-open trial
            // slot, so it must finish even if every caller goes away.
            tokio::spawn(flight.clone());
        }

        let fetched = flight.await?;
        let source = if !leader {
            self.inner.misses.fetch_add(1, Ordering::Relaxed);
            self.inner.coalesced.fetch_add(1, Ordering::Relaxed);
            CacheSource::Coalesced
        } else if fetched.from_distributed {
            self.inner.hits.fetch_add(1, Ordering::Relaxed);
            self.inner.distributed_hits.fetch_add(1, Ordering::Relaxed);
            CacheSource::Distributed
        } else {
            self.inner.misses.fetch_add(1, Ordering::Relaxed);
            CacheSource::Fetched
        };

        Ok(CacheLookup {
            value: fetched.value,
            fetched_at: fetched.fetched_at,
            source,
        })
    }
}

impl<E> Inner<E>
where
    E: Clone + Send + Sync + 'static,
{
    async fn fly<Fut>(
        self: Arc<Self>,
        key: String,
        id: u64,
        ttl: Duration,
        read_through: bool,
        fetch: Fut,
    ) -> Result<Fetched, E>
    where
        Fut: Future<Output = Result<Payload, E>> + Send + 'static,
    {
        if read_through {
            if let Some(tier) = &self.distributed {
                if let Some(entry) = tier.get(&key).await {
                    let fetched = Fetched {
                        value: entry.value().clone(),
                        fetched_at: entry.fetched_at(),
                        from_distributed: true,
                    };
                    self.settle(&key, id, Some(entry));
                    return Ok(fetched);
                }
            }
        }

        match fetch.await {
            Ok(value) => {
                let fetched_at = OffsetDateTime::now_utc();
                let entry =
                    CacheEntry::new(key.as_str(), value.clone(), ttl, fetched_at, source_tag(&key));
                let stored = self.settle(&key, id, entry.clone());
                if let (true, Some(tier), Some(entry)) = (stored, &self.distributed, &entry) {
                    tier.set(entry).await;
                }
                Ok(Fetched {
                    value,
                    fetched_at,
                    from_distributed: false,
                })
            }
            Err(err) => {
                self.settle(&key, id, None);
                Err(err)
            }
        }
    }

    /// Writes a value to both tiers outside of any flight.
    async fn store(&self, key: &str, value: Payload, ttl: Duration) {
        let entry = CacheEntry::new(key, value, ttl, OffsetDateTime::now_utc(), source_tag(key));
        if let Some(entry) = entry {
            self.local.insert(entry.clone());
            if let Some(tier) = &self.distributed {
                tier.set(&entry).await;
            }
        }
    }

    /// Retires flight `id` and stores its entry, unless the flight was
    /// detached by an invalidation in the meantime.
    fn settle(&self, key: &str, id: u64, entry: Option<CacheEntry>) -> bool {
        match self.inflight.entry(key.to_owned()) {
            Entry::Occupied(flight) if flight.get().id == id => {
                let stored = match entry {
                    Some(entry) => {
                        self.local.insert(entry);
                        true
                    }
                    None => false,
                };
                flight.remove();
                stored
            }
            _ => false,
        }
    }
}

/// Adapter name for keys built by [`CacheKey`](crate::CacheKey), else the whole key.
fn source_tag(key: &str) -> &str {
    key.split_once(':').map_or(key, |(adapter, _)| adapter)
}
