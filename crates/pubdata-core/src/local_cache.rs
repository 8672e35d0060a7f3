//! In-process TTL entry store.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use time::OffsetDateTime;
use tokio::time::Instant;
use tracing::debug;

use crate::fetcher::Payload;

/// A cached payload. Immutable once created.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    key: String,
    value: Payload,
    created_at: Instant,
    expires_at: Instant,
    fetched_at: OffsetDateTime,
    source_tag: String,
}

impl CacheEntry {
    /// Returns `None` for a zero TTL, which would violate `expires_at > created_at`.
    pub fn new(
        key: impl Into<String>,
        value: Payload,
        ttl: Duration,
        fetched_at: OffsetDateTime,
        source_tag: impl Into<String>,
    ) -> Option<Self> {
        if ttl.is_zero() {
            return None;
        }
        let created_at = Instant::now();
        Some(Self {
            key: key.into(),
            value,
            created_at,
            expires_at: created_at + ttl,
            fetched_at,
            source_tag: source_tag.into(),
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> &Payload {
        &self.value
    }

    pub fn into_value(self) -> Payload {
        self.value
    }

    pub const fn created_at(&self) -> Instant {
        self.created_at
    }

    pub const fn expires_at(&self) -> Instant {
        self.expires_at
    }

    pub const fn fetched_at(&self) -> OffsetDateTime {
        self.fetched_at
    }

    pub fn source_tag(&self) -> &str {
        &self.source_tag
    }

    pub fn is_expired_at(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    pub fn remaining_ttl(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }
}

/// Sharded TTL map bounded by `max_size`.
///
/// When full, the entries closest to expiry are evicted first.
#[derive(Debug)]
pub struct LocalCache {
    entries: DashMap<String, CacheEntry>,
    max_size: usize,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl LocalCache {
    pub fn new(max_size: usize) -> Self {
        Self {
            entries: DashMap::new(),
            max_size: max_size.max(1),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        }
    }

    /// Returns the entry for `key` if present and unexpired.
    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        let now = Instant::now();
        {
            let entry = self.entries.get(key)?;
            if !entry.is_expired_at(now) {
                return Some(entry.clone());
            }
        }

        if self
            .entries
            .remove_if(key, |_, entry| entry.is_expired_at(now))
            .is_some()
        {
            self.expirations.fetch_add(1, Ordering::Relaxed);
        }
        None
    }

    pub fn insert(&self, entry: CacheEntry) {
        self.entries.insert(entry.key.clone(), entry);
        if self.entries.len() > self.max_size {
            self.evict_overflow();
        }
    }

    pub fn remove(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Removes every entry whose key contains `pattern` and returns those keys.
    pub fn remove_matching(&self, pattern: &str) -> Vec<String> {
        let mut removed = Vec::new();
        self.entries.retain(|key, _| {
            if key.contains(pattern) {
                removed.push(key.clone());
                false
            } else {
                true
            }
        });
        removed
    }

    /// Drops every expired entry and returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired_at(now));
        let removed = before.saturating_sub(self.entries.len());
        self.expirations.fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    /// Number of stored entries, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub const fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    pub fn expirations(&self) -> u64 {
        self.expirations.load(Ordering::Relaxed)
    }

    fn evict_overflow(&self) {
        self.purge_expired();

        let overflow = self.entries.len().saturating_sub(self.max_size);
        if overflow == 0 {
            return;
        }

        let mut by_expiry: Vec<(Instant, String)> = self
            .entries
            .iter()
            .map(|entry| (entry.expires_at, entry.key().clone()))
            .collect();
        by_expiry.sort_unstable();

        let mut evicted = 0u64;
        for (_, key) in by_expiry.into_iter().take(overflow) {
            if self.entries.remove(&key).is_some() {
                evicted += 1;
            }
        }
        self.evictions.fetch_add(evicted, Ordering::Relaxed);
        debug!(evicted, max_size = self.max_size, "local cache evicted soonest-expiring entries");
    }
}
