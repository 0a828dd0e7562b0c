//! Transport cache with TTL and fingerprint invalidation
//!
//! Entries are keyed by `(cluster, user)`. Each key owns a slot guarded by an
//! async mutex, so concurrent misses for the same pair build one transport
//! between them. An entry is served only while it is younger than the TTL
//! and its material fingerprint matches the caller's.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::debug;

use super::ScopedTransport;
use crate::Result;

/// Cache key: one entry per `(cluster, user)` pair
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    cluster: String,
    user: String,
}

impl CacheKey {
    /// Key for `user` on `cluster`
    pub fn new(cluster: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            cluster: cluster.into(),
            user: user.into(),
        }
    }
}

type Slot = Arc<Mutex<Option<CachedTransport>>>;

/// A built transport with the fingerprint of the material it was built from
struct CachedTransport {
    transport: Arc<ScopedTransport>,
    fingerprint: String,
    cached_at: Instant,
}

impl CachedTransport {
    fn is_expired(&self, ttl: Duration) -> bool {
        self.cached_at.elapsed() > ttl
    }
}

/// Cache statistics tracked atomically
#[derive(Debug, Default)]
struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl CacheStats {
    #[allow(clippy::cast_precision_loss)]
    fn hit_rate(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let total = hits + self.misses.load(Ordering::Relaxed);
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

/// Thread-safe transport cache
pub struct TransportCache {
    slots: DashMap<CacheKey, Slot>,
    ttl: Duration,
    max_entries: usize,
    stats: CacheStats,
}

impl TransportCache {
    /// Create a cache whose entries live for `ttl`, holding at most
    /// `max_entries` transports.
    #[must_use]
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            slots: DashMap::new(),
            ttl,
            max_entries: max_entries.max(1),
            stats: CacheStats::default(),
        }
    }

    /// Entry lifetime
    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Return the cached transport for `key`, or build and cache one.
    ///
    /// At most one `build` runs per key at a time; callers arriving while it
    /// runs wait and then share its result. A failed build caches nothing.
    pub async fn get_or_build<F>(
        &self,
        key: CacheKey,
        fingerprint: &str,
        build: F,
    ) -> Result<Arc<ScopedTransport>>
    where
        F: FnOnce() -> Result<ScopedTransport>,
    {
        // Clone the slot out so no map shard lock is held across the await
        let slot = Arc::clone(self.slots.entry(key.clone()).or_default().value());
        let mut entry = slot.lock().await;

        if let Some(cached) = entry.as_ref() {
            if cached.fingerprint == fingerprint && !cached.is_expired(self.ttl) {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(Arc::clone(&cached.transport));
            }
            debug!(
                cluster = %key.cluster,
                user = %key.user,
                expired = cached.is_expired(self.ttl),
                "Discarding stale transport"
            );
            *entry = None;
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
        }

        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        let transport = Arc::new(build()?);
        *entry = Some(CachedTransport {
            transport: Arc::clone(&transport),
            fingerprint: fingerprint.to_string(),
            cached_at: Instant::now(),
        });
        drop(entry);

        self.enforce_capacity(&key);
        Ok(transport)
    }

    /// Drop the entry for `key`; returns whether one was cached.
    pub fn invalidate(&self, key: &CacheKey) -> bool {
        let removed = self
            .slots
            .remove(key)
            .is_some_and(|(_, slot)| slot.try_lock().is_ok_and(|entry| entry.is_some()));
        if removed {
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    /// Evict expired entries (background maintenance).
    ///
    /// Slots with a build in flight are left alone.
    pub fn evict_expired(&self) -> usize {
        let ttl = self.ttl;
        let mut evicted = 0;
        self.slots.retain(|_, slot| match slot.try_lock() {
            Ok(entry) => match entry.as_ref() {
                Some(cached) if cached.is_expired(ttl) => {
                    evicted += 1;
                    false
                }
                Some(_) => true,
                None => false,
            },
            Err(_) => true,
        });

        if evicted > 0 {
            self.stats
                .evictions
                .fetch_add(evicted as u64, Ordering::Relaxed);
            debug!(evicted, remaining = self.slots.len(), "Evicted expired transports");
        }
        evicted
    }

    /// Number of cached transports
    pub fn len(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.value().try_lock().is_ok_and(|entry| entry.is_some()))
            .count()
    }

    /// Whether no transport is cached
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get cache statistics
    pub fn stats(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            evictions: self.stats.evictions.load(Ordering::Relaxed),
            size: self.len(),
            hit_rate: self.stats.hit_rate(),
        }
    }

    /// Evict the oldest entries (other than `keep`) beyond `max_entries`.
    fn enforce_capacity(&self, keep: &CacheKey) {
        if self.slots.len() <= self.max_entries {
            return;
        }

        let mut candidates: Vec<(CacheKey, Option<Instant>)> = self
            .slots
            .iter()
            .filter(|slot| slot.key() != keep)
            .filter_map(|slot| {
                let entry = slot.value().try_lock().ok()?;
                Some((slot.key().clone(), entry.as_ref().map(|c| c.cached_at)))
            })
            .collect();
        // Empty slots first, then oldest
        candidates.sort_by_key(|(_, cached_at)| *cached_at);

        let excess = self.slots.len().saturating_sub(self.max_entries);
        for (key, cached_at) in candidates.into_iter().take(excess) {
            self.slots.remove(&key);
            if cached_at.is_some() {
                self.stats.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// Snapshot of cache statistics
#[derive(Debug, Clone, serde::Serialize)]
pub struct CacheStatsSnapshot {
    /// Total cache hits
    pub hits: u64,
    /// Total cache misses
    pub misses: u64,
    /// Total evictions (expired, stale or over capacity)
    pub evictions: u64,
    /// Current number of cached transports
    pub size: usize,
    /// Hit rate (0.0-1.0)
    pub hit_rate: f64,
}
