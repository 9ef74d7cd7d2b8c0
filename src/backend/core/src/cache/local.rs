//! Local tier (L1): bounded, short-TTL, in-process cache.
//!
//! Keys are spread over independently locked shards. Each shard is a
//! segmented LRU: new entries land in a probationary segment and move to a
//! protected segment (about 80% of the shard) when read again, so a burst of
//! one-off reads cannot flush the hot set. Entries also carry a fixed
//! expiry; whichever of capacity pressure or TTL comes first removes them.
//!
//! Values are stored type-erased. Reading an entry as a different type than
//! it was written with is treated as absent and drops the entry.

use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::config::LocalTierConfig;
use crate::telemetry::metrics::{CacheMetrics, Tier};

/// Share of each shard reserved for entries that have been read twice.
const PROTECTED_RATIO: f64 = 0.8;

type ErasedValue = Arc<dyn Any + Send + Sync>;

#[derive(Clone)]
struct Slot {
    value: ErasedValue,
    expires_at: Instant,
}

impl Slot {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

enum Touch {
    Absent,
    Expired,
    Mismatch,
    Live(Slot),
}

// ═══════════════════════════════════════════════════════════════════════════════
// Shard
// ═══════════════════════════════════════════════════════════════════════════════

struct Shard {
    probationary: LruCache<String, Slot>,
    protected: LruCache<String, Slot>,
    capacity: usize,
    protected_cap: usize,
}

impl Shard {
    fn new(capacity: usize) -> Self {
        Self {
            probationary: LruCache::unbounded(),
            protected: LruCache::unbounded(),
            capacity,
            protected_cap: (capacity as f64 * PROTECTED_RATIO) as usize,
        }
    }

    fn len(&self) -> usize {
        self.probationary.len() + self.protected.len()
    }

    fn peek(&self, key: &str) -> Option<&Slot> {
        self.protected
            .peek(key)
            .or_else(|| self.probationary.peek(key))
    }

    fn remove(&mut self, key: &str) -> bool {
        self.protected.pop(key).is_some() || self.probationary.pop(key).is_some()
    }

    fn clear(&mut self) -> usize {
        let removed = self.len();
        self.probationary.clear();
        self.protected.clear();
        removed
    }

    /// Look up a key and record the access. Entries that are expired or
    /// fail `fits` are dropped under the same lock.
    fn touch(&mut self, key: &str, now: Instant, fits: impl Fn(&Slot) -> bool) -> Touch {
        match self.peek(key) {
            None => return Touch::Absent,
            Some(slot) if slot.is_expired(now) => {
                self.remove(key);
                return Touch::Expired;
            }
            Some(slot) if !fits(slot) => {
                self.remove(key);
                return Touch::Mismatch;
            }
            Some(_) => {}
        }

        if let Some(slot) = self.protected.get(key) {
            return Touch::Live(slot.clone());
        }
        match self.probationary.pop(key) {
            Some(slot) => {
                self.promote(key.to_string(), slot.clone());
                Touch::Live(slot)
            }
            None => Touch::Absent,
        }
    }

    fn promote(&mut self, key: String, slot: Slot) {
        self.protected.put(key, slot);
        while self.protected.len() > self.protected_cap {
            match self.protected.pop_lru() {
                Some((demoted_key, demoted)) => {
                    self.probationary.put(demoted_key, demoted);
                }
                None => break,
            }
        }
    }

    /// Insert or replace; returns how many entries capacity pressure removed.
    fn insert(&mut self, key: String, slot: Slot) -> u64 {
        if self.protected.contains(key.as_str()) {
            self.protected.put(key, slot);
            return 0;
        }
        self.probationary.put(key, slot);
        self.enforce_capacity()
    }

    fn enforce_capacity(&mut self) -> u64 {
        let mut evicted = 0;
        while self.len() > self.capacity {
            let victim = if !self.probationary.is_empty() {
                self.probationary.pop_lru()
            } else {
                self.protected.pop_lru()
            };
            match victim {
                Some((key, _)) => {
                    debug!(key = %key, "Local tier capacity eviction");
                    evicted += 1;
                }
                None => break,
            }
        }
        evicted
    }

    fn purge_expired(&mut self, now: Instant) -> usize {
        let expired: Vec<String> = self
            .protected
            .iter()
            .chain(self.probationary.iter())
            .filter(|(_, slot)| slot.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            self.remove(key);
        }
        expired.len()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Statistics
// ═══════════════════════════════════════════════════════════════════════════════

/// Point-in-time local tier counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LocalStats {
    pub hits: u64,
    pub misses: u64,
    /// Entries removed by capacity pressure
    pub evictions: u64,
    /// Entries removed because their TTL elapsed
    pub expirations: u64,
    /// Reads that found a value of a different type
    pub type_mismatches: u64,
    pub entries: u64,
    pub capacity: u64,
}

impl LocalStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total > 0 {
            self.hits as f64 / total as f64
        } else {
            0.0
        }
    }
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    type_mismatches: AtomicU64,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Local Tier
// ═══════════════════════════════════════════════════════════════════════════════

/// Sharded segmented-LRU cache with a fixed entry TTL.
pub struct LocalTier {
    shards: Box<[Mutex<Shard>]>,
    ttl: Duration,
    capacity: usize,
    counters: Counters,
}

impl std::fmt::Debug for LocalTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTier")
            .field("shards", &self.shards.len())
            .field("capacity", &self.capacity)
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl LocalTier {
    /// Create a tier holding at most `max_entries` spread over `shards`.
    pub fn new(max_entries: usize, shards: usize, ttl: Duration) -> Self {
        let max_entries = max_entries.max(1);
        let shard_count = shards.clamp(1, max_entries);
        let per_shard = max_entries.div_ceil(shard_count);

        Self {
            shards: (0..shard_count)
                .map(|_| Mutex::new(Shard::new(per_shard)))
                .collect(),
            ttl,
            capacity: per_shard * shard_count,
            counters: Counters::default(),
        }
    }

    pub fn from_config(config: &LocalTierConfig) -> Self {
        Self::new(config.max_entries, config.shards, config.ttl())
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn shard_for(&self, key: &str) -> &Mutex<Shard> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let index = (hasher.finish() % self.shards.len() as u64) as usize;
        &self.shards[index]
    }

    /// Read a value, promoting it within its shard.
    pub fn get<T>(&self, key: &str) -> Option<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        if key.is_empty() {
            return None;
        }

        let touched = self
            .shard_for(key)
            .lock()
            .touch(key, Instant::now(), |slot| (*slot.value).is::<T>());
        let slot = match touched {
            Touch::Live(slot) => slot,
            Touch::Expired => {
                self.counters.expirations.fetch_add(1, Ordering::Relaxed);
                self.record_miss("expired");
                CacheMetrics::eviction("expired");
                return None;
            }
            Touch::Absent => {
                self.record_miss("absent");
                return None;
            }
            Touch::Mismatch => {
                warn!(
                    key = %key,
                    expected = std::any::type_name::<T>(),
                    "Local tier entry has an incompatible type, evicted"
                );
                self.counters.type_mismatches.fetch_add(1, Ordering::Relaxed);
                self.record_miss("type_mismatch");
                CacheMetrics::eviction("type_mismatch");
                return None;
            }
        };

        let value = slot.value.downcast_ref::<T>()?.clone();
        self.counters.hits.fetch_add(1, Ordering::Relaxed);
        CacheMetrics::hit(Tier::Local);
        Some(value)
    }

    /// Insert or replace a value. A blank key is ignored.
    pub fn put<T>(&self, key: &str, value: T)
    where
        T: Send + Sync + 'static,
    {
        if key.trim().is_empty() {
            warn!("Refusing to cache a value under a blank key");
            return;
        }

        let slot = Slot {
            value: Arc::new(value),
            expires_at: Instant::now() + self.ttl,
        };
        let evicted = self.shard_for(key).lock().insert(key.to_string(), slot);
        if evicted > 0 {
            self.counters.evictions.fetch_add(evicted, Ordering::Relaxed);
            for _ in 0..evicted {
                CacheMetrics::eviction("capacity");
            }
        }
    }

    /// Remove a key. Returns whether it was present.
    pub fn evict(&self, key: &str) -> bool {
        let removed = self.shard_for(key).lock().remove(key);
        if removed {
            CacheMetrics::eviction("explicit");
            debug!(key = %key, "Local tier entry evicted");
        }
        removed
    }

    /// Remove everything. Returns the number of entries dropped.
    pub fn evict_all(&self) -> usize {
        let removed: usize = self.shards.iter().map(|shard| shard.lock().clear()).sum();
        CacheMetrics::local_entries(0);
        debug!(removed, "Local tier cleared");
        removed
    }

    /// Whether a live entry exists, without counting an access.
    pub fn contains(&self, key: &str) -> bool {
        let now = Instant::now();
        self.shard_for(key)
            .lock()
            .peek(key)
            .map(|slot| !slot.is_expired(now))
            .unwrap_or(false)
    }

    /// Number of stored entries, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let purged: usize = self
            .shards
            .iter()
            .map(|shard| shard.lock().purge_expired(now))
            .sum();

        if purged > 0 {
            self.counters
                .expirations
                .fetch_add(purged as u64, Ordering::Relaxed);
            for _ in 0..purged {
                CacheMetrics::eviction("expired");
            }
            debug!(purged, "Purged expired local tier entries");
        }
        CacheMetrics::local_entries(self.len());
        purged
    }

    pub fn stats(&self) -> LocalStats {
        LocalStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            expirations: self.counters.expirations.load(Ordering::Relaxed),
            type_mismatches: self.counters.type_mismatches.load(Ordering::Relaxed),
            entries: self.len() as u64,
            capacity: self.capacity as u64,
        }
    }

    fn record_miss(&self, reason: &'static str) {
        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        CacheMetrics::miss(Tier::Local, reason);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
