//! Shared tier (L2): JSON values in the network store.
//!
//! Nothing here returns an error. A store that is down, slow, or behind an
//! open circuit breaker turns reads into misses and writes into dropped
//! writes, each logged at `warn` and counted as degraded. Every store call
//! is bounded by the configured command timeout.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::backend::SharedStore;
use super::circuit_breaker::{CircuitBreaker, CircuitBreakerMetrics};
use crate::config::SharedTierConfig;
use crate::error::{CacheError, Result};
use crate::telemetry::metrics::{CacheMetrics, Tier};

/// Point-in-time shared tier counters.
#[derive(Debug, Clone, Serialize)]
pub struct SharedStats {
    pub hits: u64,
    pub misses: u64,
    /// Operations that fell back to a miss or a dropped write
    pub degraded: u64,
    pub breaker: CircuitBreakerMetrics,
}

/// The shared, TTL-bearing cache tier.
pub struct SharedTier {
    store: Arc<dyn SharedStore>,
    breaker: CircuitBreaker,
    default_ttl: Duration,
    command_timeout: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    degraded: AtomicU64,
}

impl SharedTier {
    pub fn new(store: Arc<dyn SharedStore>, config: &SharedTierConfig) -> Self {
        let breaker = CircuitBreaker::new(store.name(), config.circuit_breaker_threshold)
            .with_recovery_timeout(config.circuit_breaker_recovery);

        Self {
            store,
            breaker,
            default_ttl: config.default_ttl(),
            command_timeout: config.command_timeout,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            degraded: AtomicU64::new(0),
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    pub fn command_timeout(&self) -> Duration {
        self.command_timeout
    }

    pub fn store(&self) -> &Arc<dyn SharedStore> {
        &self.store
    }

    /// Run one store call behind the breaker and the command timeout.
    ///
    /// If the caller drops this future midway, the breaker permit is
    /// abandoned rather than left holding the half-open trial slot.
    async fn call<T, F>(&self, operation: &'static str, key: &str, fut: F) -> Option<T>
    where
        F: Future<Output = Result<T>>,
    {
        let command_timeout = self.command_timeout;
        self.guarded(operation, key, async move {
            match tokio::time::timeout(command_timeout, fut).await {
                Ok(result) => result,
                Err(_) => Err(CacheError::timeout(operation, command_timeout)),
            }
        })
        .await
    }

    /// Breaker bookkeeping around a store call that bounds itself.
    async fn guarded<T, F>(&self, operation: &'static str, key: &str, fut: F) -> Option<T>
    where
        F: Future<Output = Result<T>>,
    {
        let Some(permit) = self.breaker.permit() else {
            debug!(key = %key, operation, "Shared store circuit open, skipping call");
            self.record_degraded(operation);
            return None;
        };

        match fut.await {
            Ok(value) => {
                permit.success();
                Some(value)
            }
            Err(error) => {
                permit.failure();
                let _span = tracing::warn_span!(
                    "shared_store",
                    key = %key,
                    operation,
                    store = self.store.name()
                )
                .entered();
                error.log();
                self.record_degraded(operation);
                None
            }
        }
    }

    fn record_degraded(&self, operation: &'static str) {
        self.degraded.fetch_add(1, Ordering::Relaxed);
        CacheMetrics::degraded(operation);
    }

    fn record_miss(&self, reason: &'static str) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        CacheMetrics::miss(Tier::Shared, reason);
    }

    /// Read and deserialize a value. Undecodable values are evicted.
    pub async fn get<T>(&self, key: &str) -> Option<T>
    where
        T: DeserializeOwned,
    {
        if key.trim().is_empty() {
            return None;
        }

        let bytes = match self.call("get", key, self.store.get(key)).await {
            Some(Some(bytes)) => bytes,
            Some(None) => {
                self.record_miss("absent");
                return None;
            }
            None => {
                self.record_miss("degraded");
                return None;
            }
        };

        match serde_json::from_slice::<T>(&bytes) {
            Ok(value) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                CacheMetrics::hit(Tier::Shared);
                Some(value)
            }
            Err(error) => {
                warn!(
                    key = %key,
                    expected = std::any::type_name::<T>(),
                    error = %error,
                    "Shared tier value could not be decoded, evicting"
                );
                self.record_miss("corrupt");
                self.call("delete", key, self.store.delete(key)).await;
                None
            }
        }
    }

    /// Serialize and store a value. Returns whether the write reached the store.
    ///
    /// `None` or a zero `ttl` uses the configured default.
    pub async fn put<T>(&self, key: &str, value: &T, ttl: Option<Duration>) -> bool
    where
        T: Serialize + ?Sized,
    {
        match Self::encode(key, value) {
            Some(bytes) => self.put_encoded(key, &bytes, ttl).await,
            None => false,
        }
    }

    /// Serialize a value for the store. `None` for unserializable or JSON
    /// `null` values, which are never cached.
    pub fn encode<T>(key: &str, value: &T) -> Option<Vec<u8>>
    where
        T: Serialize + ?Sized,
    {
        let bytes = match serde_json::to_vec(value) {
            Ok(bytes) => bytes,
            Err(error) => {
                warn!(key = %key, error = %error, "Value could not be serialized, write dropped");
                return None;
            }
        };
        if bytes == b"null" {
            warn!(key = %key, "Refusing to cache a null value");
            return None;
        }
        Some(bytes)
    }

    /// Store an already-encoded value.
    pub async fn put_encoded(&self, key: &str, bytes: &[u8], ttl: Option<Duration>) -> bool {
        if key.trim().is_empty() {
            warn!("Refusing to write a shared tier value under a blank key");
            return false;
        }

        let ttl = ttl.filter(|t| !t.is_zero()).unwrap_or(self.default_ttl);
        self.call("set", key, self.store.set(key, bytes, ttl))
            .await
            .is_some()
    }

    /// Delete a key. Returns whether it existed.
    pub async fn evict(&self, key: &str) -> bool {
        if key.trim().is_empty() {
            return false;
        }
        self.call("delete", key, self.store.delete(key))
            .await
            .unwrap_or(false)
    }

    /// Delete every key matching a glob. Returns how many were deleted.
    pub async fn evict_pattern(&self, pattern: &str) -> u64 {
        if pattern.trim().is_empty() {
            warn!("Ignoring pattern eviction with a blank pattern");
            return 0;
        }
        let deleted = self
            .guarded(
                "delete_pattern",
                pattern,
                self.store.delete_pattern(pattern, self.command_timeout),
            )
            .await
            .unwrap_or(0);
        debug!(pattern = %pattern, deleted, "Shared tier pattern eviction");
        deleted
    }

    pub async fn exists(&self, key: &str) -> bool {
        if key.trim().is_empty() {
            return false;
        }
        self.call("exists", key, self.store.exists(key))
            .await
            .unwrap_or(false)
    }

    /// Remaining lifetime of a key, if it exists and expires.
    pub async fn ttl(&self, key: &str) -> Option<Duration> {
        if key.trim().is_empty() {
            return None;
        }
        self.call("ttl", key, self.store.ttl(key)).await.flatten()
    }

    pub fn stats(&self) -> SharedStats {
        SharedStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            degraded: self.degraded.load(Ordering::Relaxed),
            breaker: self.breaker.metrics(),
        }
    }
}
