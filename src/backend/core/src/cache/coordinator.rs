//! The hybrid cache facade business code talks to.
//!
//! Reads go local tier, then shared tier (warming the local tier on a hit),
//! then the caller's compute function. Writes land in both tiers; evictions
//! clear both and fan out over the invalidation bus so peers converge.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::backend::{MessageBroker, RedisStore, SharedStore};
use super::invalidation::InvalidationBus;
use super::key::{CacheKey, CachePattern, KeyConvention};
use super::local::{LocalStats, LocalTier};
use super::lock::{DistributedMutex, LockOptions};
use super::middleware::IdempotencyGuard;
use super::shared::{SharedStats, SharedTier};
use crate::config::{CacheSettings, Settings};
use crate::error::{CacheError, Result};

/// Anything the coordinator can hold in both tiers.
pub trait Cacheable: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

impl<T> Cacheable for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

/// What a stampede-protected read returns when the lock is not acquired.
#[derive(Debug, Clone, PartialEq)]
pub enum LockFallback<T> {
    /// Report absence
    Absent,
    /// Return this value, e.g. an empty map
    Value(T),
    /// Run the compute function anyway, accepting duplicate work
    ComputeUnprotected,
}

/// Point-in-time view of both tiers.
#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorStats {
    pub instance_id: Uuid,
    pub local: LocalStats,
    pub shared: SharedStats,
}

/// Background tasks started by [`HybridCoordinator::start`].
pub struct CoordinatorTasks {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl CoordinatorTasks {
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop every task and wait for it to finish.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for handle in self.handles {
            if let Err(error) = handle.await {
                warn!(error = %error, "Cache background task ended abnormally");
            }
        }
        info!("Cache background tasks stopped");
    }
}

/// Two-tier cache with cross-instance invalidation.
#[derive(Clone)]
pub struct HybridCoordinator {
    local: Arc<LocalTier>,
    shared: Arc<SharedTier>,
    bus: Arc<InvalidationBus>,
    mutex: Arc<DistributedMutex>,
    keys: KeyConvention,
    publish_on_put: bool,
    purge_interval: Duration,
    idempotency_ttl: Duration,
}

impl HybridCoordinator {
    /// Wire the tiers together over explicit store and broker handles.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfiguration` for settings that fail validation,
    /// including a local TTL that is not shorter than the shared TTL.
    pub fn new(
        settings: &CacheSettings,
        store: Arc<dyn SharedStore>,
        broker: Arc<dyn MessageBroker>,
    ) -> Result<Self> {
        settings.validate()?;

        let keys = KeyConvention::from_settings(settings)?;
        let local = Arc::new(LocalTier::from_config(&settings.local));
        let shared = Arc::new(SharedTier::new(store.clone(), &settings.shared));
        if local.ttl() >= shared.default_ttl() {
            return Err(CacheError::invalid_configuration(
                "local TTL must be strictly shorter than shared TTL",
            ));
        }

        let command_timeout = settings.shared.command_timeout;
        let bus = Arc::new(InvalidationBus::new(
            broker,
            &settings.invalidation,
            command_timeout,
            Uuid::new_v4(),
        ));
        let mutex = Arc::new(DistributedMutex::new(
            store,
            &settings.namespace,
            &settings.lock,
            command_timeout,
        ));

        info!(
            namespace = %settings.namespace,
            version = %settings.version,
            instance = %bus.instance_id(),
            local_ttl = ?local.ttl(),
            shared_ttl = ?shared.default_ttl(),
            "Hybrid cache initialized"
        );

        Ok(Self {
            local,
            shared,
            bus,
            mutex,
            keys,
            publish_on_put: settings.invalidation.publish_on_put,
            purge_interval: settings.local.purge_interval,
            idempotency_ttl: settings.idempotency.ttl,
        })
    }

    /// Connect to Redis and build a coordinator over it.
    pub async fn connect_redis(settings: &Settings) -> Result<Self> {
        settings.validate()?;
        let redis = Arc::new(RedisStore::connect(&settings.redis.url).await?);
        Self::new(&settings.cache, redis.clone(), redis)
    }

    /// Start the invalidation subscriber and local tier maintenance.
    pub async fn start(&self) -> CoordinatorTasks {
        let cancel = CancellationToken::new();

        let subscriber = self
            .bus
            .spawn_subscriber(self.local.clone(), cancel.child_token())
            .await;

        let local = self.local.clone();
        let interval = self.purge_interval;
        let shutdown = cancel.child_token();
        let maintenance = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        local.purge_expired();
                    }
                }
            }
        });

        CoordinatorTasks {
            cancel,
            handles: vec![subscriber, maintenance],
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Reads
    // ─────────────────────────────────────────────────────────────────────────

    /// Local tier, then shared tier. A shared hit warms the local tier.
    #[instrument(skip(self), fields(key = %key))]
    pub async fn get<T: Cacheable>(&self, key: &CacheKey) -> Option<T> {
        if let Some(value) = self.local.get::<T>(key.as_str()) {
            debug!("Local tier hit");
            return Some(value);
        }

        let value = self.shared.get::<T>(key.as_str()).await?;
        debug!("Shared tier hit, warming local tier");
        self.local.put(key.as_str(), value.clone());
        Some(value)
    }

    /// [`get`](Self::get), falling back to `compute` on a full miss.
    ///
    /// A computed `Some` is written to both tiers before it is returned.
    /// Errors from `compute` propagate unchanged.
    #[instrument(skip(self, compute), fields(key = %key))]
    pub async fn get_or_compute<T, E, F, Fut>(&self, key: &CacheKey, compute: F) -> std::result::Result<Option<T>, E>
    where
        T: Cacheable,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<Option<T>, E>>,
    {
        if let Some(value) = self.get(key).await {
            return Ok(Some(value));
        }
        self.compute_and_fill(key, compute).await
    }

    /// [`get_or_compute`](Self::get_or_compute) with the compute step
    /// serialized across instances by the distributed mutex.
    ///
    /// After taking the lock the shared tier is checked again, since the
    /// previous holder has usually just filled it. When the lock cannot be
    /// taken within `options.wait`, `fallback` decides the result.
    #[instrument(skip(self, fallback, compute), fields(key = %key))]
    pub async fn get_or_compute_locked<T, E, F, Fut>(
        &self,
        key: &CacheKey,
        options: LockOptions,
        fallback: LockFallback<T>,
        compute: F,
    ) -> std::result::Result<Option<T>, E>
    where
        T: Cacheable,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<Option<T>, E>>,
    {
        if let Some(value) = self.get(key).await {
            return Ok(Some(value));
        }

        let mut slot = Some(compute);
        let guarded = self
            .mutex
            .execute_with_lock(key.as_str(), options.wait, options.lease, || {
                let compute = slot.take();
                async move {
                    if let Some(value) = self.shared.get::<T>(key.as_str()).await {
                        debug!("Filled by previous lock holder");
                        self.local.put(key.as_str(), value.clone());
                        return Ok(Some(value));
                    }
                    match compute {
                        Some(compute) => self.compute_and_fill(key, compute).await,
                        None => Ok(None),
                    }
                }
            })
            .await;

        if let Some(result) = guarded {
            return result;
        }

        if let Some(value) = self.get(key).await {
            return Ok(Some(value));
        }

        match fallback {
            LockFallback::Absent => {
                debug!("Lock not acquired, reporting absence");
                Ok(None)
            }
            LockFallback::Value(value) => {
                debug!("Lock not acquired, returning fallback value");
                Ok(Some(value))
            }
            LockFallback::ComputeUnprotected => match slot.take() {
                Some(compute) => {
                    debug!("Lock not acquired, computing without protection");
                    self.compute_and_fill(key, compute).await
                }
                None => Ok(None),
            },
        }
    }

    async fn compute_and_fill<T, E, F, Fut>(&self, key: &CacheKey, compute: F) -> std::result::Result<Option<T>, E>
    where
        T: Cacheable,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<Option<T>, E>>,
    {
        let computed = compute().await?;
        if let Some(value) = &computed {
            self.write_through(key, value, None).await;
        }
        Ok(computed)
    }

    /// Pull a value from the shared tier into the local tier.
    pub async fn warm_local<T: Cacheable>(&self, key: &CacheKey) -> bool {
        match self.shared.get::<T>(key.as_str()).await {
            Some(value) => {
                self.local.put(key.as_str(), value);
                true
            }
            None => false,
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Writes
    // ─────────────────────────────────────────────────────────────────────────

    /// Write to both tiers with the shared default TTL.
    ///
    /// Returns `false` when the value was refused (JSON `null` or not
    /// serializable). A shared tier outage is not reported.
    #[instrument(skip(self, value), fields(key = %key))]
    pub async fn put<T: Cacheable>(&self, key: &CacheKey, value: T) -> bool {
        self.put_with_ttl(key, value, None).await
    }

    /// Write to both tiers with an explicit shared tier TTL.
    ///
    /// A TTL not longer than the local tier's is refused: the local copy
    /// would outlive the shared one. `None` or zero uses the default.
    pub async fn put_with_ttl<T: Cacheable>(&self, key: &CacheKey, value: T, ttl: Option<Duration>) -> bool {
        if let Some(ttl) = ttl.filter(|ttl| !ttl.is_zero()) {
            if ttl <= self.local.ttl() {
                warn!(
                    key = %key,
                    ttl = ?ttl,
                    local_ttl = ?self.local.ttl(),
                    "Refusing shared TTL not longer than local TTL, write dropped"
                );
                return false;
            }
        }
        if !self.write_through(key, &value, ttl).await {
            return false;
        }
        if self.publish_on_put {
            self.bus.publish_single_key(key).await;
        }
        true
    }

    async fn write_through<T: Cacheable>(&self, key: &CacheKey, value: &T, ttl: Option<Duration>) -> bool {
        let Some(bytes) = SharedTier::encode(key.as_str(), value) else {
            return false;
        };
        self.shared.put_encoded(key.as_str(), &bytes, ttl).await;
        self.local.put(key.as_str(), value.clone());
        true
    }

    /// Remove a key from both tiers and tell peers.
    #[instrument(skip(self), fields(key = %key))]
    pub async fn evict(&self, key: &CacheKey) -> bool {
        let shared = self.shared.evict(key.as_str()).await;
        let local = self.local.evict(key.as_str());
        self.bus.publish_single_key(key).await;
        shared || local
    }

    /// Remove every shared key matching `pattern`, clear the local tier and
    /// tell peers. Returns how many shared keys were removed.
    #[instrument(skip(self), fields(pattern = %pattern))]
    pub async fn evict_pattern(&self, pattern: &CachePattern) -> u64 {
        let deleted = self.shared.evict_pattern(pattern.as_str()).await;
        let cleared = self.local.evict_all();
        self.bus.publish_pattern(pattern).await;
        info!(deleted, cleared, "Pattern eviction");
        deleted
    }

    /// Clear the local tier only. Shared entries age out by TTL.
    pub fn evict_all(&self) -> usize {
        self.local.evict_all()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    pub fn keys(&self) -> &KeyConvention {
        &self.keys
    }

    pub fn local(&self) -> &Arc<LocalTier> {
        &self.local
    }

    pub fn shared(&self) -> &Arc<SharedTier> {
        &self.shared
    }

    pub fn mutex(&self) -> &Arc<DistributedMutex> {
        &self.mutex
    }

    pub fn bus(&self) -> &Arc<InvalidationBus> {
        &self.bus
    }

    pub fn instance_id(&self) -> Uuid {
        self.bus.instance_id()
    }

    /// Idempotency guard over the same shared store.
    pub fn idempotency_guard(&self) -> IdempotencyGuard {
        IdempotencyGuard::new(
            self.shared.store().clone(),
            self.keys.namespace(),
            self.idempotency_ttl,
            self.shared.command_timeout(),
        )
    }

    pub fn stats(&self) -> CoordinatorStats {
        CoordinatorStats {
            instance_id: self.instance_id(),
            local: self.local.stats(),
            shared: self.shared.stats(),
        }
    }
}
