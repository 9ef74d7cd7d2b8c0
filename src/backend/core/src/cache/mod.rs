//! Two-tier cache with cross-instance coherence.
//!
//! - **Local tier (L1)**: bounded, short-TTL, sharded segmented LRU per process
//! - **Shared tier (L2)**: JSON values with TTL in Redis, degrading to misses
//! - **Invalidation bus**: pub/sub "this is stale" events that clear peers' L1
//! - **Distributed mutex**: lease-based lock for stampede-protected compute
//! - **Idempotency guard**: at-most-once request processing over the same store
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                        HybridCoordinator                             │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────┐   ┌──────────────┐   ┌──────────────────────────┐  │
//! │  │ KeyConvention│   │ InvalidationBus│  │     DistributedMutex     │  │
//! │  └─────────────┘   └──────┬───────┘   └────────────┬─────────────┘  │
//! │  ┌─────────────┐   ┌──────┴───────────────────────┴─────────────┐  │
//! │  │  LocalTier  │   │ SharedTier ─► CircuitBreaker                │  │
//! │  │   (L1)      │   └──────┬──────────────────────────────────────┘  │
//! │  └─────────────┘          ▼                                         │
//! │               SharedStore + MessageBroker (Redis / Memory)          │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use vsa_cache::cache::{HybridCoordinator, LockFallback, LockOptions};
//!
//! let cache = HybridCoordinator::connect_redis(&settings).await?;
//! let tasks = cache.start().await;
//!
//! let key = cache.keys().build("user", "123", None).expect("valid key");
//! let user: Option<User> = cache
//!     .get_or_compute(&key, || async { repo.find_user(123).await })
//!     .await?;
//!
//! // Writes and evictions reach every instance.
//! cache.put(&key, updated_user).await;
//! cache.evict_pattern(&cache.keys().build_pattern("user").expect("valid pattern")).await;
//!
//! tasks.shutdown().await;
//! ```

pub mod backend;
pub mod circuit_breaker;
pub mod coordinator;
pub mod invalidation;
pub mod key;
pub mod local;
pub mod lock;
pub mod middleware;
pub mod shared;

pub use backend::{MemoryStore, MessageBroker, RedisStore, SharedStore};
pub use circuit_breaker::{BreakerPermit, CircuitBreaker, CircuitBreakerMetrics, CircuitState};
pub use coordinator::{Cacheable, CoordinatorStats, CoordinatorTasks, HybridCoordinator, LockFallback};
pub use invalidation::{InvalidationBus, InvalidationEvent, InvalidationScope};
pub use key::{glob_matches, CacheKey, CachePattern, KeyConvention};
pub use local::{LocalStats, LocalTier};
pub use lock::{DistributedMutex, LockHandle, LockOptions};
pub use middleware::{IdempotencyGuard, IdempotencyOutcome};
pub use shared::{SharedStats, SharedTier};
