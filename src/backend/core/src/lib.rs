#![allow(clippy::result_large_err)]
//! # VSA Cache
//!
//! Two-tier cache coherence for horizontally scaled services.
//!
//! ## Architecture
//!
//! - **Local Tier**: Per-process sharded segmented LRU with a short fixed TTL
//! - **Shared Tier**: Redis-backed JSON cache that degrades to misses when the store is down
//! - **Invalidation Bus**: Pub/sub events that keep every instance's local tier converging
//! - **Distributed Mutex**: Lease-based lock for stampede-protected recomputation
//! - **Idempotency Guard**: At-most-once request handling over the shared store
//! - **Telemetry**: Structured logging and Prometheus metrics
//!
//! The local TTL is always strictly shorter than the shared TTL, which bounds
//! staleness on a peer that missed an invalidation.

pub mod cache;
pub mod config;
pub mod error;
pub mod telemetry;

pub use error::{CacheError, ErrorCode, ErrorSeverity, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::cache::{
        Cacheable, CacheKey, CachePattern, CoordinatorStats, CoordinatorTasks, DistributedMutex,
        HybridCoordinator, IdempotencyGuard, IdempotencyOutcome, InvalidationEvent, KeyConvention,
        LockFallback, LockHandle, LockOptions, MemoryStore, MessageBroker, RedisStore, SharedStore,
    };
    pub use crate::config::{CacheSettings, Settings};
    pub use crate::error::{CacheError, ErrorCode, ErrorSeverity, Result};
}
