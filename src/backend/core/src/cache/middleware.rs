//! Idempotency guard.
//!
//! Wraps a handler so that a request key is processed at most once per TTL
//! window across every instance sharing the store:
//!
//! - The first caller claims `{ns}:idem:{key}` with `SET NX PX ttl` and runs
//!   the handler
//! - Any caller that finds the claim taken gets [`IdempotencyOutcome::Duplicate`]
//! - A handler error or panic releases the claim so a retry can proceed
//! - If the store cannot be reached the handler runs unguarded
//!
//! ```rust,ignore
//! let guard = coordinator.idempotency_guard();
//! let key = IdempotencyGuard::fingerprint(&["POST", "/orders", &body_hash]);
//!
//! match guard.run(&key, || create_order(request)).await? {
//!     IdempotencyOutcome::Executed(order) => Ok(order),
//!     IdempotencyOutcome::Duplicate => Err(AlreadyProcessed),
//! }
//! ```

use futures::FutureExt;
use sha2::{Digest, Sha256};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use super::backend::SharedStore;
use crate::telemetry::metrics::CacheMetrics;

/// Result of a guarded call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdempotencyOutcome<T> {
    /// The handler ran and produced this value
    Executed(T),
    /// Another call already claimed this key
    Duplicate,
}

impl<T> IdempotencyOutcome<T> {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate)
    }

    pub fn into_option(self) -> Option<T> {
        match self {
            Self::Executed(value) => Some(value),
            Self::Duplicate => None,
        }
    }
}

/// At-most-once execution per request key.
pub struct IdempotencyGuard {
    store: Arc<dyn SharedStore>,
    prefix: String,
    ttl: Duration,
    command_timeout: Duration,
}

enum Claim {
    Taken(String),
    Duplicate,
    Unavailable,
}

impl IdempotencyGuard {
    pub fn new(
        store: Arc<dyn SharedStore>,
        namespace: &str,
        ttl: Duration,
        command_timeout: Duration,
    ) -> Self {
        Self {
            store,
            prefix: format!("{}:idem:", namespace),
            ttl,
            command_timeout,
        }
    }

    /// Store key holding the claim for `key`.
    pub fn claim_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    /// Stable request key from its parts (SHA-256, hex).
    pub fn fingerprint(parts: &[&str]) -> String {
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update(part.as_bytes());
            hasher.update([0x1f]);
        }
        hex::encode(hasher.finalize())
    }

    /// Run `handler` unless `key` was already claimed.
    ///
    /// Handler errors propagate unchanged after the claim is released.
    #[instrument(skip(self, handler), fields(key = %key))]
    pub async fn run<T, E, F, Fut>(&self, key: &str, handler: F) -> Result<IdempotencyOutcome<T>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if key.trim().is_empty() {
            warn!("Blank idempotency key, running handler unguarded");
            CacheMetrics::idempotency("unguarded");
            return handler().await.map(IdempotencyOutcome::Executed);
        }

        let claim_key = self.claim_key(key);
        let token = match self.claim(&claim_key).await {
            Claim::Taken(token) => token,
            Claim::Duplicate => {
                debug!(claim_key = %claim_key, "Duplicate request suppressed");
                CacheMetrics::idempotency("duplicate");
                return Ok(IdempotencyOutcome::Duplicate);
            }
            Claim::Unavailable => {
                CacheMetrics::idempotency("unguarded");
                return handler().await.map(IdempotencyOutcome::Executed);
            }
        };

        match AssertUnwindSafe(handler()).catch_unwind().await {
            Ok(Ok(value)) => {
                CacheMetrics::idempotency("executed");
                Ok(IdempotencyOutcome::Executed(value))
            }
            Ok(Err(error)) => {
                self.release(&claim_key, &token).await;
                Err(error)
            }
            Err(panic) => {
                self.release(&claim_key, &token).await;
                std::panic::resume_unwind(panic)
            }
        }
    }

    async fn claim(&self, claim_key: &str) -> Claim {
        let token = Uuid::new_v4().to_string();
        let attempt = tokio::time::timeout(
            self.command_timeout,
            self.store.set_if_absent(claim_key, token.as_bytes(), self.ttl),
        )
        .await;

        match attempt {
            Ok(Ok(true)) => Claim::Taken(token),
            Ok(Ok(false)) => Claim::Duplicate,
            Ok(Err(error)) => {
                warn!(claim_key = %claim_key, error = %error, "Idempotency claim failed, running handler unguarded");
                Claim::Unavailable
            }
            Err(_) => {
                warn!(claim_key = %claim_key, timeout = ?self.command_timeout, "Idempotency claim timed out, running handler unguarded");
                Claim::Unavailable
            }
        }
    }

    async fn release(&self, claim_key: &str, token: &str) {
        let released = tokio::time::timeout(
            self.command_timeout,
            self.store.delete_if_equals(claim_key, token.as_bytes()),
        )
        .await;

        match released {
            Ok(Ok(_)) => {
                debug!(claim_key = %claim_key, "Idempotency claim released after failure");
                CacheMetrics::idempotency("released");
            }
            Ok(Err(error)) => {
                warn!(claim_key = %claim_key, error = %error, "Idempotency claim release failed, it expires with its TTL");
            }
            Err(_) => {
                warn!(claim_key = %claim_key, "Idempotency claim release timed out, it expires with its TTL");
            }
        }
    }

    /// Whether `key` is currently claimed.
    pub async fn is_claimed(&self, key: &str) -> bool {
        let claim_key = self.claim_key(key);
        matches!(
            tokio::time::timeout(self.command_timeout, self.store.exists(&claim_key)).await,
            Ok(Ok(true))
        )
    }

    /// Drop a claim so the key can be processed again.
    pub async fn forget(&self, key: &str) -> bool {
        let claim_key = self.claim_key(key);
        matches!(
            tokio::time::timeout(self.command_timeout, self.store.delete(&claim_key)).await,
            Ok(Ok(true))
        )
    }
}
