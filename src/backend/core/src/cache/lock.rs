//! Lease-based distributed mutex over the shared store.
//!
//! Acquisition is `SET {ns}:lock:{key} <token> NX PX <lease>`, retried every
//! `retry_interval` until `wait` runs out. A crashed holder cannot wedge the
//! lock: the lease expires on its own. Release and extension are
//! compare-and-act on the token, so a holder whose lease already lapsed can
//! never release or extend somebody else's lock.

use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

use super::backend::SharedStore;
use crate::config::LockConfig;
use crate::telemetry::metrics::CacheMetrics;

/// Wait and lease for one acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockOptions {
    /// How long to keep trying before giving up
    pub wait: Duration,
    /// How long the lock lives if never released
    pub lease: Duration,
}

impl LockOptions {
    pub fn new(wait: Duration, lease: Duration) -> Self {
        Self { wait, lease }
    }

    pub fn from_config(config: &LockConfig) -> Self {
        Self {
            wait: config.wait,
            lease: config.lease,
        }
    }
}

/// Proof of holding a lock. Released by value, so at most once.
#[derive(Debug)]
pub struct LockHandle {
    lock_key: String,
    token: String,
    lease_expiry: Instant,
}

impl LockHandle {
    /// Full store key, namespace prefix included.
    pub fn lock_key(&self) -> &str {
        &self.lock_key
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// When the lease runs out unless extended.
    pub fn lease_expiry(&self) -> Instant {
        self.lease_expiry
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.lease_expiry
    }
}

/// Cross-instance mutual exclusion with lease expiry.
pub struct DistributedMutex {
    store: Arc<dyn SharedStore>,
    prefix: String,
    defaults: LockOptions,
    retry_interval: Duration,
    command_timeout: Duration,
}

impl DistributedMutex {
    pub fn new(
        store: Arc<dyn SharedStore>,
        namespace: &str,
        config: &LockConfig,
        command_timeout: Duration,
    ) -> Self {
        Self {
            store,
            prefix: format!("{}:lock:", namespace),
            defaults: LockOptions::from_config(config),
            retry_interval: config.retry_interval,
            command_timeout,
        }
    }

    pub fn defaults(&self) -> LockOptions {
        self.defaults
    }

    /// Store key guarding `lock_key`.
    pub fn full_key(&self, lock_key: &str) -> String {
        format!("{}{}", self.prefix, lock_key)
    }

    /// Take the lock within `wait`, or give up and return `None`.
    ///
    /// The returned handle is the only way to unlock, so a caller that did
    /// not get one cannot release somebody else's lock. Store failures while
    /// polling count as "not acquired this round".
    pub async fn try_lock(&self, lock_key: &str, wait: Duration, lease: Duration) -> Option<LockHandle> {
        if lock_key.trim().is_empty() {
            warn!("Refusing to lock a blank key");
            return None;
        }

        let lease = if lease.is_zero() { self.defaults.lease } else { lease };
        let full_key = self.full_key(lock_key);
        let token = Uuid::new_v4().to_string();
        let started = Instant::now();
        let deadline = started + wait;

        loop {
            let attempt = tokio::time::timeout(
                self.command_timeout,
                self.store.set_if_absent(&full_key, token.as_bytes(), lease),
            )
            .await;

            match attempt {
                Ok(Ok(true)) => {
                    let waited = started.elapsed();
                    CacheMetrics::lock_acquired(waited);
                    debug!(lock_key = %full_key, waited = ?waited, lease = ?lease, "Lock acquired");
                    return Some(LockHandle {
                        lock_key: full_key,
                        token,
                        lease_expiry: Instant::now() + lease,
                    });
                }
                Ok(Ok(false)) => {}
                Ok(Err(error)) => {
                    warn!(lock_key = %full_key, error = %error, "Lock attempt failed");
                }
                Err(_) => {
                    warn!(lock_key = %full_key, timeout = ?self.command_timeout, "Lock attempt timed out");
                }
            }

            let now = Instant::now();
            if now >= deadline {
                let waited = started.elapsed();
                CacheMetrics::lock_timeout(waited);
                debug!(lock_key = %full_key, waited = ?waited, "Lock not acquired within wait time");
                return None;
            }
            tokio::time::sleep(self.retry_interval.min(deadline - now)).await;
        }
    }

    /// Release a lock. A no-op returning `false` when the lease already
    /// lapsed, whether or not another holder has taken it since.
    pub async fn unlock(&self, handle: LockHandle) -> bool {
        self.release_token(&handle.lock_key, &handle.token).await
    }

    async fn release_token(&self, full_key: &str, token: &str) -> bool {
        let released = tokio::time::timeout(
            self.command_timeout,
            self.store.delete_if_equals(full_key, token.as_bytes()),
        )
        .await;

        match released {
            Ok(Ok(true)) => {
                debug!(lock_key = %full_key, "Lock released");
                true
            }
            Ok(Ok(false)) => {
                debug!(lock_key = %full_key, "Lock already expired or taken over, nothing released");
                false
            }
            Ok(Err(error)) => {
                warn!(lock_key = %full_key, error = %error, "Lock release failed, lease will expire it");
                false
            }
            Err(_) => {
                warn!(lock_key = %full_key, "Lock release timed out, lease will expire it");
                false
            }
        }
    }

    /// Push the lease out to `lease` from now, if still held.
    pub async fn extend(&self, handle: &mut LockHandle, lease: Duration) -> bool {
        let extended = tokio::time::timeout(
            self.command_timeout,
            self.store
                .expire_if_equals(&handle.lock_key, handle.token.as_bytes(), lease),
        )
        .await;

        match extended {
            Ok(Ok(true)) => {
                handle.lease_expiry = Instant::now() + lease;
                true
            }
            Ok(Ok(false)) => false,
            Ok(Err(error)) => {
                warn!(lock_key = %handle.lock_key, error = %error, "Lock extension failed");
                false
            }
            Err(_) => {
                warn!(lock_key = %handle.lock_key, "Lock extension timed out");
                false
            }
        }
    }

    /// Advisory: someone held the lock at the time of the check.
    pub async fn is_locked(&self, lock_key: &str) -> bool {
        let full_key = self.full_key(lock_key);
        match tokio::time::timeout(self.command_timeout, self.store.exists(&full_key)).await {
            Ok(Ok(held)) => held,
            Ok(Err(error)) => {
                warn!(lock_key = %full_key, error = %error, "Lock status check failed");
                false
            }
            Err(_) => false,
        }
    }

    /// Run `f` while holding the lock. `None` if the lock was not acquired
    /// within `wait`.
    ///
    /// The lock is released on every exit path. A panic inside `f` is
    /// re-raised after release; if the returned future is dropped midway the
    /// release is handed to a background task.
    pub async fn execute_with_lock<T, F, Fut>(
        &self,
        lock_key: &str,
        wait: Duration,
        lease: Duration,
        f: F,
    ) -> Option<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let handle = self.try_lock(lock_key, wait, lease).await?;
        let mut guard = ReleaseOnDrop {
            store: self.store.clone(),
            handle: Some(handle),
        };

        let outcome = AssertUnwindSafe(f()).catch_unwind().await;

        if let Some(handle) = guard.handle.take() {
            self.unlock(handle).await;
        }

        match outcome {
            Ok(value) => Some(value),
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}

/// Releases a still-held lock when its owner future is dropped.
struct ReleaseOnDrop {
    store: Arc<dyn SharedStore>,
    handle: Option<LockHandle>,
}

impl Drop for ReleaseOnDrop {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let store = self.store.clone();
                runtime.spawn(async move {
                    let _ = store
                        .delete_if_equals(&handle.lock_key, handle.token.as_bytes())
                        .await;
                });
            }
            Err(_) => {
                debug!(lock_key = %handle.lock_key, "No runtime to release lock, lease will expire it");
            }
        }
    }
}
