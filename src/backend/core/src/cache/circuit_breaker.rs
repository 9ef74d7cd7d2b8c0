//! Circuit breaker in front of the shared store.
//!
//! After `failure_threshold` consecutive failures the breaker opens and
//! store calls are skipped outright (the shared tier reports them as misses
//! or dropped writes) until `recovery_timeout` has passed. Then a single
//! trial call is let through: success closes the breaker, failure re-opens
//! it. A trial call whose caller goes away without reporting frees its slot,
//! and one that stays unreported for a whole recovery timeout is superseded.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::telemetry::metrics::{BreakerGauge, CacheMetrics};

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - requests allowed
    Closed,
    /// Too many failures - requests blocked
    Open,
    /// Recovery call in flight - other requests blocked
    HalfOpen,
}

struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_started: Option<Instant>,
}

/// Consecutive-failure circuit breaker.
pub struct CircuitBreaker {
    name: String,
    inner: Mutex<BreakerState>,
    failure_threshold: u32,
    recovery_timeout: Duration,
    total_successes: AtomicU64,
    total_failures: AtomicU64,
    total_rejections: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, failure_threshold: u32) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                trial_started: None,
            }),
            failure_threshold: failure_threshold.max(1),
            recovery_timeout: Duration::from_secs(30),
            total_successes: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            total_rejections: AtomicU64::new(0),
        }
    }

    /// Create with custom recovery timeout.
    pub fn with_recovery_timeout(mut self, timeout: Duration) -> Self {
        self.recovery_timeout = timeout;
        self
    }

    /// Check if a call may go through. Must be paired with a `record_*`.
    pub fn can_execute(&self) -> bool {
        let mut inner = self.inner.lock();

        let allowed = match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed() >= self.recovery_timeout)
                    .unwrap_or(true);
                if elapsed {
                    inner.state = CircuitState::HalfOpen;
                    inner.trial_started = Some(Instant::now());
                    CacheMetrics::breaker_state(&self.name, BreakerGauge::HalfOpen);
                    tracing::info!(store = %self.name, "Circuit breaker half-open, letting one call through");
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                let stale = inner
                    .trial_started
                    .map(|at| at.elapsed() >= self.recovery_timeout)
                    .unwrap_or(true);
                if stale {
                    inner.trial_started = Some(Instant::now());
                }
                stale
            }
        };

        if !allowed {
            self.total_rejections.fetch_add(1, Ordering::Relaxed);
        }
        allowed
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        self.total_successes.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock();

        inner.consecutive_failures = 0;
        inner.trial_started = None;
        if inner.state != CircuitState::Closed {
            inner.state = CircuitState::Closed;
            inner.opened_at = None;
            CacheMetrics::breaker_state(&self.name, BreakerGauge::Closed);
            tracing::info!(store = %self.name, "Circuit breaker closed, store recovered");
        }
    }

    /// Record a failed call.
    pub fn record_failure(&self) {
        self.total_failures.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock();

        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                inner.trial_started = None;
                CacheMetrics::breaker_state(&self.name, BreakerGauge::Open);
                tracing::warn!(store = %self.name, "Circuit breaker re-opened, recovery call failed");
            }
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                    CacheMetrics::breaker_state(&self.name, BreakerGauge::Open);
                    CacheMetrics::breaker_trip(&self.name);
                    tracing::warn!(
                        store = %self.name,
                        failures = inner.consecutive_failures,
                        threshold = self.failure_threshold,
                        recovery_timeout = ?self.recovery_timeout,
                        "Circuit breaker opened due to consecutive failures"
                    );
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Give up a call admitted by [`can_execute`](Self::can_execute)
    /// without an outcome. A half-open trial slot is handed to the next caller.
    pub fn abandon(&self) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen && inner.trial_started.is_some() {
            inner.trial_started = None;
            tracing::debug!(store = %self.name, "Recovery call abandoned");
        }
    }

    /// [`can_execute`](Self::can_execute) as a guard that abandons the call
    /// when dropped unreported.
    pub fn permit(&self) -> Option<BreakerPermit<'_>> {
        self.can_execute().then_some(BreakerPermit {
            breaker: self,
            settled: false,
        })
    }

    /// Get current state.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let inner = self.inner.lock();
        CircuitBreakerMetrics {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            failure_threshold: self.failure_threshold,
            total_successes: self.total_successes.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            total_rejections: self.total_rejections.load(Ordering::Relaxed),
        }
    }

    /// Force the breaker closed.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.trial_started = None;
        CacheMetrics::breaker_state(&self.name, BreakerGauge::Closed);
        tracing::info!(store = %self.name, "Circuit breaker manually reset");
    }
}

/// An admitted call. Report it with `success` or `failure`; dropping it
/// unreported abandons it.
pub struct BreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    settled: bool,
}

impl BreakerPermit<'_> {
    pub fn success(mut self) {
        self.settled = true;
        self.breaker.record_success();
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.record_failure();
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.abandon();
        }
    }
}

/// Snapshot of breaker counters.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerMetrics {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub failure_threshold: u32,
    pub total_successes: u64,
    pub total_failures: u64,
    /// Calls skipped because the breaker was open
    pub total_rejections: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_circuit_breaker_trips_on_failures() {
        let breaker = CircuitBreaker::new("test", 3);

        assert!(breaker.can_execute());
        assert_eq!(breaker.state(), CircuitState::Closed);

        breaker.record_failure();
        breaker.record_failure();
        assert!(breaker.can_execute());

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.can_execute());
        assert_eq!(breaker.metrics().total_rejections, 1);
    }

    #[test]
    fn test_circuit_breaker_resets_on_success() {
        let breaker = CircuitBreaker::new("test", 3);

        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();

        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_circuit_breaker_half_open_recovery() {
        let breaker = CircuitBreaker::new("test", 1).with_recovery_timeout(Duration::from_millis(10));

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        std::thread::sleep(Duration::from_millis(20));

        assert!(breaker.can_execute());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        // Only one trial call at a time.
        assert!(!breaker.can_execute());

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.can_execute());
    }

    #[test]
    fn test_circuit_breaker_failed_trial_reopens() {
        let breaker = CircuitBreaker::new("test", 1).with_recovery_timeout(Duration::from_millis(10));

        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(20));
        assert!(breaker.can_execute());

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.can_execute());
    }

    #[test]
    fn test_circuit_breaker_manual_reset() {
        let breaker = CircuitBreaker::new("test", 1);
        breaker.record_failure();
        assert!(!breaker.can_execute());

        breaker.reset();
        assert!(breaker.can_execute());
        assert_eq!(breaker.metrics().consecutive_failures, 0);
    }

    #[test]
    fn test_dropped_permit_frees_half_open_slot() {
        let breaker = CircuitBreaker::new("test", 1).with_recovery_timeout(Duration::from_millis(50));
        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(60));

        let permit = breaker.permit();
        assert!(permit.is_some());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(breaker.permit().is_none());

        drop(permit);

        let next = breaker.permit().expect("slot handed to next caller");
        next.success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_settled_permit_is_not_abandoned() {
        let breaker = CircuitBreaker::new("test", 1).with_recovery_timeout(Duration::from_millis(10));
        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(20));

        breaker.permit().unwrap().failure();

        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(breaker.permit().is_none());
    }

    #[test]
    fn test_stale_trial_call_expires_after_recovery_timeout() {
        let breaker = CircuitBreaker::new("test", 1).with_recovery_timeout(Duration::from_millis(10));
        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(20));

        // Admitted but never reported.
        assert!(breaker.can_execute());
        assert!(!breaker.can_execute());

        std::thread::sleep(Duration::from_millis(20));
        assert!(breaker.can_execute());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn test_abandon_outside_half_open_is_noop() {
        let breaker = CircuitBreaker::new("test", 1);
        breaker.abandon();
        assert_eq!(breaker.state(), CircuitState::Closed);

        breaker.record_failure();
        breaker.abandon();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.can_execute());
    }
}
