//! Circuit breaker state transitions and how the shared tier reacts to them.
//!
//! Tests cover:
//! - Closed -> Open -> HalfOpen -> Closed transitions
//! - Counter bookkeeping
//! - Concurrent recording
//! - Shared tier calls being skipped while the breaker is open
//! - Cancelled half-open calls and paged pattern deletes

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use vsa_cache::cache::{CircuitBreaker, CircuitState, MemoryStore, SharedTier};
use vsa_cache::config::SharedTierConfig;

fn breaker(threshold: u32) -> CircuitBreaker {
    CircuitBreaker::new("redis", threshold)
}

// ============================================================================
// Creation
// ============================================================================

#[test]
fn test_breaker_starts_closed() {
    for threshold in [1, 3, 5, 100] {
        let breaker = breaker(threshold);
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.can_execute());
    }
}

#[test]
fn test_zero_threshold_is_clamped_to_one() {
    let breaker = breaker(0);

    assert_eq!(breaker.metrics().failure_threshold, 1);
    breaker.record_failure();
    assert_eq!(breaker.state(), CircuitState::Open);
}

// ============================================================================
// Transitions
// ============================================================================

#[test]
fn test_open_blocks_until_recovery_timeout() {
    let breaker = breaker(2).with_recovery_timeout(Duration::from_secs(60));

    breaker.record_failure();
    breaker.record_failure();

    for _ in 0..5 {
        assert!(!breaker.can_execute());
    }
    assert_eq!(breaker.metrics().total_rejections, 5);
}

#[test]
fn test_failures_while_open_are_counted_but_do_not_extend() {
    let breaker = breaker(1).with_recovery_timeout(Duration::from_millis(20));

    breaker.record_failure();
    thread::sleep(Duration::from_millis(10));
    breaker.record_failure();
    thread::sleep(Duration::from_millis(15));

    assert!(breaker.can_execute());
    assert_eq!(breaker.state(), CircuitState::HalfOpen);
    assert_eq!(breaker.metrics().total_failures, 2);
}

#[test]
fn test_full_recovery_cycle() {
    let breaker = breaker(3).with_recovery_timeout(Duration::from_millis(10));

    for _ in 0..3 {
        breaker.record_failure();
    }
    assert_eq!(breaker.state(), CircuitState::Open);

    thread::sleep(Duration::from_millis(20));
    assert!(breaker.can_execute());
    assert_eq!(breaker.state(), CircuitState::HalfOpen);

    breaker.record_success();
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert_eq!(breaker.metrics().consecutive_failures, 0);

    // Needs a full threshold of failures again to trip.
    breaker.record_failure();
    breaker.record_failure();
    assert_eq!(breaker.state(), CircuitState::Closed);
}

#[test]
fn test_reset_closes_open_breaker() {
    let breaker = breaker(1);

    breaker.record_failure();
    assert!(!breaker.can_execute());

    breaker.reset();
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert!(breaker.can_execute());
}

// ============================================================================
// Concurrency
// ============================================================================

#[test]
fn test_concurrent_recording_keeps_totals() {
    let breaker = Arc::new(breaker(1_000_000));

    let handles: Vec<_> = (0..8)
        .map(|n| {
            let breaker = breaker.clone();
            thread::spawn(move || {
                for _ in 0..100 {
                    if n % 2 == 0 {
                        breaker.record_success();
                    } else {
                        breaker.record_failure();
                    }
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    let metrics = breaker.metrics();
    assert_eq!(metrics.total_successes, 400);
    assert_eq!(metrics.total_failures, 400);
    assert_eq!(metrics.state, CircuitState::Closed);
}

// ============================================================================
// Shared Tier
// ============================================================================

fn shared_config() -> SharedTierConfig {
    SharedTierConfig {
        command_timeout: Duration::from_millis(50),
        circuit_breaker_threshold: 2,
        circuit_breaker_recovery: Duration::from_millis(100),
        ..SharedTierConfig::default()
    }
}

#[tokio::test]
async fn test_shared_tier_opens_breaker_when_store_is_down() {
    let store = Arc::new(MemoryStore::new());
    let shared = SharedTier::new(store.clone(), &shared_config());
    store.set_available(false);

    assert_eq!(shared.get::<String>("vsa:v1:user::1").await, None);
    assert_eq!(shared.get::<String>("vsa:v1:user::1").await, None);
    assert_eq!(shared.stats().breaker.state, CircuitState::Open);

    // Skipped without touching the store.
    assert!(!shared.put("vsa:v1:user::1", &"ada", None).await);
    assert_eq!(shared.stats().breaker.total_rejections, 1);
    assert_eq!(shared.stats().degraded, 3);
}

#[tokio::test]
async fn test_shared_tier_recovers_after_trial_call() {
    let store = Arc::new(MemoryStore::new());
    let shared = SharedTier::new(store.clone(), &shared_config());
    store.set_available(false);

    shared.get::<String>("vsa:v1:user::1").await;
    shared.get::<String>("vsa:v1:user::1").await;
    assert_eq!(shared.stats().breaker.state, CircuitState::Open);

    store.set_available(true);
    tokio::time::sleep(Duration::from_millis(150)).await;

    assert!(shared.put("vsa:v1:user::1", &"ada", None).await);
    assert_eq!(shared.stats().breaker.state, CircuitState::Closed);
    assert_eq!(shared.get::<String>("vsa:v1:user::1").await.as_deref(), Some("ada"));
}

#[tokio::test]
async fn test_slow_store_counts_as_failure() {
    let store = Arc::new(MemoryStore::new());
    let shared = SharedTier::new(store.clone(), &shared_config());
    store.set_latency(Duration::from_millis(500));

    assert!(!shared.exists("vsa:v1:user::1").await);
    assert_eq!(shared.stats().breaker.consecutive_failures, 1);
}

#[tokio::test]
async fn test_cancelled_half_open_call_does_not_wedge_breaker() {
    let store = Arc::new(MemoryStore::new());
    let config = SharedTierConfig {
        circuit_breaker_recovery: Duration::from_millis(60),
        ..shared_config()
    };
    let shared = SharedTier::new(store.clone(), &config);
    store.set_available(false);

    shared.get::<String>("vsa:v1:user::1").await;
    shared.get::<String>("vsa:v1:user::1").await;
    assert_eq!(shared.stats().breaker.state, CircuitState::Open);

    tokio::time::sleep(Duration::from_millis(80)).await;
    store.set_available(true);
    store.set_latency(Duration::from_millis(200));

    // The caller gives up on the recovery call while it is still in flight.
    let abandoned =
        tokio::time::timeout(Duration::from_millis(10), shared.get::<String>("vsa:v1:user::1")).await;
    assert!(abandoned.is_err());
    assert_eq!(shared.stats().breaker.state, CircuitState::HalfOpen);

    store.set_latency(Duration::ZERO);
    assert!(shared.put("vsa:v1:user::1", &"ada", None).await);
    assert_eq!(shared.stats().breaker.state, CircuitState::Closed);
}

#[tokio::test]
async fn test_pattern_delete_bounds_each_page_not_the_whole_walk() {
    let store = Arc::new(MemoryStore::new());
    let shared = SharedTier::new(
        store.clone(),
        &SharedTierConfig {
            command_timeout: Duration::from_millis(100),
            ..shared_config()
        },
    );
    for n in 0..250 {
        store.insert_raw(&format!("vsa:v1:user::{}", n), "x");
    }
    store.insert_raw("vsa:v1:order::1", "x");
    // Three pages at 40ms each exceed one command timeout in total.
    store.set_latency(Duration::from_millis(40));

    assert_eq!(shared.evict_pattern("vsa:v1:user:*").await, 250);
    assert_eq!(shared.stats().breaker.state, CircuitState::Closed);
    assert_eq!(shared.stats().breaker.consecutive_failures, 0);
    assert_eq!(store.len(), 1);
}

#[tokio::test]
async fn test_pattern_delete_keeps_partial_count_when_store_drops() {
    let store = Arc::new(MemoryStore::new());
    let shared = SharedTier::new(
        store.clone(),
        &SharedTierConfig {
            command_timeout: Duration::from_millis(100),
            ..shared_config()
        },
    );
    for n in 0..250 {
        store.insert_raw(&format!("vsa:v1:user::{}", n), "x");
    }
    store.set_latency(Duration::from_millis(40));

    let evicting = shared.evict_pattern("vsa:v1:user:*");
    let outage = async {
        tokio::time::sleep(Duration::from_millis(60)).await;
        store.set_available(false);
    };
    let (deleted, ()) = tokio::join!(evicting, outage);

    assert_eq!(deleted, 100);
    assert_eq!(store.len(), 150);
}
