//! Integration tests for the two-tier cache.
//!
//! Every test runs several coordinators over one shared `MemoryStore`, which
//! stands in for Redis the way separate service instances share it.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use vsa_cache::cache::{
    CacheKey, HybridCoordinator, IdempotencyOutcome, InvalidationEvent, InvalidationScope,
    KeyConvention, LockFallback, LockOptions, MemoryStore, MessageBroker,
};
use vsa_cache::config::CacheSettings;

// ============================================================================
// Test Utilities
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct UserProfile {
    id: u64,
    name: String,
}

fn profile(id: u64, name: &str) -> UserProfile {
    UserProfile {
        id,
        name: name.to_string(),
    }
}

fn test_settings() -> CacheSettings {
    let mut settings = CacheSettings::default();
    settings.shared.command_timeout = Duration::from_millis(100);
    settings.lock.retry_interval = Duration::from_millis(10);
    settings.invalidation.reconnect_backoff = Duration::from_millis(10);
    settings.invalidation.max_reconnect_backoff = Duration::from_millis(50);
    settings
}

fn instance(store: &Arc<MemoryStore>) -> HybridCoordinator {
    HybridCoordinator::new(&test_settings(), store.clone(), store.clone()).unwrap()
}

fn user_key(cache: &HybridCoordinator, id: &str) -> CacheKey {
    cache.keys().build("user", id, None).unwrap()
}

async fn next_applied(receiver: &mut tokio::sync::broadcast::Receiver<InvalidationEvent>) -> InvalidationEvent {
    tokio::time::timeout(Duration::from_secs(1), receiver.recv())
        .await
        .expect("invalidation event not applied in time")
        .expect("applied event channel closed")
}

// ============================================================================
// Key Convention
// ============================================================================

#[test]
fn test_key_and_pattern_literals() {
    let keys = KeyConvention::new("vsa", "v1").unwrap();

    let key = keys.build("user", "123", None).unwrap();
    assert_eq!(key.as_str(), "vsa:v1:user::123");
    assert_eq!(keys.build_pattern("user").unwrap().as_str(), "vsa:v1:user:*");
    assert_eq!(
        keys.build_tenant_pattern("user", "acme").unwrap().as_str(),
        "vsa:v1:user:acme:*"
    );
    assert_eq!(keys.parse_identifier(key.as_str()).as_deref(), Some("123"));
    assert_eq!(keys.parse_resource("garbage"), None);
}

// ============================================================================
// Tier Behavior
// ============================================================================

#[tokio::test]
async fn test_local_tier_takes_precedence() {
    let store = Arc::new(MemoryStore::new());
    let cache = instance(&store);
    let key = user_key(&cache, "1");

    cache.put(&key, profile(1, "local")).await;
    cache.shared().put(key.as_str(), &profile(1, "shared"), None).await;

    assert_eq!(cache.get::<UserProfile>(&key).await, Some(profile(1, "local")));
}

#[tokio::test]
async fn test_shared_hit_warms_local_tier() {
    let store = Arc::new(MemoryStore::new());
    let cache = instance(&store);
    let key = user_key(&cache, "2");

    cache.shared().put(key.as_str(), &profile(2, "ada"), None).await;
    assert!(cache.local().get::<UserProfile>(key.as_str()).is_none());

    assert_eq!(cache.get::<UserProfile>(&key).await, Some(profile(2, "ada")));
    assert_eq!(
        cache.local().get::<UserProfile>(key.as_str()),
        Some(profile(2, "ada"))
    );
}

#[tokio::test]
async fn test_get_or_compute_runs_once() {
    let store = Arc::new(MemoryStore::new());
    let cache = instance(&store);
    let key = user_key(&cache, "3");
    let calls = AtomicU32::new(0);

    for _ in 0..2 {
        let value: Result<Option<UserProfile>, String> = cache
            .get_or_compute(&key, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(Some(profile(3, "grace")))
            })
            .await;
        assert_eq!(value, Ok(Some(profile(3, "grace"))));
    }

    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_evict_clears_both_tiers() {
    let store = Arc::new(MemoryStore::new());
    let cache = instance(&store);
    let key = user_key(&cache, "4");

    cache.put(&key, profile(4, "linus")).await;
    assert!(cache.evict(&key).await);

    assert_eq!(cache.get::<UserProfile>(&key).await, None);
    assert!(!cache.local().contains(key.as_str()));
    assert!(!cache.shared().exists(key.as_str()).await);

    // Idempotent
    assert!(!cache.evict(&key).await);
}

#[tokio::test]
async fn test_rejects_local_ttl_not_shorter_than_shared() {
    let store = Arc::new(MemoryStore::new());

    let mut equal = test_settings();
    equal.local.ttl_secs = 1800;
    equal.shared.default_ttl_minutes = 30;
    tokio_test::assert_err!(equal.validate());
    assert!(HybridCoordinator::new(&equal, store.clone(), store.clone()).is_err());

    let mut longer = test_settings();
    longer.local.ttl_secs = 7200;
    longer.shared.default_ttl_minutes = 30;
    tokio_test::assert_err!(longer.validate());

    let mut shorter = test_settings();
    shorter.local.ttl_secs = 1799;
    shorter.shared.default_ttl_minutes = 30;
    tokio_test::assert_ok!(shorter.validate());
    assert!(HybridCoordinator::new(&shorter, store.clone(), store).is_ok());
}

#[tokio::test]
async fn test_short_lived_entry_never_outlives_shared_tier() {
    let store = Arc::new(MemoryStore::new());
    let cache = instance(&store);
    let key = user_key(&cache, "otp");

    let written = cache
        .put_with_ttl(&key, "secret".to_string(), Some(Duration::from_millis(50)))
        .await;
    tokio::time::sleep(Duration::from_millis(120)).await;

    assert!(!written);
    assert!(!cache.shared().exists(key.as_str()).await);
    assert_eq!(cache.get::<String>(&key).await, None);
}

#[tokio::test]
async fn test_incompatible_cached_shape_self_heals() {
    let store = Arc::new(MemoryStore::new());
    let cache = instance(&store);
    let key = user_key(&cache, "5");

    // Written by an older deploy with a different shape.
    cache.put(&key, vec![1u32, 2, 3]).await;

    assert_eq!(cache.get::<UserProfile>(&key).await, None);
    assert!(!cache.local().contains(key.as_str()));
    assert!(!cache.shared().exists(key.as_str()).await);
}

// ============================================================================
// Distributed Mutex
// ============================================================================

#[tokio::test]
async fn test_mutex_serializes_concurrent_increments() {
    let store = Arc::new(MemoryStore::new());
    let instances = [instance(&store), instance(&store)];
    let counter = Arc::new(AtomicU64::new(0));

    let mut tasks = Vec::new();
    for n in 0..10 {
        let cache = instances[n % 2].clone();
        let counter = counter.clone();
        tasks.push(tokio::spawn(async move {
            cache
                .mutex()
                .execute_with_lock("counter", Duration::from_secs(5), Duration::from_secs(5), || async {
                    // Unsynchronized read-modify-write; only the lock keeps it whole.
                    let current = counter.load(Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    counter.store(current + 1, Ordering::SeqCst);
                })
                .await
        }));
    }

    for task in tasks {
        assert!(task.await.unwrap().is_some());
    }
    assert_eq!(counter.load(Ordering::SeqCst), 10);
}

#[tokio::test]
async fn test_lock_wait_bounds_second_caller() {
    let store = Arc::new(MemoryStore::new());
    let holder = instance(&store);
    let contender = instance(&store);

    let held = holder
        .mutex()
        .try_lock("report", Duration::from_millis(10), Duration::from_secs(60))
        .await
        .unwrap();

    let started = Instant::now();
    let result = contender
        .mutex()
        .execute_with_lock("report", Duration::from_millis(200), Duration::from_secs(60), || async { 1 })
        .await;
    let waited = started.elapsed();

    assert_eq!(result, None);
    assert!(waited >= Duration::from_millis(200));
    assert!(waited < Duration::from_secs(2));
    assert!(contender.mutex().is_locked("report").await);

    assert!(holder.mutex().unlock(held).await);
    assert!(!contender.mutex().is_locked("report").await);
}

#[tokio::test]
async fn test_expired_holder_cannot_release_successor() {
    let store = Arc::new(MemoryStore::new());
    let cache = instance(&store);

    let first = cache
        .mutex()
        .try_lock("rebuild", Duration::from_millis(10), Duration::from_millis(30))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Another task on the same instance takes over after the lease lapsed.
    let second = cache
        .mutex()
        .try_lock("rebuild", Duration::from_millis(10), Duration::from_secs(5))
        .await
        .unwrap();

    assert!(!cache.mutex().unlock(first).await);
    assert!(cache.mutex().is_locked("rebuild").await);
    assert!(cache.mutex().unlock(second).await);
}

#[tokio::test]
async fn test_stampede_computes_once_across_instances() {
    let store = Arc::new(MemoryStore::new());
    let instances = [instance(&store), instance(&store), instance(&store)];
    let computations = Arc::new(AtomicU32::new(0));
    let options = LockOptions::new(Duration::from_secs(3), Duration::from_secs(10));

    let mut tasks = Vec::new();
    for n in 0..9 {
        let cache = instances[n % 3].clone();
        let computations = computations.clone();
        tasks.push(tokio::spawn(async move {
            let key = cache.keys().build("config", "all", None).unwrap();
            let result: Result<Option<Vec<String>>, String> = cache
                .get_or_compute_locked(&key, options, LockFallback::Value(Vec::new()), || async {
                    computations.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(Some(vec!["feature_x".to_string()]))
                })
                .await;
            result
        }));
    }

    for task in tasks {
        assert_eq!(task.await.unwrap(), Ok(Some(vec!["feature_x".to_string()])));
    }
    assert_eq!(computations.load(Ordering::SeqCst), 1);
}

// ============================================================================
// Degraded Availability
// ============================================================================

#[tokio::test]
async fn test_shared_store_down_degrades_gracefully() {
    let store = Arc::new(MemoryStore::new());
    let cache = instance(&store);
    let warm = user_key(&cache, "warm");
    let cold = user_key(&cache, "cold");

    cache.put(&warm, profile(1, "warm")).await;
    store.set_available(false);

    assert_eq!(cache.get::<UserProfile>(&warm).await, Some(profile(1, "warm")));
    assert_eq!(cache.get::<UserProfile>(&cold).await, None);
    assert!(cache.put(&cold, profile(2, "cold")).await);
    cache.evict(&warm).await;

    let computed: Result<Option<u32>, String> = cache
        .get_or_compute(&user_key(&cache, "computed"), || async { Ok(Some(7)) })
        .await;
    assert_eq!(computed, Ok(Some(7)));
    assert!(cache.stats().shared.degraded > 0);
}

#[tokio::test]
async fn test_slow_store_does_not_block() {
    let store = Arc::new(MemoryStore::new());
    let cache = instance(&store);
    let key = user_key(&cache, "slow");
    store.set_latency(Duration::from_secs(2));

    let started = Instant::now();
    assert_eq!(cache.get::<UserProfile>(&key).await, None);
    assert!(started.elapsed() < Duration::from_secs(1));
}

// ============================================================================
// Cross-Instance Invalidation
// ============================================================================

#[tokio::test]
async fn test_put_invalidates_peer_local_tier() {
    let store = Arc::new(MemoryStore::new());
    let writer = instance(&store);
    let reader = instance(&store);
    let reader_tasks = reader.start().await;
    let mut applied = reader.bus().applied_events();
    let key = user_key(&writer, "42");

    writer.put(&key, profile(42, "v1")).await;
    next_applied(&mut applied).await;
    assert_eq!(reader.get::<UserProfile>(&key).await, Some(profile(42, "v1")));
    assert!(reader.local().contains(key.as_str()));

    writer.put(&key, profile(42, "v2")).await;
    let event = next_applied(&mut applied).await;
    assert_eq!(event.origin, writer.instance_id());
    assert_eq!(event.kind(), "single_key");
    assert_eq!(reader.get::<UserProfile>(&key).await, Some(profile(42, "v2")));

    reader_tasks.shutdown().await;
}

#[tokio::test]
async fn test_evict_invalidates_peer_local_tier() {
    let store = Arc::new(MemoryStore::new());
    let a = instance(&store);
    let b = instance(&store);
    let b_tasks = b.start().await;
    let mut applied = b.bus().applied_events();
    let key = user_key(&a, "7");

    a.put(&key, profile(7, "x")).await;
    next_applied(&mut applied).await;
    b.get::<UserProfile>(&key).await;
    assert!(b.local().contains(key.as_str()));

    a.evict(&key).await;
    next_applied(&mut applied).await;
    assert!(!b.local().contains(key.as_str()));
    assert_eq!(b.get::<UserProfile>(&key).await, None);

    b_tasks.shutdown().await;
}

#[tokio::test]
async fn test_pattern_eviction_clears_everything_and_notifies() {
    let store = Arc::new(MemoryStore::new());
    let a = instance(&store);
    let b = instance(&store);
    let b_tasks = b.start().await;
    let mut applied = b.bus().applied_events();

    let k1 = user_key(&a, "k1");
    let other = a.keys().build("order", "9", None).unwrap();
    a.put(&k1, "A".to_string()).await;
    a.put(&other, "B".to_string()).await;
    next_applied(&mut applied).await;
    next_applied(&mut applied).await;
    b.get::<String>(&other).await;
    assert!(!b.local().is_empty());

    let pattern = a.keys().build_pattern(k1.resource()).unwrap();
    assert_eq!(a.evict_pattern(&pattern).await, 1);

    assert!(a.local().is_empty());
    assert!(!a.shared().exists(k1.as_str()).await);
    assert!(a.shared().exists(other.as_str()).await);

    let event = next_applied(&mut applied).await;
    assert_eq!(
        event.scope,
        InvalidationScope::Pattern {
            pattern: "vsa:v1:user:*".to_string()
        }
    );
    assert!(b.local().is_empty());

    b_tasks.shutdown().await;
}

#[tokio::test]
async fn test_malformed_messages_do_not_stop_subscriber() {
    let store = Arc::new(MemoryStore::new());
    let a = instance(&store);
    let b = instance(&store);
    let b_tasks = b.start().await;
    let mut applied = b.bus().applied_events();
    let channel = b.bus().channel().to_string();

    store.publish(&channel, "not json").await.unwrap();
    store.publish(&channel, r#"{"kind":"everything"}"#).await.unwrap();

    let key = user_key(&a, "after");
    a.put(&key, 1u32).await;
    let event = next_applied(&mut applied).await;
    assert_eq!(event.origin, a.instance_id());

    b_tasks.shutdown().await;
}

#[tokio::test]
async fn test_publish_on_put_can_be_disabled() {
    let store = Arc::new(MemoryStore::new());
    let mut quiet = test_settings();
    quiet.invalidation.publish_on_put = false;
    let writer = HybridCoordinator::new(&quiet, store.clone(), store.clone()).unwrap();
    let reader = instance(&store);
    let reader_tasks = reader.start().await;
    let key = user_key(&writer, "quiet");

    writer.put(&key, 1u32).await;
    reader.get::<u32>(&key).await;
    writer.put(&key, 2u32).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Peer keeps its local copy until TTL or an explicit eviction.
    assert_eq!(reader.get::<u32>(&key).await, Some(1));

    reader_tasks.shutdown().await;
}

#[tokio::test]
async fn test_resubscribe_clears_local_tier() {
    let store = Arc::new(MemoryStore::new());
    let a = instance(&store);
    let b = instance(&store);
    let b_tasks = b.start().await;
    let mut applied = b.bus().applied_events();
    let key = user_key(&a, "r");

    b.put(&key, 1u32).await;
    assert!(b.local().contains(key.as_str()));

    store.disconnect_subscribers();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(b.local().is_empty());

    // Still listening after the reconnect.
    a.put(&key, 2u32).await;
    next_applied(&mut applied).await;

    b_tasks.shutdown().await;
}

// ============================================================================
// Idempotency
// ============================================================================

#[tokio::test]
async fn test_idempotency_across_instances() {
    let store = Arc::new(MemoryStore::new());
    let a = instance(&store);
    let b = instance(&store);
    let key = vsa_cache::cache::IdempotencyGuard::fingerprint(&["POST", "/orders", "body-hash"]);

    let first: Result<_, String> = a.idempotency_guard().run(&key, || async { Ok("order-1") }).await;
    let second: Result<_, String> = b.idempotency_guard().run(&key, || async { Ok("order-2") }).await;

    assert_eq!(first, Ok(IdempotencyOutcome::Executed("order-1")));
    assert_eq!(second, Ok(IdempotencyOutcome::Duplicate));
}
