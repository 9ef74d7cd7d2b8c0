//! Benchmarks for the cache tiers.
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;
use std::time::Duration;
use vsa_cache::cache::{glob_matches, CacheKey, HybridCoordinator, KeyConvention, LocalTier, MemoryStore};
use vsa_cache::config::CacheSettings;

fn bench_key_construction(c: &mut Criterion) {
    let mut group = c.benchmark_group("key_construction");
    let keys = KeyConvention::new("vsa", "v1").unwrap();
    group.bench_function("build", |b| { b.iter(|| black_box(keys.build("user", "123", None))); });
    group.bench_function("build_tenant", |b| { b.iter(|| black_box(keys.build("user", "123", Some("acme")))); });
    group.bench_function("build_pattern", |b| { b.iter(|| black_box(keys.build_pattern("user"))); });
    group.bench_function("parse", |b| { b.iter(|| black_box(CacheKey::parse("vsa:v1:user:acme:123"))); });
    group.bench_function("parse_identifier", |b| { b.iter(|| black_box(keys.parse_identifier("vsa:v1:order::2024:05:01"))); });
    group.finish();
}

fn bench_glob_matching(c: &mut Criterion) {
    let mut group = c.benchmark_group("glob_matching");
    group.bench_function("prefix_match", |b| { b.iter(|| black_box(glob_matches("vsa:v1:user:*", "vsa:v1:user:acme:123"))); });
    group.bench_function("prefix_miss", |b| { b.iter(|| black_box(glob_matches("vsa:v1:user:*", "vsa:v1:order::123"))); });
    group.finish();
}

fn bench_local_put(c: &mut Criterion) {
    let mut group = c.benchmark_group("local_put");
    for cap in [100, 1_000, 10_000] {
        group.bench_with_input(BenchmarkId::from_parameter(cap), &cap, |b, &capacity| {
            let local = LocalTier::new(capacity, 16, Duration::from_secs(60));
            let mut i = 0u64;
            b.iter(|| { i += 1; local.put(&format!("vsa:v1:user::{}", i % 20_000), i); });
        });
    }
    group.finish();
}

fn bench_local_get(c: &mut Criterion) {
    let mut group = c.benchmark_group("local_get");
    let local = LocalTier::new(10_000, 16, Duration::from_secs(60));
    for i in 0..1_000u64 { local.put(&format!("vsa:v1:user::{}", i), i); }
    group.bench_function("hit", |b| { b.iter(|| black_box(local.get::<u64>("vsa:v1:user::500"))); });
    group.bench_function("miss", |b| { b.iter(|| black_box(local.get::<u64>("vsa:v1:user::missing"))); });
    group.bench_function("contains", |b| { b.iter(|| black_box(local.contains("vsa:v1:user::500"))); });
    group.finish();
}

fn bench_local_concurrent(c: &mut Criterion) {
    let mut group = c.benchmark_group("local_concurrent");
    group.throughput(Throughput::Elements(8 * 1_000));
    group.bench_function("8_threads_mixed", |b| {
        b.iter(|| {
            let local = Arc::new(LocalTier::new(10_000, 16, Duration::from_secs(60)));
            let handles: Vec<_> = (0..8u64).map(|t| {
                let local = local.clone();
                std::thread::spawn(move || {
                    for i in 0..1_000u64 {
                        let key = format!("vsa:v1:user::{}", (t * 1_000 + i) % 4_000);
                        if i % 4 == 0 { local.put(&key, i); } else { black_box(local.get::<u64>(&key)); }
                    }
                })
            }).collect();
            for h in handles { h.join().unwrap(); }
        });
    });
    group.finish();
}

fn bench_coordinator(c: &mut Criterion) {
    let mut group = c.benchmark_group("coordinator");
    let rt = tokio::runtime::Runtime::new().unwrap();
    let store = Arc::new(MemoryStore::new());
    let cache = HybridCoordinator::new(&CacheSettings::default(), store.clone(), store).unwrap();
    let key = cache.keys().build("user", "1", None).unwrap();
    rt.block_on(async { cache.put(&key, "bench-value".to_string()).await; });
    group.bench_function("get_local_hit", |b| { b.iter(|| { rt.block_on(async { black_box(cache.get::<String>(&key).await); }); }); });
    group.bench_function("get_shared_hit", |b| { b.iter(|| { rt.block_on(async { cache.evict_all(); black_box(cache.get::<String>(&key).await); }); }); });
    group.bench_function("put", |b| { b.iter(|| { rt.block_on(async { cache.put(&key, "bench-value".to_string()).await; }); }); });
    group.finish();
}

criterion_group!(benches, bench_key_construction, bench_glob_matching, bench_local_put, bench_local_get, bench_local_concurrent, bench_coordinator);
criterion_main!(benches);
