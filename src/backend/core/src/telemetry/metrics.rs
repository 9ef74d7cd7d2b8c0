//! Prometheus metrics for cache tiers, invalidation and locking.
//!
//! All cache components record through [`CacheMetrics`] so metric names and
//! label sets live in one place.
//!
//! # Example
//!
//! ```rust,no_run
//! use vsa_cache::telemetry::metrics::{CacheMetrics, Tier};
//!
//! CacheMetrics::hit(Tier::Local);
//! CacheMetrics::miss(Tier::Shared, "absent");
//! ```

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Whether metrics collection is enabled
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,

    /// Histogram buckets for lock waits and store round trips (in seconds)
    #[serde(default = "default_duration_buckets")]
    pub duration_buckets: Vec<f64>,

    /// Global labels to add to all metrics
    #[serde(default)]
    pub global_labels: HashMap<String, String>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            duration_buckets: default_duration_buckets(),
            global_labels: HashMap::new(),
        }
    }
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_duration_buckets() -> Vec<f64> {
    vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]
}

/// Handle to the installed Prometheus recorder.
pub struct MetricsRegistry {
    prometheus_handle: Option<PrometheusHandle>,
}

impl std::fmt::Debug for MetricsRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsRegistry")
            .field("prometheus_handle", &self.prometheus_handle.is_some())
            .finish()
    }
}

impl MetricsRegistry {
    /// A registry that records nothing.
    pub fn disabled() -> Self {
        Self {
            prometheus_handle: None,
        }
    }

    /// Render all metrics in Prometheus text format.
    pub fn render(&self) -> String {
        self.prometheus_handle
            .as_ref()
            .map(|h| h.render())
            .unwrap_or_default()
    }
}

/// Initialize the metrics subsystem.
///
/// Installs a global Prometheus recorder; scraping is left to the embedding
/// service, which serves [`MetricsRegistry::render`].
///
/// # Errors
///
/// Returns an error if the buckets are invalid or a recorder is already
/// installed.
pub fn init_metrics(config: &MetricsConfig, service_name: &str) -> anyhow::Result<MetricsRegistry> {
    if !config.enabled {
        return Ok(MetricsRegistry::disabled());
    }

    let mut builder = PrometheusBuilder::new();

    for (key, value) in &config.global_labels {
        builder = builder.add_global_label(key, value);
    }

    builder = builder.set_buckets(&config.duration_buckets)?;

    let handle = builder.install_recorder()?;

    register_metric_descriptions();

    tracing::info!(service_name = %service_name, "Metrics initialized");

    Ok(MetricsRegistry {
        prometheus_handle: Some(handle),
    })
}

fn register_metric_descriptions() {
    // Tier metrics
    describe_counter!("cache_hits_total", "Cache hits by tier");
    describe_counter!("cache_misses_total", "Cache misses by tier and reason");
    describe_counter!(
        "cache_evictions_total",
        "Local tier removals by cause (capacity, expired, explicit, type_mismatch)"
    );
    describe_counter!(
        "cache_degraded_total",
        "Shared tier operations degraded to a miss or dropped write"
    );
    describe_gauge!("cache_local_entries", "Entries currently held by the local tier");

    // Invalidation metrics
    describe_counter!(
        "cache_invalidations_published_total",
        "Invalidation events published by kind"
    );
    describe_counter!(
        "cache_invalidations_received_total",
        "Invalidation events applied to the local tier by kind"
    );
    describe_counter!(
        "cache_invalidations_dropped_total",
        "Invalidation messages that failed to publish or decode"
    );
    describe_counter!(
        "cache_invalidation_resubscribes_total",
        "Times the invalidation subscriber re-established its subscription"
    );

    // Lock metrics
    describe_counter!("cache_lock_acquired_total", "Distributed locks acquired");
    describe_counter!(
        "cache_lock_timeouts_total",
        "Distributed lock acquisitions that gave up after the wait time"
    );
    describe_histogram!(
        "cache_lock_wait_seconds",
        "Time spent waiting for a distributed lock"
    );

    // Idempotency metrics
    describe_counter!(
        "cache_idempotency_total",
        "Idempotency guard outcomes (executed, duplicate, unguarded, released)"
    );

    // Circuit breaker metrics
    describe_counter!(
        "cache_circuit_breaker_trips_total",
        "Times the shared store circuit breaker opened"
    );
    describe_gauge!(
        "cache_circuit_breaker_state",
        "Circuit breaker state (0=closed, 1=half-open, 2=open)"
    );

    // Errors
    describe_counter!("vsa_cache_errors_total", "Cache errors by code");
}

/// Which tier a metric refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Local,
    Shared,
}

impl Tier {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Tier::Local => "local",
            Tier::Shared => "shared",
        }
    }
}

/// Circuit breaker state for metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerGauge {
    Closed,
    HalfOpen,
    Open,
}

/// Recording helpers for every cache metric.
pub struct CacheMetrics;

impl CacheMetrics {
    pub fn hit(tier: Tier) {
        counter!("cache_hits_total", "tier" => tier.as_str()).increment(1);
    }

    pub fn miss(tier: Tier, reason: &'static str) {
        counter!("cache_misses_total", "tier" => tier.as_str(), "reason" => reason).increment(1);
    }

    pub fn eviction(cause: &'static str) {
        counter!("cache_evictions_total", "cause" => cause).increment(1);
    }

    pub fn local_entries(count: usize) {
        gauge!("cache_local_entries").set(count as f64);
    }

    /// A shared tier operation fell back to a miss or a dropped write.
    pub fn degraded(operation: &'static str) {
        counter!("cache_degraded_total", "op" => operation).increment(1);
    }

    pub fn invalidation_published(kind: &'static str) {
        counter!("cache_invalidations_published_total", "kind" => kind).increment(1);
    }

    pub fn invalidation_received(kind: &'static str) {
        counter!("cache_invalidations_received_total", "kind" => kind).increment(1);
    }

    pub fn invalidation_dropped(reason: &'static str) {
        counter!("cache_invalidations_dropped_total", "reason" => reason).increment(1);
    }

    pub fn resubscribed() {
        counter!("cache_invalidation_resubscribes_total").increment(1);
    }

    pub fn lock_acquired(waited: Duration) {
        counter!("cache_lock_acquired_total").increment(1);
        histogram!("cache_lock_wait_seconds").record(waited.as_secs_f64());
    }

    pub fn lock_timeout(waited: Duration) {
        counter!("cache_lock_timeouts_total").increment(1);
        histogram!("cache_lock_wait_seconds").record(waited.as_secs_f64());
    }

    pub fn idempotency(outcome: &'static str) {
        counter!("cache_idempotency_total", "outcome" => outcome).increment(1);
    }

    pub fn breaker_state(name: &str, state: BreakerGauge) {
        let value = match state {
            BreakerGauge::Closed => 0.0,
            BreakerGauge::HalfOpen => 1.0,
            BreakerGauge::Open => 2.0,
        };
        gauge!("cache_circuit_breaker_state", "store" => name.to_string()).set(value);
    }

    pub fn breaker_trip(name: &str) {
        counter!("cache_circuit_breaker_trips_total", "store" => name.to_string()).increment(1);
    }
}
