//! Telemetry: structured logging and Prometheus metrics.
//!
//! - **Logging**: JSON/pretty/compact `tracing` output with per-module levels
//! - **Metrics**: Prometheus counters for tier hits, invalidations and locks
//!
//! # Example
//!
//! ```rust,no_run
//! use vsa_cache::telemetry::{TelemetryConfig, init_telemetry};
//!
//! let config = TelemetryConfig::default();
//! let _telemetry = init_telemetry(&config).expect("Failed to initialize telemetry");
//! ```

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, LogFormat, LoggingConfig};
pub use metrics::{init_metrics, CacheMetrics, MetricsConfig, MetricsRegistry, Tier};

use serde::{Deserialize, Serialize};

/// Unified telemetry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Service name attached to metrics and startup logs
    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// Environment (development, staging, production)
    #[serde(default = "default_environment")]
    pub environment: String,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            environment: default_environment(),
            logging: LoggingConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

fn default_service_name() -> String {
    "vsa-cache".to_string()
}

fn default_environment() -> String {
    std::env::var("VSA_ENVIRONMENT").unwrap_or_else(|_| "development".to_string())
}

/// Initialize logging and metrics. Call once at startup.
///
/// # Errors
///
/// Returns an error if either component fails to initialize.
pub fn init_telemetry(config: &TelemetryConfig) -> anyhow::Result<MetricsRegistry> {
    let registry = init_metrics(&config.metrics, &config.service_name)?;
    init_logging(&config.logging, &config.environment)?;

    ::tracing::info!(
        service_name = %config.service_name,
        environment = %config.environment,
        version = env!("CARGO_PKG_VERSION"),
        "Telemetry initialized"
    );

    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_telemetry_config_defaults() {
        let config = TelemetryConfig::default();
        assert_eq!(config.service_name, "vsa-cache");
        assert!(config.metrics.enabled);
    }
}
