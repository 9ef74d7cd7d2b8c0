//! Error handling for the cache subsystem.
//!
//! Most public cache operations never return these errors: infrastructure
//! failures are logged and degraded to a miss or a dropped write. The error
//! type exists for the layers underneath (store backends, the lock client,
//! configuration loading) and for the admin CLI.
//!
//! # Usage
//!
//! ```rust,ignore
//! use vsa_cache::error::{CacheError, ErrorCode, Result};
//!
//! fn check(ttl_secs: u64) -> Result<()> {
//!     if ttl_secs == 0 {
//!         return Err(CacheError::invalid_configuration("local TTL must be positive"));
//!     }
//!     Ok(())
//! }
//! ```

use metrics::counter;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use thiserror::Error;
use tracing::{error, warn};

// ═══════════════════════════════════════════════════════════════════════════════
// Result Type Alias
// ═══════════════════════════════════════════════════════════════════════════════

/// A specialized Result type for cache operations.
pub type Result<T> = std::result::Result<T, CacheError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Machine-readable error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Store Errors (2100-2199)
    CacheError,
    CacheConnectionFailed,
    CacheTimeout,
    CacheUnavailable,

    // Serialization Errors (2200-2299)
    SerializationError,
    DeserializationError,
    MalformedMessage,

    // Input Errors (4100-4199)
    InvalidKey,
    InvalidPattern,

    // Configuration Errors (5000-5099)
    ConfigurationError,
    MissingConfiguration,
    InvalidConfiguration,
}

impl ErrorCode {
    /// Get the numeric code for this error.
    pub const fn numeric_code(&self) -> u32 {
        match self {
            Self::CacheError => 2100,
            Self::CacheConnectionFailed => 2101,
            Self::CacheTimeout => 2102,
            Self::CacheUnavailable => 2103,

            Self::SerializationError => 2200,
            Self::DeserializationError => 2201,
            Self::MalformedMessage => 2202,

            Self::InvalidKey => 4101,
            Self::InvalidPattern => 4102,

            Self::ConfigurationError => 5000,
            Self::MissingConfiguration => 5001,
            Self::InvalidConfiguration => 5002,
        }
    }

    /// Check if this error is transient and worth retrying.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::CacheError
                | Self::CacheConnectionFailed
                | Self::CacheTimeout
                | Self::CacheUnavailable
        )
    }

    /// Get the error category for grouping.
    pub const fn category(&self) -> &'static str {
        match self.numeric_code() {
            2100..=2199 => "store",
            2200..=2299 => "serialization",
            4100..=4199 => "input",
            5000..=5099 => "configuration",
            _ => "unknown",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Severity
// ═══════════════════════════════════════════════════════════════════════════════

/// Severity level for errors (affects logging).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// Caller mistakes
    Low,
    /// Degraded infrastructure, the subsystem keeps serving
    Medium,
    /// Corrupt data or misconfiguration
    High,
}

impl ErrorSeverity {
    /// Get severity based on error code.
    pub const fn from_code(code: &ErrorCode) -> Self {
        match code {
            ErrorCode::InvalidKey | ErrorCode::InvalidPattern => Self::Low,

            ErrorCode::CacheError
            | ErrorCode::CacheConnectionFailed
            | ErrorCode::CacheTimeout
            | ErrorCode::CacheUnavailable
            | ErrorCode::MalformedMessage => Self::Medium,

            ErrorCode::SerializationError
            | ErrorCode::DeserializationError
            | ErrorCode::ConfigurationError
            | ErrorCode::MissingConfiguration
            | ErrorCode::InvalidConfiguration => Self::High,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main Error Type
// ═══════════════════════════════════════════════════════════════════════════════

/// The error type for the cache subsystem.
#[derive(Error, Debug)]
pub struct CacheError {
    /// Machine-readable error code
    code: ErrorCode,

    /// Short message safe to surface to operators
    user_message: Cow<'static, str>,

    /// Detailed internal message (for logging only)
    internal_message: Option<String>,

    /// The source error that caused this error
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.user_message)?;
        if let Some(ref internal) = self.internal_message {
            write!(f, " (internal: {})", internal)?;
        }
        Ok(())
    }
}

impl CacheError {
    // ─────────────────────────────────────────────────────────────────────────
    // Constructors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a new error with code and user message.
    pub fn new(code: ErrorCode, user_message: impl Into<Cow<'static, str>>) -> Self {
        let error = Self {
            code,
            user_message: user_message.into(),
            internal_message: None,
            source: None,
        };
        error.record_metrics();
        error
    }

    /// Create an error with both user and internal messages.
    pub fn with_internal(
        code: ErrorCode,
        user_message: impl Into<Cow<'static, str>>,
        internal_message: impl Into<String>,
    ) -> Self {
        let mut error = Self::new(code, user_message);
        error.internal_message = Some(internal_message.into());
        error
    }

    /// Create an invalid configuration error.
    pub fn invalid_configuration(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::InvalidConfiguration, message)
    }

    /// The shared store could not be reached at all.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::with_internal(
            ErrorCode::CacheUnavailable,
            "Shared store is unavailable",
            message,
        )
    }

    /// A store command exceeded its request-level timeout.
    pub fn timeout(operation: &str, after: std::time::Duration) -> Self {
        Self::with_internal(
            ErrorCode::CacheTimeout,
            "Shared store command timed out",
            format!("{} timed out after {:?}", operation, after),
        )
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Builder Methods
    // ─────────────────────────────────────────────────────────────────────────

    /// Add a source error.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    /// Get the error code.
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// Get the user-facing message.
    pub fn user_message(&self) -> &str {
        &self.user_message
    }

    /// Get the internal message (if any).
    pub fn internal_message(&self) -> Option<&str> {
        self.internal_message.as_deref()
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    /// Get the error severity.
    pub fn severity(&self) -> ErrorSeverity {
        ErrorSeverity::from_code(&self.code)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Logging
    // ─────────────────────────────────────────────────────────────────────────

    /// Log this error with appropriate severity.
    pub fn log(&self) {
        let code = self.code.to_string();
        let category = self.code.category();

        match self.severity() {
            ErrorSeverity::High => {
                error!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    internal_message = ?self.internal_message,
                    source = ?self.source,
                    "Cache error"
                );
            }
            ErrorSeverity::Medium => {
                warn!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    internal_message = ?self.internal_message,
                    "Cache degraded"
                );
            }
            ErrorSeverity::Low => {
                tracing::debug!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    "Cache request rejected"
                );
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Metrics
    // ─────────────────────────────────────────────────────────────────────────

    fn record_metrics(&self) {
        counter!(
            "vsa_cache_errors_total",
            "code" => self.code.to_string(),
            "category" => self.code.category().to_string(),
            "retryable" => self.is_retryable().to_string(),
        )
        .increment(1);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// From Implementations for Common Error Types
// ═══════════════════════════════════════════════════════════════════════════════

impl From<redis::RedisError> for CacheError {
    fn from(error: redis::RedisError) -> Self {
        let (code, user_msg) = if error.is_connection_refusal() || error.is_connection_dropped() {
            (ErrorCode::CacheConnectionFailed, "Unable to connect to shared store")
        } else if error.is_timeout() {
            (ErrorCode::CacheTimeout, "Shared store command timed out")
        } else {
            (ErrorCode::CacheError, "A shared store error occurred")
        };

        Self::with_internal(code, user_msg, error.to_string()).with_source(error)
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(error: serde_json::Error) -> Self {
        let code = if error.is_syntax() || error.is_data() || error.is_eof() {
            ErrorCode::DeserializationError
        } else {
            ErrorCode::SerializationError
        };

        Self::with_internal(code, "Failed to process JSON data", error.to_string())
            .with_source(error)
    }
}

impl From<tokio::time::error::Elapsed> for CacheError {
    fn from(error: tokio::time::error::Elapsed) -> Self {
        Self::with_internal(ErrorCode::CacheTimeout, "Operation timed out", error.to_string())
            .with_source(error)
    }
}

impl From<config::ConfigError> for CacheError {
    fn from(error: config::ConfigError) -> Self {
        let (code, user_msg) = match &error {
            config::ConfigError::NotFound(_) => (
                ErrorCode::MissingConfiguration,
                "Required configuration not found",
            ),
            config::ConfigError::PathParse(_) | config::ConfigError::FileParse { .. } => (
                ErrorCode::ConfigurationError,
                "Failed to parse configuration",
            ),
            _ => (ErrorCode::InvalidConfiguration, "Invalid configuration"),
        };

        Self::with_internal(code, user_msg, error.to_string())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
