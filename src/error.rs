//! Error types and handling for Gridstat
//!
//! This module defines the error type used throughout the application and the
//! failure taxonomy the refresh cycle reports against. Vendor-specific API
//! errors are mapped onto these variants at the fetcher boundary.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for Gridstat operations
pub type Result<T> = std::result::Result<T, GridstatError>;

/// Failure classes a refresh cycle distinguishes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Credentials rejected; fatal for the cycle, never retried automatically
    Authentication,
    /// Transient network or timeout problem; retried with backoff
    Communication,
    /// Remote side is throttling; deferred to the next cycle
    RateLimit,
    /// Non-fatal data inconsistency; offending record dropped
    Anomaly,
    /// A write would break series ordering or hourly/interval disjointness
    InvariantViolation,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Authentication => "authentication",
            Self::Communication => "communication",
            Self::RateLimit => "rate_limit",
            Self::Anomaly => "anomaly",
            Self::InvariantViolation => "invariant_violation",
        }
    }

    /// Whether a failure of this kind is worth retrying inside the same cycle
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Communication)
    }
}

/// Main error type for Gridstat
#[derive(Debug, Error)]
pub enum GridstatError {
    /// Configuration-related errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Serialization/deserialization errors
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    /// File I/O errors
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Validation errors
    #[error("Validation error: {field} - {message}")]
    Validation { field: String, message: String },

    /// Credentials rejected by the utility API
    #[error("Authentication error: {message}")]
    Auth { message: String },

    /// Network-level failure talking to the utility API
    #[error("Communication error: {message}")]
    Communication { message: String },

    /// Utility API asked us to back off
    #[error("Rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after_secs: Option<u64>,
    },

    /// Timeout errors
    #[error("Timeout error: {message}")]
    Timeout { message: String },

    /// Non-transient API errors (unexpected status, undecodable payload)
    #[error("API error: {message}")]
    Api { message: String },

    /// Statistics store errors
    #[error("Store error: {message}")]
    Store { message: String },

    /// Data inconsistencies that drop a single record
    #[error("Anomaly: {message}")]
    Anomaly { message: String },

    /// Series write refused to protect ordering or disjointness
    #[error("Invariant violation: {series} - {message}")]
    InvariantViolation { series: String, message: String },

    /// Work abandoned because shutdown was requested
    #[error("Cancelled: {message}")]
    Cancelled { message: String },
}

impl GridstatError {
    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        GridstatError::Config {
            message: message.into(),
        }
    }

    /// Create a new I/O error
    pub fn io<S: Into<String>>(message: S) -> Self {
        GridstatError::Io {
            message: message.into(),
        }
    }

    /// Create a new validation error
    pub fn validation<F: Into<String>, M: Into<String>>(field: F, message: M) -> Self {
        GridstatError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a new auth error
    pub fn auth<S: Into<String>>(message: S) -> Self {
        GridstatError::Auth {
            message: message.into(),
        }
    }

    /// Create a new communication error
    pub fn communication<S: Into<String>>(message: S) -> Self {
        GridstatError::Communication {
            message: message.into(),
        }
    }

    /// Create a new rate-limit error
    pub fn rate_limited<S: Into<String>>(message: S, retry_after_secs: Option<u64>) -> Self {
        GridstatError::RateLimited {
            message: message.into(),
            retry_after_secs,
        }
    }

    /// Create a new timeout error
    pub fn timeout<S: Into<String>>(message: S) -> Self {
        GridstatError::Timeout {
            message: message.into(),
        }
    }

    /// Create a new API error
    pub fn api<S: Into<String>>(message: S) -> Self {
        GridstatError::Api {
            message: message.into(),
        }
    }

    /// Create a new store error
    pub fn store<S: Into<String>>(message: S) -> Self {
        GridstatError::Store {
            message: message.into(),
        }
    }

    /// Create a new anomaly
    pub fn anomaly<S: Into<String>>(message: S) -> Self {
        GridstatError::Anomaly {
            message: message.into(),
        }
    }

    /// Create a new invariant violation for a series
    pub fn invariant<K: Into<String>, M: Into<String>>(series: K, message: M) -> Self {
        GridstatError::InvariantViolation {
            series: series.into(),
            message: message.into(),
        }
    }

    /// Create a new cancellation error
    pub fn cancelled<S: Into<String>>(message: S) -> Self {
        GridstatError::Cancelled {
            message: message.into(),
        }
    }

    /// Map this error onto the cycle failure taxonomy
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Auth { .. } => FailureKind::Authentication,
            Self::RateLimited { .. } => FailureKind::RateLimit,
            Self::Anomaly { .. } => FailureKind::Anomaly,
            Self::InvariantViolation { .. } => FailureKind::InvariantViolation,
            _ => FailureKind::Communication,
        }
    }

    /// Whether the fetcher should try the same request again
    ///
    /// `Api` errors are classified as communication failures but a malformed
    /// payload or a 4xx answer will not change on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Communication { .. } | Self::Timeout { .. })
    }
}

impl From<std::io::Error> for GridstatError {
    fn from(err: std::io::Error) -> Self {
        GridstatError::io(err.to_string())
    }
}

impl From<serde_yaml::Error> for GridstatError {
    fn from(err: serde_yaml::Error) -> Self {
        GridstatError::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for GridstatError {
    fn from(err: serde_json::Error) -> Self {
        GridstatError::Serialization {
            message: err.to_string(),
        }
    }
}

#[cfg(feature = "remote")]
impl From<reqwest::Error> for GridstatError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            GridstatError::timeout(err.to_string())
        } else {
            GridstatError::communication(err.to_string())
        }
    }
}

impl From<chrono::ParseError> for GridstatError {
    fn from(err: chrono::ParseError) -> Self {
        GridstatError::validation("datetime", err.to_string())
    }
}
