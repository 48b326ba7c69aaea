//! Error types for cronwarden

use std::io;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::RETRY_AFTER;
use thiserror::Error;

use crate::failsafe::CircuitStats;

/// Result type alias for cronwarden
pub type Result<T> = std::result::Result<T, Error>;

/// Cronwarden errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// HTTP client error
    #[error("Request error: {0}")]
    Request(#[from] reqwest::Error),

    /// Upstream answered with a non-success status
    #[error("HTTP {status}: {message}")]
    Http {
        /// Status code
        status: u16,
        /// Response message or reason phrase
        message: String,
        /// Server supplied `Retry-After` hint
        retry_after: Option<Duration>,
    },

    /// Network-level failure (reset, refused, DNS, ...)
    #[error("Network error: {0}")]
    Network(String),

    /// Operation timed out
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Circuit breaker rejected the call without attempting it
    #[error("Circuit '{name}' is open ({} failures, {} rejected)", .stats.failure_count, .stats.rejection_count)]
    CircuitOpen {
        /// Protected dependency name
        name: String,
        /// Breaker statistics at rejection time
        stats: CircuitStats,
    },

    /// Transient failures used up the whole attempt budget
    #[error("Gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        /// Attempts made
        attempts: u32,
        /// Error returned by the final attempt
        last: Box<Error>,
    },

    /// Lock file error
    #[error("Lock error: {0}")]
    Lock(String),

    /// Job process could not be started
    #[error("Spawn error: {0}")]
    Spawn(String),

    /// Invalid schedule expression
    #[error("Schedule error: {0}")]
    Schedule(String),

    /// Shutdown in progress
    #[error("Shutdown in progress")]
    Shutdown,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create an HTTP status error without a retry hint
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self::Http {
            status,
            message: message.into(),
            retry_after: None,
        }
    }

    /// Build an error from a non-success upstream response.
    ///
    /// Reads the `Retry-After` header in either delta-seconds or HTTP-date form.
    #[must_use]
    pub fn from_response(response: &reqwest::Response) -> Self {
        let status = response.status();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| parse_retry_after(v, Utc::now()));

        Self::Http {
            status: status.as_u16(),
            message: status.canonical_reason().unwrap_or("unknown status").to_string(),
            retry_after,
        }
    }

    /// HTTP status carried by this error, if any
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            Self::Request(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

/// Parse a `Retry-After` header value relative to `now`.
///
/// Dates in the past yield a zero delay.
#[must_use]
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?;
    Some(
        (at.with_timezone(&Utc) - now)
            .to_std()
            .unwrap_or(Duration::ZERO),
    )
}
