//! Transient vs. permanent error classification
//!
//! Transient failures are worth another attempt: network-level errors, HTTP
//! 408/429/5xx gateway statuses and anything that reads like throttling.
//! Everything else (validation, other 4xx, logic errors) is permanent.

use std::io;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;

use crate::Error;

/// HTTP statuses that are retried
pub const TRANSIENT_STATUS_CODES: [u16; 6] = [408, 429, 500, 502, 503, 504];

/// Classification of a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Worth retrying after a backoff
    Transient,
    /// Retrying cannot help
    Permanent,
}

static NETWORK_SIGNATURE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(ECONNRESET|ECONNREFUSED|ECONNABORTED|ETIMEDOUT|ESOCKETTIMEDOUT|ENOTFOUND|EAI_AGAIN|EPIPE|EHOSTUNREACH|ENETUNREACH)\b|socket hang up|fetch failed|network error|connection (reset|refused|closed|aborted)|dns (error|failure)|timed out",
    )
    .expect("network signature regex is valid")
});

static THROTTLE_SIGNATURE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)rate.?limit|too many requests|throttl|quota (exceeded|exhausted)|resource.?exhausted")
        .expect("throttle signature regex is valid")
});

static RETRY_AFTER_MESSAGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)retry.?after\D{0,3}(\d+(?:\.\d+)?)\s*(ms|milliseconds?|s\b|secs?\b|seconds?)?")
        .expect("retry-after regex is valid")
});

/// Classify an error as transient or permanent
#[must_use]
pub fn classify(error: &Error) -> ErrorClass {
    let transient = match error {
        // Fast-fail and bookkeeping errors are never retried
        Error::CircuitOpen { .. }
        | Error::RetriesExhausted { .. }
        | Error::Config(_)
        | Error::Schedule(_)
        | Error::Shutdown => false,
        Error::Network(_) | Error::Timeout(_) => true,
        Error::Io(e) => is_transient_io(e) || matches_signature(&error.to_string()),
        Error::Request(e) => {
            e.is_timeout()
                || e.is_connect()
                || e.status().is_some_and(|s| TRANSIENT_STATUS_CODES.contains(&s.as_u16()))
                || (e.status().is_none() && e.is_request())
                || matches_signature(&error.to_string())
        }
        Error::Http { status, message, .. } => {
            TRANSIENT_STATUS_CODES.contains(status) || matches_signature(message)
        }
        other => matches_signature(&other.to_string()),
    };

    if transient {
        ErrorClass::Transient
    } else {
        ErrorClass::Permanent
    }
}

/// Shorthand for `classify(error) == ErrorClass::Transient`
#[must_use]
pub fn is_transient(error: &Error) -> bool {
    classify(error) == ErrorClass::Transient
}

/// Explicit wait requested by the failure, from a header or the message text
#[must_use]
pub fn retry_after_hint(error: &Error) -> Option<Duration> {
    if let Error::Http {
        retry_after: Some(hint),
        ..
    } = error
    {
        return Some(*hint);
    }

    let message = error.to_string();
    let caps = RETRY_AFTER_MESSAGE.captures(&message)?;
    let value: f64 = caps.get(1)?.as_str().parse().ok()?;
    let unit = caps.get(2).map_or("s", |m| m.as_str()).to_ascii_lowercase();
    let secs = if unit.starts_with("ms") || unit.starts_with("milli") {
        value / 1000.0
    } else {
        value
    };
    Duration::try_from_secs_f64(secs).ok()
}

fn is_transient_io(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::TimedOut
            | io::ErrorKind::Interrupted
            | io::ErrorKind::UnexpectedEof
    )
}

fn matches_signature(message: &str) -> bool {
    NETWORK_SIGNATURE.is_match(message) || THROTTLE_SIGNATURE.is_match(message)
}
