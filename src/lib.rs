//! Cronwarden
//!
//! Cron-style job scheduler with cross-process job locks, per-job timeouts,
//! graceful shutdown, and the failsafe primitives jobs use to talk to flaky
//! upstream services.
//!
//! # Features
//!
//! - **Scheduling**: cron expressions fire named jobs as independent processes
//! - **Locking**: advisory lock files keep one instance of a job per host
//! - **Supervision**: per-job timeouts with SIGTERM, completion events
//! - **Shutdown**: phased drain, lock cleanup and resource close on SIGINT/SIGTERM
//! - **Failsafes**: retry with jittered backoff, circuit breakers, rate limiting

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod clock;
pub mod config;
pub mod error;
pub mod failsafe;
pub mod scheduler;
pub mod server;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    let installed = match format {
        Some("json") => subscriber.with(fmt::layer().json()).try_init(),
        _ => subscriber.with(fmt::layer()).try_init(),
    };

    installed.map_err(|e| Error::Internal(format!("Failed to install tracing subscriber: {e}")))
}
