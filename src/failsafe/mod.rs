//! Failsafe mechanisms: retry, circuit breaker, rate limiting
//!
//! These are the primitives job code uses when talking to flaky upstream APIs,
//! and that inbound handlers use to throttle callers. None of them do I/O of
//! their own beyond timers.

mod circuit_breaker;
pub mod classify;
mod rate_limiter;
mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitState, CircuitStats, TransitionObserver};
pub use classify::{ErrorClass, classify, is_transient, retry_after_hint};
pub use rate_limiter::{RateLimitDecision, RateLimitEntry, RateLimiter};
pub use retry::{RetryOutcome, RetryPolicy, with_retry};

use std::future::Future;
use std::sync::Arc;

use crate::Result;
use crate::clock::SharedClock;
use crate::config::FailsafeConfig;

/// Retry policy plus a circuit breaker for one external service
#[derive(Clone, Debug)]
pub struct Failsafe {
    /// Circuit breaker
    pub circuit_breaker: Arc<CircuitBreaker>,
    /// Retry policy
    pub retry_policy: RetryPolicy,
}

impl Failsafe {
    /// Create a new failsafe from configuration
    #[must_use]
    pub fn new(name: &str, config: &FailsafeConfig) -> Self {
        Self {
            circuit_breaker: Arc::new(CircuitBreaker::new(name, &config.circuit_breaker)),
            retry_policy: RetryPolicy::new(&config.retry),
        }
    }

    /// Create a failsafe whose breaker reads time from `clock`
    #[must_use]
    pub fn with_clock(name: &str, config: &FailsafeConfig, clock: SharedClock) -> Self {
        Self {
            circuit_breaker: Arc::new(CircuitBreaker::with_clock(
                name,
                &config.circuit_breaker,
                clock,
            )),
            retry_policy: RetryPolicy::new(&config.retry),
        }
    }

    /// Call `f` through the circuit breaker, retrying transient failures.
    ///
    /// A rejection by the open circuit ends the retry loop immediately; the
    /// future built for that attempt is dropped without being polled.
    pub async fn call<F, Fut, T>(&self, mut f: F) -> RetryOutcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let name = self.circuit_breaker.name().to_string();
        with_retry(&self.retry_policy, &name, || {
            let attempt = f();
            let breaker = Arc::clone(&self.circuit_breaker);
            async move { breaker.execute(|| attempt).await }
        })
        .await
    }
}
