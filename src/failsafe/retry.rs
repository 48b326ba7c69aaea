//! Retry logic with exponential backoff and symmetric jitter

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::{Instant, sleep};
use tracing::{debug, warn};

use super::classify::{ErrorClass, classify, retry_after_hint};
use crate::config::RetryConfig;
use crate::{Error, Result};

/// Retry policy, passed per call
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum attempts, including the first
    pub max_attempts: u32,
    /// Delay before the first retry, also the floor after jitter
    pub base_delay: Duration,
    /// Cap for the exponential delay
    pub max_delay: Duration,
    /// Symmetric jitter as a fraction of the delay
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(&RetryConfig::default())
    }
}

impl RetryPolicy {
    /// Create from config
    #[must_use]
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: config.base_delay,
            max_delay: config.max_delay,
            jitter_factor: config.jitter_factor,
        }
    }

    /// Un-jittered delay for a 0-indexed attempt: `min(base * 2^attempt, max)`
    #[must_use]
    pub fn capped_delay(&self, attempt: u32) -> Duration {
        let exp = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.base_delay.as_secs_f64() * 2f64.powi(exp);
        if !secs.is_finite() || secs > self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// Delay before the retry following `attempt`, with random jitter
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let sample = rand::rng().random_range(-1.0..=1.0);
        self.backoff_with_sample(attempt, sample)
    }

    /// Delay for a given jitter sample in `[-1, 1]`.
    ///
    /// `delay = capped + capped * jitter_factor * sample`, floored at `base_delay`.
    #[must_use]
    pub fn backoff_with_sample(&self, attempt: u32, sample: f64) -> Duration {
        let capped = self.capped_delay(attempt).as_secs_f64();
        let jittered = capped + capped * self.jitter_factor * sample.clamp(-1.0, 1.0);
        let floor = self.base_delay.as_secs_f64();
        Duration::try_from_secs_f64(jittered.max(floor)).unwrap_or(self.max_delay)
    }
}

/// Result of one `with_retry` invocation
#[derive(Debug)]
pub struct RetryOutcome<T> {
    /// Attempts made, always within `1..=max_attempts`
    pub attempts: u32,
    /// Wall time spent, including backoff sleeps
    pub total_duration: Duration,
    /// Value of the successful attempt, or the error that ended the loop
    pub result: Result<T>,
}

impl<T> RetryOutcome<T> {
    /// Whether an attempt succeeded
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    /// Discard the bookkeeping and keep the result
    ///
    /// # Errors
    ///
    /// Returns the permanent error, or [`Error::RetriesExhausted`].
    pub fn into_result(self) -> Result<T> {
        self.result
    }
}

/// Execute an operation with retry logic
///
/// Transient failures are retried with exponential backoff until
/// `policy.max_attempts` is reached; a permanent failure ends the loop at once.
/// When every attempt failed transiently the outcome carries
/// [`Error::RetriesExhausted`] wrapping the final error.
pub async fn with_retry<F, Fut, T>(policy: &RetryPolicy, name: &str, mut f: F) -> RetryOutcome<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let started = Instant::now();
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0u32;

    loop {
        let attempts = attempt + 1;

        let e = match f().await {
            Ok(value) => {
                if attempts > 1 {
                    debug!(operation = name, attempts, "Succeeded after retry");
                }
                return RetryOutcome {
                    attempts,
                    total_duration: started.elapsed(),
                    result: Ok(value),
                };
            }
            Err(e) => e,
        };

        if classify(&e) == ErrorClass::Permanent {
            warn!(
                operation = name,
                attempts,
                elapsed_ms = started.elapsed().as_millis(),
                error = %e,
                "Permanent failure, not retrying"
            );
            return RetryOutcome {
                attempts,
                total_duration: started.elapsed(),
                result: Err(e),
            };
        }

        if attempts >= max_attempts {
            warn!(
                operation = name,
                attempts,
                elapsed_ms = started.elapsed().as_millis(),
                error = %e,
                "Max retry attempts reached"
            );
            return RetryOutcome {
                attempts,
                total_duration: started.elapsed(),
                result: Err(Error::RetriesExhausted {
                    attempts,
                    last: Box::new(e),
                }),
            };
        }

        let computed = policy.backoff(attempt);
        let delay = retry_after_hint(&e).map_or(computed, |hint| computed.max(hint));
        debug!(
            operation = name,
            attempt = attempts,
            delay_ms = delay.as_millis(),
            error = %e,
            "Retrying after backoff"
        );
        sleep(delay).await;
        attempt += 1;
    }
}
