//! Circuit breaker implementation

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::clock::{self, SharedClock, elapsed_between};
use crate::config::CircuitBreakerConfig;
use crate::{Error, Result};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    /// Circuit is closed (allowing requests)
    Closed,
    /// Circuit is open (blocking requests)
    Open,
    /// Circuit is half-open (allowing limited requests to test)
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half-open",
        })
    }
}

/// Snapshot of breaker counters
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitStats {
    /// Current state
    pub state: CircuitState,
    /// Consecutive failures (closed) or the failure count that opened the circuit
    pub failure_count: u32,
    /// Consecutive half-open successes
    pub success_count: u32,
    /// Calls rejected without being attempted
    pub rejection_count: u64,
    /// Most recent failure
    pub last_failure_at: Option<DateTime<Utc>>,
    /// Most recent state change
    pub last_transition_at: DateTime<Utc>,
    /// Probe calls currently running while half-open
    pub half_open_in_flight: u32,
}

/// Callback invoked with `(from, to)` on every state change
pub type TransitionObserver = Arc<dyn Fn(CircuitState, CircuitState) + Send + Sync>;

struct Inner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    rejection_count: u64,
    last_failure_at: Option<DateTime<Utc>>,
    last_transition_at: DateTime<Utc>,
    half_open_in_flight: u32,
    /// Bumped on every transition; outcomes of calls admitted under an older
    /// generation are ignored.
    generation: u64,
}

/// Circuit breaker guarding one external dependency
pub struct CircuitBreaker {
    /// Dependency name
    name: String,
    failure_threshold: u32,
    success_threshold: u32,
    reset_timeout: Duration,
    half_open_max_calls: u32,
    clock: SharedClock,
    inner: Mutex<Inner>,
    observer: RwLock<Option<TransitionObserver>>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl CircuitBreaker {
    /// Create a new circuit breaker
    #[must_use]
    pub fn new(name: &str, config: &CircuitBreakerConfig) -> Self {
        Self::with_clock(name, config, clock::system())
    }

    /// Create a circuit breaker reading time from `clock`
    #[must_use]
    pub fn with_clock(name: &str, config: &CircuitBreakerConfig, clock: SharedClock) -> Self {
        let now = clock.now();
        Self {
            name: name.to_string(),
            failure_threshold: config.failure_threshold.max(1),
            success_threshold: config.success_threshold.max(1),
            reset_timeout: config.reset_timeout,
            half_open_max_calls: config.half_open_max_calls.max(1),
            clock,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                rejection_count: 0,
                last_failure_at: None,
                last_transition_at: now,
                half_open_in_flight: 0,
                generation: 0,
            }),
            observer: RwLock::new(None),
        }
    }

    /// Dependency name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register the transition observer (replaces any previous one)
    pub fn on_transition<F>(&self, observer: F)
    where
        F: Fn(CircuitState, CircuitState) + Send + Sync + 'static,
    {
        *self.observer.write() = Some(Arc::new(observer));
    }

    /// Run `op` through the breaker
    ///
    /// # Errors
    ///
    /// Returns [`Error::CircuitOpen`] without calling `op` while the circuit is
    /// open or the half-open probe budget is used up; otherwise returns
    /// whatever `op` returns.
    #[tracing::instrument(skip_all, fields(circuit = %self.name))]
    pub async fn execute<F, Fut, T>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut permit = self.admit()?;
        let result = op().await;
        permit.complete(result.is_ok());
        result
    }

    /// Get current state
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Snapshot of the counters
    #[must_use]
    pub fn stats(&self) -> CircuitStats {
        Self::snapshot(&self.inner.lock())
    }

    /// Human-readable state summary for operators
    #[must_use]
    pub fn status_message(&self) -> String {
        let inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => format!("Service '{}' is healthy (circuit closed)", self.name),
            CircuitState::Open => {
                let since = inner.last_failure_at.unwrap_or(inner.last_transition_at);
                let waited = elapsed_between(since, self.clock.now());
                let remaining = self.reset_timeout.saturating_sub(waited);
                format!(
                    "Service '{}' circuit breaker is open after {} failures; retry in {} seconds",
                    self.name,
                    inner.failure_count,
                    remaining.as_secs()
                )
            }
            CircuitState::HalfOpen => format!(
                "Service '{}' circuit breaker is half-open, testing recovery ({}/{} successes)",
                self.name, inner.success_count, self.success_threshold
            ),
        }
    }

    /// Force the circuit closed and clear all counters
    pub fn reset(&self) {
        let transition = {
            let mut inner = self.inner.lock();
            inner.rejection_count = 0;
            inner.last_failure_at = None;
            inner.failure_count = 0;
            inner.success_count = 0;
            inner.half_open_in_flight = 0;
            // Outcomes of calls admitted before the reset no longer count
            inner.generation += 1;
            self.transition_to(&mut inner, CircuitState::Closed)
        };
        self.notify(transition);
    }

    fn snapshot(inner: &Inner) -> CircuitStats {
        CircuitStats {
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            rejection_count: inner.rejection_count,
            last_failure_at: inner.last_failure_at,
            last_transition_at: inner.last_transition_at,
            half_open_in_flight: inner.half_open_in_flight,
        }
    }

    /// Decide whether a call may proceed
    fn admit(&self) -> Result<Permit<'_>> {
        let mut transition = None;
        let admitted = {
            let mut inner = self.inner.lock();
            match inner.state {
                CircuitState::Closed => {
                    tracing::trace!("Circuit closed, allowing request");
                    Some(false)
                }
                CircuitState::Open => {
                    let since = inner.last_failure_at.unwrap_or(inner.last_transition_at);
                    if elapsed_between(since, self.clock.now()) >= self.reset_timeout {
                        debug!("Reset timeout elapsed, transitioning to half-open");
                        transition = self.transition_to(&mut inner, CircuitState::HalfOpen);
                        inner.half_open_in_flight += 1;
                        Some(true)
                    } else {
                        None
                    }
                }
                CircuitState::HalfOpen => {
                    if inner.half_open_in_flight < self.half_open_max_calls {
                        debug!(in_flight = inner.half_open_in_flight, "Circuit half-open, allowing probe request");
                        inner.half_open_in_flight += 1;
                        Some(true)
                    } else {
                        None
                    }
                }
            }
            .map(|half_open| (half_open, inner.generation))
            .ok_or_else(|| {
                inner.rejection_count += 1;
                warn!(state = %inner.state, rejected = inner.rejection_count, "Circuit open, rejecting request");
                Error::CircuitOpen {
                    name: self.name.clone(),
                    stats: Self::snapshot(&inner),
                }
            })
        };
        self.notify(transition);

        let (half_open, generation) = admitted?;
        Ok(Permit {
            breaker: self,
            generation,
            half_open,
            done: false,
        })
    }

    fn record(&self, generation: u64, half_open: bool, success: bool) {
        let transition = {
            let mut inner = self.inner.lock();
            if inner.generation != generation {
                tracing::trace!("Outcome from a previous circuit state (ignored)");
                return;
            }
            if half_open {
                inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
            }

            match (inner.state, success) {
                (CircuitState::Closed, true) => {
                    inner.failure_count = 0;
                    tracing::trace!("Success in closed state, reset failure count");
                    None
                }
                (CircuitState::Closed, false) => {
                    inner.failure_count += 1;
                    inner.last_failure_at = Some(self.clock.now());
                    warn!(
                        failures = inner.failure_count,
                        threshold = self.failure_threshold,
                        "Failure in closed state"
                    );
                    if inner.failure_count >= self.failure_threshold {
                        self.transition_to(&mut inner, CircuitState::Open)
                    } else {
                        None
                    }
                }
                (CircuitState::HalfOpen, true) => {
                    inner.success_count += 1;
                    debug!(
                        successes = inner.success_count,
                        threshold = self.success_threshold,
                        "Success in half-open state"
                    );
                    if inner.success_count >= self.success_threshold {
                        self.transition_to(&mut inner, CircuitState::Closed)
                    } else {
                        None
                    }
                }
                (CircuitState::HalfOpen, false) => {
                    // Any failure in half-open goes back to open
                    inner.failure_count += 1;
                    inner.last_failure_at = Some(self.clock.now());
                    warn!("Failure in half-open state, reopening circuit");
                    self.transition_to(&mut inner, CircuitState::Open)
                }
                (CircuitState::Open, _) => {
                    tracing::trace!("Outcome recorded in open state (ignored)");
                    None
                }
            }
        };
        self.notify(transition);
    }

    /// Hand back an unfinished half-open slot (the call was dropped)
    fn release(&self, generation: u64) {
        let mut inner = self.inner.lock();
        if inner.generation == generation {
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
        }
    }

    /// Transition to a new state
    fn transition_to(
        &self,
        inner: &mut Inner,
        new_state: CircuitState,
    ) -> Option<(CircuitState, CircuitState)> {
        let old_state = inner.state;
        if old_state == new_state {
            return None;
        }

        inner.state = new_state;
        inner.generation += 1;
        inner.last_transition_at = self.clock.now();
        inner.half_open_in_flight = 0;
        inner.success_count = 0;

        match new_state {
            CircuitState::Closed => {
                inner.failure_count = 0;
                info!(circuit = %self.name, "Circuit breaker closed");
            }
            CircuitState::Open => {
                warn!(
                    circuit = %self.name,
                    failures = inner.failure_count,
                    reset_after_ms = self.reset_timeout.as_millis(),
                    "Circuit breaker opened"
                );
            }
            CircuitState::HalfOpen => {
                info!(circuit = %self.name, "Circuit breaker half-open");
            }
        }

        Some((old_state, new_state))
    }

    fn notify(&self, transition: Option<(CircuitState, CircuitState)>) {
        let Some((from, to)) = transition else {
            return;
        };
        let observer = self.observer.read().clone();
        if let Some(observer) = observer {
            observer(from, to);
        }
    }
}

/// Admission ticket for one call
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    half_open: bool,
    done: bool,
}

impl Permit<'_> {
    fn complete(&mut self, success: bool) {
        self.done = true;
        self.breaker.record(self.generation, self.half_open, success);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.done && self.half_open {
            self.breaker.release(self.generation);
        }
    }
}
