//! Fixed-window rate limiting keyed by caller identifier
//!
//! Each identifier gets a counter and a reset time. The window restarts lazily
//! on the first call after it expired; unused quota is not carried over.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::clock::{self, SharedClock};

/// Per-identifier window state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitEntry {
    /// Calls counted in the current window
    pub count: u32,
    /// When the current window ends
    pub window_reset_at: DateTime<Utc>,
}

/// Answer to a single `check`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitDecision {
    /// Whether the call may proceed
    pub allowed: bool,
    /// Calls left in the current window
    pub remaining: u32,
    /// When the current window ends
    pub reset_at: DateTime<Utc>,
}

/// Rate limiter for request throttling
#[derive(Debug)]
pub struct RateLimiter {
    entries: DashMap<String, RateLimitEntry>,
    clock: SharedClock,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    /// Create a new rate limiter
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(clock::system())
    }

    /// Create a rate limiter reading time from `clock`
    #[must_use]
    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    /// Count a call from `identifier` against `limit` calls per `window`
    pub fn check(&self, identifier: &str, limit: u32, window: Duration) -> RateLimitDecision {
        let now = self.clock.now();
        let window = chrono::Duration::from_std(window).unwrap_or(chrono::Duration::MAX);

        if limit == 0 {
            return RateLimitDecision {
                allowed: false,
                remaining: 0,
                reset_at: now.checked_add_signed(window).unwrap_or(now),
            };
        }

        let mut entry = self
            .entries
            .entry(identifier.to_string())
            .or_insert(RateLimitEntry {
                count: 0,
                window_reset_at: now,
            });

        if now >= entry.window_reset_at {
            *entry = RateLimitEntry {
                count: 1,
                window_reset_at: now.checked_add_signed(window).unwrap_or(now),
            };
            return RateLimitDecision {
                allowed: true,
                remaining: limit - 1,
                reset_at: entry.window_reset_at,
            };
        }

        if entry.count < limit {
            entry.count += 1;
            return RateLimitDecision {
                allowed: true,
                remaining: limit - entry.count,
                reset_at: entry.window_reset_at,
            };
        }

        debug!(identifier, limit, reset_at = %entry.window_reset_at, "Rate limit exceeded");
        RateLimitDecision {
            allowed: false,
            remaining: 0,
            reset_at: entry.window_reset_at,
        }
    }

    /// Current entry for `identifier`, if any
    #[must_use]
    pub fn entry(&self, identifier: &str) -> Option<RateLimitEntry> {
        self.entries.get(identifier).map(|e| *e)
    }

    /// Forget `identifier`
    pub fn reset(&self, identifier: &str) {
        self.entries.remove(identifier);
    }

    /// Number of tracked identifiers
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no identifiers are tracked
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Evict entries whose window has ended, returning how many were removed
    pub fn cleanup(&self) -> usize {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries.retain(|_, e| e.window_reset_at > now);
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug!(removed, remaining = self.entries.len(), "Evicted expired rate-limit entries");
        }
        removed
    }

    /// Run `cleanup` every `interval` until `cancel` fires
    pub fn spawn_cleanup(self: &Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // First tick completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        limiter.cleanup();
                    }
                    () = cancel.cancelled() => {
                        debug!("Rate-limit cleanup stopped");
                        break;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use chrono::TimeZone;

    fn limiter() -> (RateLimiter, Arc<ManualClock>) {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap());
        (RateLimiter::with_clock(clock.clone()), clock)
    }

    #[test]
    fn test_allows_limit_then_denies() {
        let (rl, clock) = limiter();
        let window = Duration::from_millis(1000);

        let first = rl.check("ip1", 3, window);
        assert!(first.allowed);
        assert_eq!(first.remaining, 2);
        assert_eq!(first.reset_at, clock.now() + chrono::Duration::milliseconds(1000));

        assert_eq!(rl.check("ip1", 3, window).remaining, 1);
        assert_eq!(rl.check("ip1", 3, window).remaining, 0);

        let denied = rl.check("ip1", 3, window);
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        assert_eq!(denied.reset_at, first.reset_at);
    }

    #[test]
    fn test_window_expiry_restarts_count() {
        let (rl, clock) = limiter();
        let window = Duration::from_millis(1000);
        for _ in 0..3 {
            assert!(rl.check("ip1", 3, window).allowed);
        }
        assert!(!rl.check("ip1", 3, window).allowed);

        clock.advance(Duration::from_millis(999));
        assert!(!rl.check("ip1", 3, window).allowed);

        clock.advance(Duration::from_millis(1));
        let fresh = rl.check("ip1", 3, window);
        assert!(fresh.allowed);
        assert_eq!(fresh.remaining, 2);
        assert_eq!(rl.entry("ip1").unwrap().count, 1);
    }

    #[test]
    fn test_identifiers_are_independent() {
        let (rl, _clock) = limiter();
        let window = Duration::from_secs(60);
        assert!(rl.check("a", 1, window).allowed);
        assert!(!rl.check("a", 1, window).allowed);
        assert!(rl.check("b", 1, window).allowed);
        assert_eq!(rl.len(), 2);
    }

    #[test]
    fn test_zero_limit_denies() {
        let (rl, _clock) = limiter();
        assert!(!rl.check("a", 0, Duration::from_secs(1)).allowed);
        assert!(rl.is_empty());
    }

    #[test]
    fn test_cleanup_evicts_expired() {
        let (rl, clock) = limiter();
        rl.check("short", 5, Duration::from_secs(1));
        rl.check("long", 5, Duration::from_secs(60));

        clock.advance(Duration::from_secs(2));
        assert_eq!(rl.cleanup(), 1);
        assert!(rl.entry("short").is_none());
        assert!(rl.entry("long").is_some());

        rl.reset("long");
        assert!(rl.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawn_cleanup_runs_and_stops() {
        let (rl, clock) = limiter();
        let rl = Arc::new(rl);
        rl.check("x", 5, Duration::from_secs(1));
        clock.advance(Duration::from_secs(5));

        let cancel = CancellationToken::new();
        let handle = rl.spawn_cleanup(Duration::from_secs(10), cancel.clone());
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(rl.is_empty());

        cancel.cancel();
        handle.await.unwrap();
    }
}
