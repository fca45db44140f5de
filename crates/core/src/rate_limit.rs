//! Sliding-window rate limiting of inbound commands per connection.

use std::collections::{HashMap, VecDeque};

use crate::types::EpochSecs;

/// Length of the sliding window.
pub const RATE_LIMIT_WINDOW_SECS: f64 = 60.0;

/// Calls permitted per connection inside one window.
pub const RATE_LIMIT_MAX_CALLS: usize = 30;

/// Outcome of [`RateLimiter::check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    /// Calls still available in the current window after this one.
    pub remaining: usize,
}

/// Sliding-window limiter keyed by connection id.
#[derive(Debug)]
pub struct RateLimiter {
    window: f64,
    max_calls: usize,
    calls: HashMap<String, VecDeque<EpochSecs>>,
}

impl RateLimiter {
    pub fn new(window_secs: f64, max_calls: usize) -> Self {
        Self {
            window: window_secs,
            max_calls,
            calls: HashMap::new(),
        }
    }

    /// Record a call for `connection_id` if it is within quota.
    ///
    /// Calls older than the window are forgotten first, and connections
    /// left with no calls in the window are dropped. A rejected call is not
    /// recorded.
    pub fn check(&mut self, connection_id: &str, command: &str, now: EpochSecs) -> RateDecision {
        let window_start = now - self.window;
        self.calls
            .retain(|_, calls| calls.back().is_some_and(|ts| *ts > window_start));

        let calls = self.calls.entry(connection_id.to_string()).or_default();
        while calls.front().is_some_and(|ts| *ts <= window_start) {
            calls.pop_front();
        }

        if calls.len() >= self.max_calls {
            tracing::warn!(
                connection_id = %connection_id,
                command = %command,
                calls = calls.len(),
                window_secs = self.window,
                "Rate limit exceeded"
            );
            return RateDecision {
                allowed: false,
                remaining: 0,
            };
        }

        calls.push_back(now);
        RateDecision {
            allowed: true,
            remaining: self.max_calls - calls.len(),
        }
    }

    /// Forget all calls recorded for a connection.
    pub fn reset(&mut self, connection_id: &str) {
        self.calls.remove(connection_id);
    }

    /// Connections with calls inside the current window.
    pub fn tracked_connections(&self) -> usize {
        self.calls.len()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RATE_LIMIT_WINDOW_SECS, RATE_LIMIT_MAX_CALLS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_up_to_quota_then_rejects() {
        let mut limiter = RateLimiter::default();
        for i in 0..RATE_LIMIT_MAX_CALLS {
            let decision = limiter.check("conn", "get_summary", i as f64);
            assert!(decision.allowed);
            assert_eq!(decision.remaining, RATE_LIMIT_MAX_CALLS - i - 1);
        }

        let rejected = limiter.check("conn", "get_summary", 30.0);
        assert_eq!(
            rejected,
            RateDecision {
                allowed: false,
                remaining: 0
            }
        );
    }

    #[test]
    fn window_slides() {
        let mut limiter = RateLimiter::new(60.0, 2);
        assert!(limiter.check("conn", "x", 0.0).allowed);
        assert!(limiter.check("conn", "x", 10.0).allowed);
        assert!(!limiter.check("conn", "x", 59.0).allowed);
        // The call at t=0 falls out of the window at t=60.
        assert!(limiter.check("conn", "x", 60.0).allowed);
    }

    #[test]
    fn connections_are_independent_and_resettable() {
        let mut limiter = RateLimiter::new(60.0, 1);
        assert!(limiter.check("a", "x", 0.0).allowed);
        assert!(limiter.check("b", "x", 0.0).allowed);
        assert!(!limiter.check("a", "x", 1.0).allowed);

        limiter.reset("a");
        assert!(limiter.check("a", "x", 2.0).allowed);
    }

    #[test]
    fn idle_connections_are_pruned() {
        let mut limiter = RateLimiter::new(60.0, 5);
        for conn in ["a", "b", "c"] {
            limiter.check(conn, "x", 0.0);
        }
        assert_eq!(limiter.tracked_connections(), 3);

        limiter.check("d", "x", 61.0);
        assert_eq!(limiter.tracked_connections(), 1);

        limiter.reset("d");
        assert_eq!(limiter.tracked_connections(), 0);
    }
}
