//! Per-connection message throttling.
//!
//! Every frame a client sends costs one slot in two sliding windows: a short
//! burst window and a longer sustained one. A frame that doesn't fit in both
//! is dropped before it reaches a room.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::config::ConnectionConfig;

/// Sliding-window counter
#[derive(Debug)]
pub struct RateLimiter {
    timestamps: VecDeque<Instant>,
    max_requests: usize,
    window: Duration,
}

impl RateLimiter {
    /// Allow `max_requests` per `window`.
    ///
    /// ```
    /// use sp_server::api::rate_limiter::RateLimiter;
    /// use std::time::Duration;
    ///
    /// let mut limiter = RateLimiter::new(2, Duration::from_secs(1));
    /// assert!(limiter.check());
    /// assert!(limiter.check());
    /// assert!(!limiter.check());
    /// ```
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            timestamps: VecDeque::with_capacity(max_requests),
            max_requests,
            window,
        }
    }

    /// Record a request if it fits; `false` means over the limit.
    pub fn check(&mut self) -> bool {
        self.check_at(Instant::now())
    }

    fn check_at(&mut self, now: Instant) -> bool {
        while self
            .timestamps
            .front()
            .is_some_and(|ts| now.duration_since(*ts) > self.window)
        {
            self.timestamps.pop_front();
        }

        if self.timestamps.len() >= self.max_requests {
            return false;
        }
        self.timestamps.push_back(now);
        true
    }

    pub fn remaining(&self) -> usize {
        self.max_requests.saturating_sub(self.timestamps.len())
    }
}

/// Which window rejected a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitWindow {
    Burst,
    Sustained,
}

impl LimitWindow {
    pub fn as_str(self) -> &'static str {
        match self {
            LimitWindow::Burst => "burst",
            LimitWindow::Sustained => "sustained",
        }
    }

    /// Text for the client's `error` event.
    pub fn message(self) -> &'static str {
        match self {
            LimitWindow::Burst => "Rate limit exceeded. Please slow down.",
            LimitWindow::Sustained => "Too many messages. Please wait before sending more.",
        }
    }
}

/// The burst and sustained windows of one connection.
#[derive(Debug)]
pub struct ConnectionLimiter {
    burst: RateLimiter,
    sustained: RateLimiter,
}

impl ConnectionLimiter {
    /// Burst per second, sustained per minute.
    pub fn new(config: &ConnectionConfig) -> Self {
        Self {
            burst: RateLimiter::new(config.burst_limit, Duration::from_secs(1)),
            sustained: RateLimiter::new(config.sustained_limit, Duration::from_secs(60)),
        }
    }

    /// The burst window is checked first, so a rejected burst doesn't use
    /// up sustained capacity.
    pub fn check(&mut self) -> Result<(), LimitWindow> {
        if !self.burst.check() {
            return Err(LimitWindow::Burst);
        }
        if !self.sustained.check() {
            return Err(LimitWindow::Sustained);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limiter_blocks_over_limit() {
        let mut limiter = RateLimiter::new(3, Duration::from_secs(1));
        for _ in 0..3 {
            assert!(limiter.check());
        }
        assert!(!limiter.check(), "Should block request over limit");
        assert_eq!(limiter.remaining(), 0);
    }

    #[test]
    fn test_rate_limiter_window_expiry() {
        let mut limiter = RateLimiter::new(2, Duration::from_millis(100));
        let start = Instant::now();

        assert!(limiter.check_at(start));
        assert!(limiter.check_at(start));
        assert!(!limiter.check_at(start + Duration::from_millis(50)));

        assert!(
            limiter.check_at(start + Duration::from_millis(150)),
            "Should allow after window expires"
        );
        assert_eq!(limiter.remaining(), 1);
    }

    #[test]
    fn test_connection_limiter_burst_first() {
        let config = ConnectionConfig {
            burst_limit: 2,
            sustained_limit: 10,
            ..ConnectionConfig::default()
        };
        let mut limiter = ConnectionLimiter::new(&config);

        assert_eq!(limiter.check(), Ok(()));
        assert_eq!(limiter.check(), Ok(()));
        assert_eq!(limiter.check(), Err(LimitWindow::Burst));
        assert_eq!(limiter.sustained.remaining(), 8);
    }

    #[test]
    fn test_connection_limiter_sustained() {
        let config = ConnectionConfig {
            burst_limit: 5,
            sustained_limit: 5,
            ..ConnectionConfig::default()
        };
        let mut limiter = ConnectionLimiter::new(&config);
        let mut sustained = RateLimiter::new(5, Duration::from_secs(60));
        for _ in 0..5 {
            assert!(sustained.check());
        }
        limiter.sustained = sustained;

        assert_eq!(limiter.check(), Err(LimitWindow::Sustained));
    }
}
