//! Per-source-IP fixed-window limiter for bridge calls.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

use tokio::time::Instant;

/// Calls counted for one IP in the current window.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitWindow {
    pub count: u32,
    pub window_reset_at: Instant,
}

pub struct RateLimiter {
    max: u32,
    window: Duration,
    windows: HashMap<IpAddr, RateLimitWindow>,
}

impl RateLimiter {
    pub fn new(max: u32, window: Duration) -> Self {
        Self {
            max,
            window,
            windows: HashMap::new(),
        }
    }

    /// Count one call from `ip` at `now`. Returns `false` when the call is over
    /// the limit. The first call after a window elapses opens a fresh window.
    pub fn check(&mut self, ip: IpAddr, now: Instant) -> bool {
        let window = self.window;
        let entry = self.windows.entry(ip).or_insert(RateLimitWindow {
            count: 0,
            window_reset_at: now + window,
        });
        if now >= entry.window_reset_at {
            entry.count = 0;
            entry.window_reset_at = now + window;
        }
        if entry.count >= self.max {
            return false;
        }
        entry.count += 1;
        true
    }

    /// Drop windows that have already expired. Returns how many were removed.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let before = self.windows.len();
        self.windows.retain(|_, w| now < w.window_reset_at);
        before - self.windows.len()
    }

    pub fn tracked(&self) -> usize {
        self.windows.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(last: u8) -> IpAddr {
        IpAddr::from([10, 0, 0, last])
    }

    #[test]
    fn eleventh_call_in_window_is_rejected() {
        let mut limiter = RateLimiter::new(10, Duration::from_secs(60));
        let start = Instant::now();
        for i in 0..10 {
            assert!(limiter.check(ip(1), start + Duration::from_secs(i)), "call {i}");
        }
        assert!(!limiter.check(ip(1), start + Duration::from_secs(30)));
        assert!(!limiter.check(ip(1), start + Duration::from_secs(59)));
    }

    #[test]
    fn first_call_after_window_succeeds() {
        let mut limiter = RateLimiter::new(10, Duration::from_secs(60));
        let start = Instant::now();
        for _ in 0..25 {
            limiter.check(ip(1), start);
        }
        assert!(limiter.check(ip(1), start + Duration::from_secs(60)));
    }

    #[test]
    fn ips_are_independent() {
        let mut limiter = RateLimiter::new(1, Duration::from_secs(60));
        let now = Instant::now();
        assert!(limiter.check(ip(1), now));
        assert!(!limiter.check(ip(1), now));
        assert!(limiter.check(ip(2), now));
    }

    #[test]
    fn sweep_drops_only_expired_windows() {
        let mut limiter = RateLimiter::new(10, Duration::from_secs(60));
        let start = Instant::now();
        limiter.check(ip(1), start);
        limiter.check(ip(2), start + Duration::from_secs(30));
        assert_eq!(limiter.sweep(start + Duration::from_secs(61)), 1);
        assert_eq!(limiter.tracked(), 1);
    }
}
