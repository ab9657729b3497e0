//! Per-user token bucket for batch ingest.
//!
//! A bucket starts with `rate` tokens and refills continuously at `rate` per
//! minute, capped at `rate + burst`: a user posting flat out sustains the
//! per-minute rate, and one who has been idle gets `burst` extra headroom.
//! Buckets live in a concurrent map keyed by user id and are swept when
//! stale.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use metrics::counter;
use parking_lot::Mutex;

/// Outcome of a rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    /// Rejected; retry after this many seconds.
    Limited { retry_after_secs: u64 },
}

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(rate_per_min: u64, burst: u64) -> Self {
        Self {
            tokens: rate_per_min as f64,
            capacity: (rate_per_min + burst) as f64,
            refill_per_sec: rate_per_min as f64 / 60.0,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    fn try_acquire(&mut self) -> bool {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    #[cfg(test)]
    fn credit(&mut self, secs: f64) {
        self.tokens = (self.tokens + secs * self.refill_per_sec).min(self.capacity);
    }

    fn seconds_until_token(&self) -> u64 {
        let needed = 1.0 - self.tokens;
        if needed <= 0.0 || self.refill_per_sec <= 0.0 {
            1
        } else {
            (needed / self.refill_per_sec).ceil().max(1.0) as u64
        }
    }
}

/// Ingest rate limiter, one bucket per user.
pub struct IngestRateLimiter {
    rate_per_min: u64,
    burst: u64,
    buckets: DashMap<String, Mutex<TokenBucket>>,
}

impl IngestRateLimiter {
    pub fn new(rate_per_min: u64, burst: u64) -> Self {
        Self {
            rate_per_min,
            burst,
            buckets: DashMap::new(),
        }
    }

    /// Spend one token for `user_id`, or report how long to wait.
    pub fn check(&self, user_id: &str) -> RateDecision {
        let bucket = self
            .buckets
            .entry(user_id.to_string())
            .or_insert_with(|| Mutex::new(TokenBucket::new(self.rate_per_min, self.burst)));

        let mut bucket = bucket.lock();
        if bucket.try_acquire() {
            RateDecision::Allowed
        } else {
            counter!("telemetry_ingest_rate_limited_total").increment(1);
            RateDecision::Limited {
                retry_after_secs: bucket.seconds_until_token(),
            }
        }
    }

    /// Drop buckets idle for longer than `max_idle`.
    pub fn sweep(&self, max_idle: Duration) {
        let now = Instant::now();
        self.buckets.retain(|_, bucket| {
            let bucket = bucket.lock();
            now.duration_since(bucket.last_refill) < max_idle
        });
    }

    pub fn tracked_users(&self) -> usize {
        self.buckets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sustained_rate_is_the_per_minute_limit() {
        let limiter = IngestRateLimiter::new(100, 20);
        // The first 100 rapid-fire batches pass; the 101st is limited.
        for i in 0..100 {
            assert_eq!(
                limiter.check("user-1"),
                RateDecision::Allowed,
                "batch {} should pass",
                i
            );
        }
        match limiter.check("user-1") {
            RateDecision::Limited { retry_after_secs } => {
                assert!(retry_after_secs >= 1);
            }
            RateDecision::Allowed => panic!("101st batch must be limited"),
        }
    }

    #[test]
    fn users_are_isolated() {
        let limiter = IngestRateLimiter::new(2, 0);
        assert_eq!(limiter.check("a"), RateDecision::Allowed);
        assert_eq!(limiter.check("a"), RateDecision::Allowed);
        assert!(matches!(limiter.check("a"), RateDecision::Limited { .. }));
        assert_eq!(limiter.check("b"), RateDecision::Allowed);
    }

    #[test]
    fn burst_caps_accumulation() {
        let mut bucket = TokenBucket::new(100, 20);
        bucket.tokens = 0.0;
        // An hour of idle refill caps at rate + burst, not rate * 60.
        bucket.credit(3_600.0);
        assert_eq!(bucket.tokens, 120.0);
    }

    #[test]
    fn sweep_drops_idle_buckets() {
        let limiter = IngestRateLimiter::new(10, 0);
        limiter.check("a");
        assert_eq!(limiter.tracked_users(), 1);
        limiter.sweep(Duration::from_secs(0));
        assert_eq!(limiter.tracked_users(), 0);
    }
}
