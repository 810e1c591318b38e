// =============================================================================
// Rate limiting — per-client token bucket for the history endpoints
// =============================================================================
//
// Each client IP gets a bucket of 100 tokens refilled at 10 tokens per
// second. A request with no token available is refused with the number of
// seconds until the bucket is full again (the `Retry-After` value).
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::clock::Clock;
use crate::error::{CoreError, CoreResult};

pub const BUCKET_CAPACITY: f64 = 100.0;
pub const REFILL_PER_S: f64 = 10.0;

struct Bucket {
    tokens: f64,
    last_refill_ms: i64,
}

pub struct RateLimiter {
    capacity: f64,
    refill_per_s: f64,
    buckets: Mutex<HashMap<String, Bucket>>,
    clock: Arc<Clock>,
}

impl RateLimiter {
    pub fn new(clock: Arc<Clock>) -> Self {
        Self::with_limits(clock, BUCKET_CAPACITY, REFILL_PER_S)
    }

    pub fn with_limits(clock: Arc<Clock>, capacity: f64, refill_per_s: f64) -> Self {
        Self {
            capacity,
            refill_per_s,
            buckets: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Take one token for `client`. Refusals carry the seconds until the
    /// bucket refills completely.
    pub fn check(&self, client: &str) -> CoreResult<()> {
        self.check_at(client, self.clock.now_ms())
    }

    fn check_at(&self, client: &str, now_ms: i64) -> CoreResult<()> {
        let mut buckets = self.buckets.lock();
        let bucket = buckets.entry(client.to_string()).or_insert(Bucket {
            tokens: self.capacity,
            last_refill_ms: now_ms,
        });

        let elapsed_s = (now_ms - bucket.last_refill_ms).max(0) as f64 / 1000.0;
        bucket.tokens = (bucket.tokens + elapsed_s * self.refill_per_s).min(self.capacity);
        bucket.last_refill_ms = now_ms;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(())
        } else {
            let retry_after_s =
                ((self.capacity - bucket.tokens) / self.refill_per_s).ceil().max(1.0) as u64;
            Err(CoreError::RateLimited { retry_after_s })
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn limiter() -> RateLimiter {
        RateLimiter::new(Arc::new(Clock::new()))
    }

    #[test]
    fn burst_of_capacity_then_refusal() {
        // E6 shape: 101 requests within one second; 1..=100 pass, 101 fails
        // with Retry-After 10.
        let l = limiter();
        for i in 0..100 {
            assert!(l.check_at("1.2.3.4", i).is_ok(), "request {i} should pass");
        }
        match l.check_at("1.2.3.4", 100) {
            Err(CoreError::RateLimited { retry_after_s }) => assert_eq!(retry_after_s, 10),
            other => panic!("expected rate limit, got {other:?}"),
        }
    }

    #[test]
    fn refill_restores_tokens() {
        let l = limiter();
        for i in 0..100 {
            l.check_at("ip", i).unwrap();
        }
        assert!(l.check_at("ip", 150).is_err());
        // After 10 s the bucket is full again.
        assert!(l.check_at("ip", 10_150).is_ok());
    }

    #[test]
    fn partial_refill_allows_some() {
        let l = limiter();
        for i in 0..100 {
            l.check_at("ip", i).unwrap();
        }
        // 1 s later: ~10 tokens back.
        for _ in 0..9 {
            assert!(l.check_at("ip", 1_100).is_ok());
        }
    }

    #[test]
    fn buckets_are_per_client() {
        let l = limiter();
        for i in 0..100 {
            l.check_at("a", i).unwrap();
        }
        assert!(l.check_at("a", 100).is_err());
        assert!(l.check_at("b", 100).is_ok());
    }
}
