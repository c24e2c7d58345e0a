// Per-identity token buckets.
//
// One bucket per API key (or remote address when auth is off). Refill is
// continuous and fractional; drain is one token per accepted request no
// matter the batch size. Check-and-drain happens under the map lock, so a
// request is never half-admitted.

use std::collections::HashMap;
use std::time::Instant;

use parking_lot::Mutex;

/// Idle entries older than this are swept once the map grows large.
const SWEEP_IDLE_SECS: u64 = 600;
const SWEEP_THRESHOLD: usize = 16_384;

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

pub struct RateLimiter {
    capacity: f64,
    refill_per_sec: f64,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl RateLimiter {
    pub fn new(capacity: f64, refill_per_minute: f64) -> Self {
        Self {
            capacity,
            refill_per_sec: refill_per_minute / 60.0,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Admit one request for `identity`, or return the suggested
    /// `Retry-After` seconds.
    pub fn try_acquire(&self, identity: &str) -> Result<(), u64> {
        self.try_acquire_at(identity, Instant::now())
    }

    fn try_acquire_at(&self, identity: &str, now: Instant) -> Result<(), u64> {
        let mut buckets = self.buckets.lock();

        if buckets.len() >= SWEEP_THRESHOLD {
            buckets.retain(|_, b| now.duration_since(b.last_refill).as_secs() < SWEEP_IDLE_SECS);
        }

        let bucket = buckets.entry(identity.to_owned()).or_insert(Bucket {
            tokens: self.capacity,
            last_refill: now,
        });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(())
        } else {
            // Advise the client to return once the bucket has recovered.
            let secs = ((self.capacity - bucket.tokens) / self.refill_per_sec).ceil();
            Err((secs as u64).max(1))
        }
    }

    /// Number of tracked identities; exposed on the stats endpoint.
    pub fn tracked_identities(&self) -> usize {
        self.buckets.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_capacity_admits_then_rejects() {
        let limiter = RateLimiter::new(3.0, 60.0);
        let now = Instant::now();
        for _ in 0..3 {
            assert!(limiter.try_acquire_at("client", now).is_ok());
        }
        let retry = limiter.try_acquire_at("client", now).unwrap_err();
        assert!(retry >= 1);
    }

    #[test]
    fn test_continuous_refill() {
        // 60 tokens/minute = 1 token/second.
        let limiter = RateLimiter::new(1.0, 60.0);
        let start = Instant::now();
        assert!(limiter.try_acquire_at("client", start).is_ok());
        assert!(limiter.try_acquire_at("client", start).is_err());
        // Half a token after 500ms - still rejected.
        assert!(limiter
            .try_acquire_at("client", start + Duration::from_millis(500))
            .is_err());
        // A full token after a second.
        assert!(limiter
            .try_acquire_at("client", start + Duration::from_millis(1_100))
            .is_ok());
    }

    #[test]
    fn test_identities_do_not_contend() {
        let limiter = RateLimiter::new(1.0, 60.0);
        let now = Instant::now();
        assert!(limiter.try_acquire_at("a", now).is_ok());
        assert!(limiter.try_acquire_at("b", now).is_ok());
        assert!(limiter.try_acquire_at("a", now).is_err());
        assert_eq!(limiter.tracked_identities(), 2);
    }

    #[test]
    fn test_retry_after_reflects_full_recovery() {
        // Capacity 1000 refilled at 1000/min: a drained bucket advises ~60s.
        let limiter = RateLimiter::new(1_000.0, 1_000.0);
        let now = Instant::now();
        for _ in 0..1_000 {
            assert!(limiter.try_acquire_at("client", now).is_ok());
        }
        let retry = limiter.try_acquire_at("client", now).unwrap_err();
        assert_eq!(retry, 60);
    }

    #[test]
    fn test_tokens_never_exceed_capacity() {
        let limiter = RateLimiter::new(2.0, 60.0);
        let start = Instant::now();
        assert!(limiter.try_acquire_at("client", start).is_ok());
        // A long idle period must not bank more than capacity.
        let later = start + Duration::from_secs(3_600);
        assert!(limiter.try_acquire_at("client", later).is_ok());
        assert!(limiter.try_acquire_at("client", later).is_ok());
        assert!(limiter.try_acquire_at("client", later).is_err());
    }
}
