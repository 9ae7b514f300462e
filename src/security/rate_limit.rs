//! Per-client rate limiting.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

/// A simple token bucket rate limiter.
struct TokenBucket {
    tokens: f64,
    last_update: Instant,
}

impl TokenBucket {
    fn new(capacity: f64) -> Self {
        Self {
            tokens: capacity,
            last_update: Instant::now(),
        }
    }

    fn try_acquire(&mut self, capacity: f64, refill_rate: f64) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update).as_secs_f64();

        // Refill tokens
        self.tokens = (self.tokens + elapsed * refill_rate).min(capacity);
        self.last_update = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Token-bucket rate limiter keyed by client identity.
///
/// Buckets are created on first use and never evicted; growth is bounded by
/// the client population. Connections over the limit are dropped, not
/// queued.
pub struct PerClientRateLimiter {
    max_tokens: f64,
    /// Tokens per second. Infinite disables limiting entirely.
    refill_per_second: f64,
    buckets: Mutex<HashMap<String, TokenBucket>>,
}

impl PerClientRateLimiter {
    pub fn new(max_tokens: u32, refill_per_second: f64) -> Self {
        Self {
            max_tokens: max_tokens as f64,
            refill_per_second,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Take one token from `key`'s bucket. Returns false when the bucket is
    /// empty.
    pub fn allow(&self, key: &str) -> bool {
        // An infinite refill would NaN the bucket arithmetic; it means
        // limiting is off
        if self.refill_per_second.is_infinite() {
            return true;
        }

        let mut buckets = self.buckets.lock().expect("rate limiter mutex poisoned");
        let bucket = buckets
            .entry(key.to_string())
            .or_insert_with(|| TokenBucket::new(self.max_tokens));

        bucket.try_acquire(self.max_tokens, self.refill_per_second)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buckets_are_per_client() {
        let limiter = PerClientRateLimiter::new(3, 0.0);

        for _ in 0..3 {
            assert!(limiter.allow("bob"));
        }
        assert!(!limiter.allow("bob"));

        // A different client has its own bucket
        assert!(limiter.allow("wendy"));
    }

    #[test]
    fn test_infinite_refill_disables_limiting() {
        let limiter = PerClientRateLimiter::new(0, f64::INFINITY);
        for _ in 0..100 {
            assert!(limiter.allow("bob"));
        }
    }

    #[test]
    fn test_refill_restores_tokens() {
        let limiter = PerClientRateLimiter::new(1, 1000.0);

        assert!(limiter.allow("bob"));
        // Bucket drained; wait for the refill rate to top it back up
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(limiter.allow("bob"));
    }
}
