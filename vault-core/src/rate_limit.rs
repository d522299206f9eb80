use crate::config::RateLimitConfig;
use crate::error::{Result, VaultError};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Per-principal token bucket state. Ephemeral: lost on restart, rebuilt
/// at full burst on the principal's next request.
#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token-bucket admission gate for mutating operations, one bucket per
/// principal. Buckets refill continuously at `rate` tokens per second up
/// to `burst`; each admitted request consumes one token.
///
/// The outer map lock is held only to fetch or create a bucket entry;
/// the bucket's own read-modify-write runs under a per-entry lock, so
/// distinct principals never contend.
pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: Mutex<HashMap<String, Arc<Mutex<TokenBucket>>>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Admit or reject one request from `principal`. Rejection is terminal
    /// for the caller; nothing is queued or retried here.
    pub fn check(&self, principal: &str) -> Result<()> {
        self.check_at(principal, Instant::now())
    }

    fn check_at(&self, principal: &str, now: Instant) -> Result<()> {
        let bucket = {
            let mut buckets = self
                .buckets
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            buckets
                .entry(principal.to_string())
                .or_insert_with(|| {
                    Arc::new(Mutex::new(TokenBucket {
                        tokens: self.config.burst,
                        last_refill: now,
                    }))
                })
                .clone()
        };

        let mut bucket = bucket
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.config.rate).min(self.config.burst);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(())
        } else {
            Err(VaultError::RateLimited {
                retry_after: (1.0 - bucket.tokens) / self.config.rate,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn limiter(rate: f64, burst: f64) -> RateLimiter {
        RateLimiter::new(RateLimitConfig { rate, burst })
    }

    #[test]
    fn test_burst_then_reject_then_refill() {
        let limiter = limiter(2.0, 2.0);
        let t0 = Instant::now();

        // Full burst admits two back-to-back requests.
        assert!(limiter.check_at("alice", t0).is_ok());
        assert!(limiter.check_at("alice", t0).is_ok());

        // Third immediate request is rejected.
        let rejected = limiter.check_at("alice", t0);
        assert!(matches!(rejected, Err(VaultError::RateLimited { .. })));

        // After 0.5s one token has refilled: exactly one more succeeds.
        let t1 = t0 + Duration::from_millis(500);
        assert!(limiter.check_at("alice", t1).is_ok());
        assert!(limiter.check_at("alice", t1).is_err());
    }

    #[test]
    fn test_tokens_capped_at_burst() {
        let limiter = limiter(10.0, 2.0);
        let t0 = Instant::now();

        // A long idle period must not accumulate beyond burst.
        let t1 = t0 + Duration::from_secs(60);
        assert!(limiter.check_at("bob", t1).is_ok());
        assert!(limiter.check_at("bob", t1).is_ok());
        assert!(limiter.check_at("bob", t1).is_err());
    }

    #[test]
    fn test_principals_independent() {
        let limiter = limiter(2.0, 1.0);
        let t0 = Instant::now();

        assert!(limiter.check_at("alice", t0).is_ok());
        assert!(limiter.check_at("alice", t0).is_err());
        // Exhausting alice's bucket does not affect bob.
        assert!(limiter.check_at("bob", t0).is_ok());
    }

    #[test]
    fn test_retry_after_hint() {
        let limiter = limiter(2.0, 1.0);
        let t0 = Instant::now();

        limiter.check_at("carol", t0).unwrap();
        match limiter.check_at("carol", t0) {
            Err(VaultError::RateLimited { retry_after }) => {
                // One whole token at 2 tokens/sec is 0.5s away.
                assert!((retry_after - 0.5).abs() < 1e-9);
            }
            other => panic!("expected RateLimited, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_concurrent_same_principal_never_over_admits() {
        let limiter = Arc::new(limiter(1.0, 4.0));
        let t0 = Instant::now();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let limiter = limiter.clone();
            handles.push(std::thread::spawn(move || {
                limiter.check_at("dave", t0).is_ok()
            }));
        }

        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(admitted, 4);
    }
}
