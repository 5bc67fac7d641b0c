//! Token-bucket rate limiter
//!
//! Tokens accumulate at `rate` per second up to `capacity`; each outbound
//! call consumes one (or more). Refill uses monotonic time, so wall-clock
//! jumps cannot mint tokens. The sleep while waiting for refill happens
//! outside the lock.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum RateLimitError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("rate limit acquisition timed out after {0:?}")]
    Timeout(Duration),
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Thread-safe token bucket. Cheap to share behind an `Arc`.
#[derive(Debug)]
pub struct RateLimiter {
    rate: f64,
    capacity: f64,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// Create a limiter emitting `rate` tokens per second. `capacity`
    /// defaults to `2 × rate`, allowing short bursts.
    pub fn new(rate: f64, capacity: Option<f64>) -> Result<Self, RateLimitError> {
        if rate <= 0.0 || !rate.is_finite() {
            return Err(RateLimitError::InvalidArgument(format!(
                "rate must be positive, got {rate}"
            )));
        }
        let capacity = capacity.unwrap_or(2.0 * rate);
        if capacity <= 0.0 || !capacity.is_finite() {
            return Err(RateLimitError::InvalidArgument(format!(
                "capacity must be positive, got {capacity}"
            )));
        }
        if capacity < rate {
            tracing::warn!(
                capacity,
                rate,
                "rate limiter capacity below rate; every call may block"
            );
        }

        tracing::info!(rate, capacity, "rate limiter initialized");
        Ok(Self {
            rate,
            capacity,
            bucket: Mutex::new(Bucket {
                // Start full so the first cycle can burst.
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        })
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    fn check_request(&self, tokens: f64) -> Result<(), RateLimitError> {
        if tokens <= 0.0 || !tokens.is_finite() {
            return Err(RateLimitError::InvalidArgument(format!(
                "tokens must be positive, got {tokens}"
            )));
        }
        if tokens > self.capacity {
            return Err(RateLimitError::InvalidArgument(format!(
                "requested tokens ({tokens}) exceeds capacity ({})",
                self.capacity
            )));
        }
        Ok(())
    }

    fn refill(&self, bucket: &mut Bucket) {
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate).min(self.capacity);
        bucket.last_refill = now;
    }

    /// Take `tokens` if immediately available; never waits.
    pub fn try_acquire(&self, tokens: f64) -> Result<bool, RateLimitError> {
        self.check_request(tokens)?;
        let mut bucket = self.bucket.lock();
        self.refill(&mut bucket);
        if bucket.tokens >= tokens {
            bucket.tokens -= tokens;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Acquire `tokens`, suspending until they are available.
    pub async fn acquire(&self, tokens: f64) -> Result<(), RateLimitError> {
        self.acquire_inner(tokens, None).await
    }

    /// Acquire with a deadline; `Timeout` if it passes first.
    pub async fn acquire_timeout(
        &self,
        tokens: f64,
        timeout: Duration,
    ) -> Result<(), RateLimitError> {
        self.acquire_inner(tokens, Some(Instant::now() + timeout))
            .await
            .map_err(|e| match e {
                RateLimitError::Timeout(_) => RateLimitError::Timeout(timeout),
                other => other,
            })
    }

    async fn acquire_inner(
        &self,
        tokens: f64,
        deadline: Option<Instant>,
    ) -> Result<(), RateLimitError> {
        self.check_request(tokens)?;

        loop {
            let wait = {
                let mut bucket = self.bucket.lock();
                self.refill(&mut bucket);

                if bucket.tokens >= tokens {
                    bucket.tokens -= tokens;
                    tracing::trace!(
                        tokens,
                        remaining = bucket.tokens,
                        "rate limiter tokens acquired"
                    );
                    return Ok(());
                }

                let needed = tokens - bucket.tokens;
                let mut wait = Duration::from_secs_f64(needed / self.rate);
                if let Some(deadline) = deadline {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(RateLimitError::Timeout(Duration::ZERO));
                    }
                    wait = wait.min(deadline - now);
                }
                wait
            };

            // Sleep outside the lock so other callers can refill/consume.
            tokio::time::sleep(wait).await;

            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    // One last non-blocking attempt at the deadline edge.
                    if self.try_acquire(tokens)? {
                        return Ok(());
                    }
                    return Err(RateLimitError::Timeout(Duration::ZERO));
                }
            }
        }
    }

    /// Current token count after refill. Observability only.
    pub fn available_tokens(&self) -> f64 {
        let mut bucket = self.bucket.lock();
        self.refill(&mut bucket);
        bucket.tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_invalid_parameters() {
        assert!(RateLimiter::new(0.0, None).is_err());
        assert!(RateLimiter::new(-1.0, None).is_err());
        assert!(RateLimiter::new(10.0, Some(0.0)).is_err());
    }

    #[test]
    fn capacity_defaults_to_twice_rate() {
        let limiter = RateLimiter::new(10.0, None).unwrap();
        assert_eq!(limiter.capacity(), 20.0);
    }

    #[test]
    fn rejects_requests_beyond_capacity_or_nonpositive() {
        let limiter = RateLimiter::new(10.0, Some(20.0)).unwrap();
        assert!(matches!(
            limiter.try_acquire(0.0),
            Err(RateLimitError::InvalidArgument(_))
        ));
        assert!(matches!(
            limiter.try_acquire(21.0),
            Err(RateLimitError::InvalidArgument(_))
        ));
    }

    #[test]
    fn burst_then_deny() {
        let limiter = RateLimiter::new(10.0, Some(20.0)).unwrap();
        assert!(limiter.try_acquire(20.0).unwrap());
        assert!(!limiter.try_acquire(1.0).unwrap());
    }

    #[tokio::test]
    async fn refills_at_configured_rate() {
        let limiter = RateLimiter::new(10.0, Some(20.0)).unwrap();
        assert!(limiter.try_acquire(20.0).unwrap());

        tokio::time::sleep(Duration::from_millis(1000)).await;

        let available = limiter.available_tokens();
        assert!(
            (available - 10.0).abs() <= 1.0,
            "expected ~10 tokens, got {available}"
        );
        assert!(!limiter.try_acquire(11.0).unwrap());
    }

    #[tokio::test]
    async fn acquire_waits_for_refill() {
        let limiter = RateLimiter::new(100.0, Some(1.0)).unwrap();
        assert!(limiter.try_acquire(1.0).unwrap());

        let start = Instant::now();
        limiter.acquire(1.0).await.unwrap();
        // One token at 100/s arrives within ~10ms.
        assert!(start.elapsed() >= Duration::from_millis(5));
    }

    #[tokio::test]
    async fn acquire_timeout_expires() {
        let limiter = RateLimiter::new(0.5, Some(1.0)).unwrap();
        assert!(limiter.try_acquire(1.0).unwrap());

        let err = limiter
            .acquire_timeout(1.0, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, RateLimitError::Timeout(_)));
    }

    #[tokio::test]
    async fn sustained_rate_stays_bounded() {
        let limiter = RateLimiter::new(50.0, Some(5.0)).unwrap();
        let start = Instant::now();
        let mut acquired = 0u32;
        while start.elapsed() < Duration::from_millis(400) {
            if limiter.try_acquire(1.0).unwrap() {
                acquired += 1;
            } else {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        }
        let window = start.elapsed().as_secs_f64();
        let bound = (50.0 * window + 5.0).ceil() as u32;
        assert!(
            acquired <= bound,
            "acquired {acquired} tokens, bound was {bound}"
        );
    }
}
