//! Per-service token-bucket rate limiter.
//!
//! Tokens refill lazily on each access based on elapsed time; there is no
//! background timer. Invariant: available tokens stay within `[0, capacity]`.

use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

use crate::config::RateLimitPolicy;
use crate::{Failure, Result};

#[derive(Debug, Clone)]
pub struct RateLimiterSnapshot {
    pub capacity: f64,
    pub refill_rate: f64,
    pub tokens: f64,
    /// Estimated wait time until a token is available (ms), if currently empty.
    pub estimated_wait_ms: Option<u64>,
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

pub struct RateLimiter {
    service: String,
    policy: RateLimitPolicy,
    state: Mutex<Bucket>,
}

impl RateLimiter {
    pub fn new(service: impl Into<String>, policy: RateLimitPolicy) -> Self {
        let tokens = policy.capacity;
        Self {
            service: service.into(),
            policy,
            state: Mutex::new(Bucket {
                tokens,
                last_refill: Instant::now(),
            }),
        }
    }

    fn refill_locked(policy: &RateLimitPolicy, bucket: &mut Bucket) {
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            bucket.tokens = (bucket.tokens + elapsed * policy.refill_rate).min(policy.capacity);
            bucket.last_refill = now;
        }
    }

    /// Acquire one token, sleeping until one is available (blocking mode).
    ///
    /// The sleep is bounded by `deadline`: if the next token would arrive
    /// after it, the call aborts with `DeadlineExceeded` instead of waiting.
    pub async fn acquire(&self, deadline: Option<Instant>) -> Result<()> {
        loop {
            let wait = {
                let mut bucket = self.state.lock().await;
                Self::refill_locked(&self.policy, &mut bucket);
                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    return Ok(());
                }
                Duration::from_secs_f64((1.0 - bucket.tokens) / self.policy.refill_rate)
            };

            if let Some(d) = deadline {
                if Instant::now() + wait >= d {
                    return Err(Failure::deadline_exceeded(format!(
                        "deadline exceeded while waiting {}ms for a rate-limit token ({})",
                        wait.as_millis(),
                        self.service
                    )));
                }
            }

            debug!(service = %self.service, wait_ms = wait.as_millis() as u64,
                   "rate limit wait incurred");
            tokio::time::sleep(wait).await;
        }
    }

    /// Take a token if one is immediately available (non-blocking mode).
    pub async fn try_acquire(&self) -> bool {
        let mut bucket = self.state.lock().await;
        Self::refill_locked(&self.policy, &mut bucket);
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    pub async fn snapshot(&self) -> RateLimiterSnapshot {
        let mut bucket = self.state.lock().await;
        Self::refill_locked(&self.policy, &mut bucket);
        let estimated_wait_ms = if bucket.tokens < 1.0 {
            let missing = 1.0 - bucket.tokens;
            Some((missing / self.policy.refill_rate * 1000.0) as u64)
        } else {
            None
        };
        RateLimiterSnapshot {
            capacity: self.policy.capacity,
            refill_rate: self.policy.refill_rate,
            tokens: bucket.tokens,
            estimated_wait_ms,
        }
    }
}
