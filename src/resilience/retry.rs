//! Backoff computation for the bounded retry loop.
//!
//! The loop itself lives in the adapter facade so that every attempt
//! re-enters the rate limiter and re-checks the circuit breaker; this module
//! only decides how long to pause before attempt k.

use rand::Rng;
use std::time::Duration;

use crate::config::RetryPolicy;

/// Delay before retry attempt `attempt` (1-based):
/// `min(base * 2^(attempt-1), max) + jitter`, jitter uniform in `[0, base)`.
pub fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let base = policy.base_delay_ms.max(1);
    let cap = policy.max_delay_ms;

    let exp = attempt.saturating_sub(1).min(63);
    let scaled = base.saturating_mul(1u64 << exp).min(cap);

    let jitter = rand::thread_rng().gen_range(0..base);
    Duration::from_millis(scaled.saturating_add(jitter))
}
