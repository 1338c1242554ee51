//! Resilience primitives scoped per service.
//!
//! All mutable state (breaker state, bucket levels) lives inside explicit
//! per-service instances guarded by their own locks, never module-level
//! globals, so one service under load cannot block admission checks for
//! another and tests can instantiate independent registries.
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`circuit_breaker`] | Closed/Open/HalfOpen failure gating |
//! | [`rate_limiter`] | Token-bucket throttling, blocking and non-blocking |
//! | [`retry`] | Exponential backoff with jitter |

pub mod circuit_breaker;
pub mod rate_limiter;
pub mod retry;

pub use circuit_breaker::{Admission, BreakerSnapshot, CircuitBreaker, CircuitState};
pub use rate_limiter::{RateLimiter, RateLimiterSnapshot};
pub use retry::backoff_delay;
