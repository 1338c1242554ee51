//! Shared failure taxonomy for adapter operations.
//!
//! Every terminal outcome of [`crate::Adapter::execute`] is either a success
//! payload or a [`Failure`] carrying a [`FailureKind`] and a retryability
//! flag. The retry controller and circuit breaker act only on `kind` and
//! `retryable`, never on payload contents.

use thiserror::Error;

/// Classification of a failed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Network or timeout level problem; the call may succeed if repeated.
    Transient,
    /// The local limiter or the remote service rejected the call for pacing.
    RateLimited,
    /// The per-service circuit is open; callers may try again later.
    CircuitOpen,
    /// Credentials were rejected or could not be refreshed.
    AuthFailure,
    /// The backend rejected the payload.
    Validation,
    /// No configured backend implements the requested operation.
    Unsupported,
    /// The operation deadline elapsed before a terminal backend result.
    DeadlineExceeded,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Transient => "transient",
            FailureKind::RateLimited => "rate_limited",
            FailureKind::CircuitOpen => "circuit_open",
            FailureKind::AuthFailure => "auth_failure",
            FailureKind::Validation => "validation",
            FailureKind::Unsupported => "unsupported",
            FailureKind::DeadlineExceeded => "deadline_exceeded",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal error for a single adapter operation.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
    /// Whether the retry controller may repeat the attempt. `CircuitOpen` is
    /// retryable at the caller level only and is never retried internally.
    pub retryable: bool,
}

impl Failure {
    pub fn new(kind: FailureKind, message: impl Into<String>, retryable: bool) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable,
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Transient, message, true)
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(FailureKind::RateLimited, message, true)
    }

    pub fn circuit_open(message: impl Into<String>) -> Self {
        Self::new(FailureKind::CircuitOpen, message, true)
    }

    pub fn auth_failure(message: impl Into<String>) -> Self {
        Self::new(FailureKind::AuthFailure, message, false)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Validation, message, false)
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Unsupported, message, false)
    }

    pub fn deadline_exceeded(message: impl Into<String>) -> Self {
        Self::new(FailureKind::DeadlineExceeded, message, false)
    }

    /// Map an HTTP status to the shared taxonomy.
    ///
    /// 429 and 408 are pacing/timeout signals, 401/403 are credential
    /// problems, remaining 4xx are payload rejections, 5xx are transient.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            429 => Self::rate_limited(message),
            408 => Self::transient(message),
            401 | 403 => Self::auth_failure(message),
            400..=499 => Self::validation(message),
            _ => Self::transient(message),
        }
    }

    /// Whether this failure counts toward the circuit breaker.
    ///
    /// Only retryable (transport-level) failures do; payload rejections and
    /// credential problems say nothing about service health.
    pub fn counts_toward_breaker(&self) -> bool {
        matches!(self.kind, FailureKind::Transient | FailureKind::RateLimited) && self.retryable
    }
}
