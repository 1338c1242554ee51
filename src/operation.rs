//! Request value objects handed to [`crate::Adapter::execute`].

use std::time::{Duration, Instant};

/// A single adapter request.
///
/// The payload is opaque to the adapter layer: backends splice it into
/// service-specific request shapes but never validate business fields.
#[derive(Debug, Clone)]
pub struct Operation {
    /// Target service identifier (e.g. "jira", "cloudability").
    pub service: String,
    /// Operation name resolved against the backend's route/tool table.
    pub name: String,
    /// Structured payload, passed through unmodified.
    pub payload: serde_json::Value,
    /// Required for operations that mutate remote state; reused verbatim on
    /// every retry so the backend can deduplicate server-side.
    pub idempotency_key: Option<String>,
    /// Absolute deadline for the whole call, including retries and waits.
    pub deadline: Option<Instant>,
}

impl Operation {
    pub fn new(service: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            name: name.into(),
            payload: serde_json::Value::Null,
            idempotency_key: None,
            deadline: None,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Convenience for a deadline relative to now.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    /// Whether the deadline has already elapsed.
    pub fn expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Time remaining until the deadline, if one is set.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline.map(|d| d.saturating_duration_since(Instant::now()))
    }
}
