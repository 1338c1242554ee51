//! Adapter facade: the single entry point callers use.
//!
//! `execute` resolves a backend per call (protocol channel first when
//! configured and healthy, REST otherwise), gates it through the service's
//! circuit breaker and rate limiter, attaches credentials, and wraps the
//! attempt in the bounded retry loop. Every call produces exactly one
//! terminal [`OperationResult`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::backend::{Backend, ProtocolBackend, RestBackend, RestProfile, ToolChannel};
use crate::config::{AdapterConfig, BackendKind, ServiceDescriptor};
use crate::credentials::CredentialManager;
use crate::resilience::{backoff_delay, BreakerSnapshot, CircuitBreaker, RateLimiter};
use crate::{Failure, FailureKind, Operation, OperationResult, Result};

/// How the rate limiter treats an empty bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecuteMode {
    /// Wait for a token (default; background operations).
    Blocking,
    /// Reject immediately with `RateLimited` (interactive calls).
    NonBlocking,
}

struct ServiceState {
    descriptor: ServiceDescriptor,
    breaker: CircuitBreaker,
    limiter: RateLimiter,
    /// Ordered by preference; the first healthy backend supporting the
    /// operation serves the call.
    backends: Vec<Arc<dyn Backend>>,
    last_backend: std::sync::Mutex<Option<BackendKind>>,
}

type InFlightKey = (String, String);

pub struct Adapter {
    services: HashMap<String, Arc<ServiceState>>,
    credentials: Arc<CredentialManager>,
    /// Serializes concurrent calls that share an idempotency key.
    in_flight: tokio::sync::Mutex<HashMap<InFlightKey, Arc<tokio::sync::Mutex<()>>>>,
}

pub struct AdapterBuilder {
    config: AdapterConfig,
    channels: HashMap<String, Arc<dyn ToolChannel>>,
    extra_backends: HashMap<String, Vec<Arc<dyn Backend>>>,
    credentials: Option<Arc<CredentialManager>>,
}

impl AdapterBuilder {
    pub fn new(config: AdapterConfig) -> Self {
        Self {
            config,
            channels: HashMap::new(),
            extra_backends: HashMap::new(),
            credentials: None,
        }
    }

    /// Attach the transport for a service's protocol channel. Without one,
    /// the service runs REST-only even if an endpoint is configured.
    pub fn with_tool_channel(
        mut self,
        service: impl Into<String>,
        channel: Arc<dyn ToolChannel>,
    ) -> Self {
        self.channels.insert(service.into(), channel);
        self
    }

    /// Register an additional backend implementation for a service.
    pub fn with_backend(mut self, service: impl Into<String>, backend: Arc<dyn Backend>) -> Self {
        self.extra_backends
            .entry(service.into())
            .or_default()
            .push(backend);
        self
    }

    pub fn with_credential_manager(mut self, credentials: Arc<CredentialManager>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub async fn build(self) -> Result<Adapter> {
        self.config.validate()?;

        let credentials = match self.credentials {
            Some(c) => c,
            None => Arc::new(CredentialManager::from_descriptors(&self.config.services)?),
        };

        let mut services = HashMap::new();
        for desc in &self.config.services {
            let mut backends: Vec<Arc<dyn Backend>> = Vec::new();

            if desc.protocol_endpoint.is_some() {
                match self.channels.get(&desc.id) {
                    Some(channel) => {
                        let backend =
                            ProtocolBackend::connect(desc.id.clone(), Arc::clone(channel)).await;
                        backends.push(Arc::new(backend));
                    }
                    None => {
                        warn!(service = %desc.id,
                              "protocol endpoint configured but no channel attached, running REST-only");
                    }
                }
            }

            if let Some(base) = &desc.rest_base_url {
                if let Some(profile) = RestProfile::for_service(&desc.id) {
                    backends.push(Arc::new(RestBackend::new(desc.id.clone(), base, profile)?));
                } else {
                    warn!(service = %desc.id, "no REST profile for service, skipping REST backend");
                }
            }

            if let Some(extra) = self.extra_backends.get(&desc.id) {
                backends.extend(extra.iter().cloned());
            }

            // Stable sort: preferred kind first, insertion order otherwise.
            let preferred = desc.preferred;
            backends.sort_by_key(|b| b.kind() != preferred);

            services.insert(
                desc.id.clone(),
                Arc::new(ServiceState {
                    breaker: CircuitBreaker::new(desc.id.clone(), desc.circuit_breaker.clone()),
                    limiter: RateLimiter::new(desc.id.clone(), desc.rate_limit.clone()),
                    backends,
                    last_backend: std::sync::Mutex::new(None),
                    descriptor: desc.clone(),
                }),
            );
        }

        Ok(Adapter {
            services,
            credentials,
            in_flight: tokio::sync::Mutex::new(HashMap::new()),
        })
    }
}

impl Adapter {
    pub fn builder(config: AdapterConfig) -> AdapterBuilder {
        AdapterBuilder::new(config)
    }

    /// The caller-facing entry point. Blocking limiter mode; see
    /// [`execute_op`](Self::execute_op) for interactive calls.
    pub async fn execute(
        &self,
        service: &str,
        operation: &str,
        payload: serde_json::Value,
        idempotency_key: Option<String>,
        deadline: Option<Instant>,
    ) -> OperationResult {
        let mut op = Operation::new(service, operation).with_payload(payload);
        op.idempotency_key = idempotency_key;
        op.deadline = deadline;
        self.execute_op(op, ExecuteMode::Blocking).await
    }

    pub async fn execute_op(&self, op: Operation, mode: ExecuteMode) -> OperationResult {
        // Correlation id shared by every log line this call emits.
        let call_id = Uuid::new_v4();
        let span = info_span!("execute", call = %call_id, service = %op.service, operation = %op.name);
        self.execute_inner(op, mode).instrument(span).await
    }

    async fn execute_inner(&self, op: Operation, mode: ExecuteMode) -> OperationResult {
        let state = self.services.get(&op.service).ok_or_else(|| {
            Failure::unsupported(format!("no backend configured for service {}", op.service))
        })?;

        if op.expired() {
            return Err(Failure::deadline_exceeded(format!(
                "deadline already elapsed before executing {}::{}",
                op.service, op.name
            )));
        }

        // Identical in-flight idempotency keys are serialized, never run
        // concurrently; the key itself is reused verbatim across retries.
        match op.idempotency_key.clone() {
            Some(key) => {
                let slot = {
                    let mut map = self.in_flight.lock().await;
                    map.entry((op.service.clone(), key.clone()))
                        .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                        .clone()
                };
                let guard = slot.clone().lock_owned().await;
                let result = self.run_attempts(state, &op, mode).await;
                drop(guard);

                let mut map = self.in_flight.lock().await;
                // map entry + our clone = 2; anything higher means waiters.
                if Arc::strong_count(&slot) <= 2 {
                    map.remove(&(op.service.clone(), key));
                }
                result
            }
            None => self.run_attempts(state, &op, mode).await,
        }
    }

    async fn run_attempts(
        &self,
        state: &ServiceState,
        op: &Operation,
        mode: ExecuteMode,
    ) -> OperationResult {
        let retry = &state.descriptor.retry;
        let mut attempt: u32 = 0;

        loop {
            if op.expired() {
                return Err(Failure::deadline_exceeded(format!(
                    "deadline exceeded during {}::{}",
                    op.service, op.name
                )));
            }

            // A breaker that opened mid-sequence stops further attempts here.
            let admission = state.breaker.admit()?;

            match mode {
                ExecuteMode::Blocking => {
                    if let Err(f) = state.limiter.acquire(op.deadline).await {
                        state.breaker.cancel(admission);
                        return Err(f);
                    }
                }
                ExecuteMode::NonBlocking => {
                    if !state.limiter.try_acquire().await {
                        state.breaker.cancel(admission);
                        return Err(Failure::rate_limited(format!(
                            "rate limit exceeded for service {}",
                            op.service
                        )));
                    }
                }
            }

            let token = match self.credentials.token(&op.service).await {
                Ok(t) => t,
                Err(f) => {
                    state.breaker.cancel(admission);
                    return Err(f);
                }
            };

            let backend = match state
                .backends
                .iter()
                .find(|b| b.healthy() && b.supports(&op.name))
            {
                Some(b) => b,
                None => {
                    state.breaker.cancel(admission);
                    return Err(Failure::unsupported(format!(
                        "no backend implements {}::{}",
                        op.service, op.name
                    )));
                }
            };

            if backend.kind() != state.descriptor.preferred {
                info!(service = %op.service, operation = %op.name, backend = %backend.kind(),
                      preferred = %state.descriptor.preferred,
                      "falling back to non-preferred backend");
            }
            info!(service = %op.service, operation = %op.name, backend = %backend.kind(),
                  attempt, "backend selected");
            if let Ok(mut last) = state.last_backend.lock() {
                *last = Some(backend.kind());
            }

            let outcome = match op.deadline {
                Some(d) => {
                    match tokio::time::timeout_at(
                        tokio::time::Instant::from_std(d),
                        backend.invoke(op, &token),
                    )
                    .await
                    {
                        Ok(r) => r,
                        Err(_) => {
                            // Outcome unknown; neither success nor failure is
                            // recorded against the breaker.
                            state.breaker.cancel(admission);
                            return Err(Failure::deadline_exceeded(format!(
                                "deadline exceeded mid-call for {}::{}",
                                op.service, op.name
                            )));
                        }
                    }
                }
                None => backend.invoke(op, &token).await,
            };

            match outcome {
                Ok(value) => {
                    state.breaker.record_success(admission);
                    return Ok(value);
                }
                Err(failure) => {
                    // CircuitOpen surfaced by a downstream layer is retryable
                    // at the caller's discretion only.
                    if !failure.retryable || failure.kind == FailureKind::CircuitOpen {
                        state.breaker.record_failure(admission, &failure);
                        warn!(service = %op.service, operation = %op.name,
                              kind = %failure.kind, "terminal failure");
                        return Err(failure);
                    }
                    if attempt >= retry.max_retries {
                        // The breaker counts the terminal outcome of the
                        // whole call, not every internal attempt.
                        state.breaker.record_failure(admission, &failure);
                        warn!(service = %op.service, operation = %op.name,
                              kind = %failure.kind, attempts = attempt + 1,
                              "retries exhausted");
                        return Err(failure);
                    }

                    // A failed HalfOpen trial re-opens the circuit; the next
                    // admission check terminates the sequence with
                    // CircuitOpen, so skip the backoff.
                    if admission.is_trial() && failure.counts_toward_breaker() {
                        state.breaker.record_failure(admission, &failure);
                        attempt += 1;
                        continue;
                    }
                    // Will retry: release the admission without an outcome.
                    state.breaker.cancel(admission);

                    attempt += 1;
                    let delay = backoff_delay(retry, attempt);
                    if let Some(d) = op.deadline {
                        if Instant::now() + delay >= d {
                            return Err(Failure::deadline_exceeded(format!(
                                "deadline exceeded before retry {attempt} of {}::{}",
                                op.service, op.name
                            )));
                        }
                    }
                    warn!(service = %op.service, operation = %op.name, attempt,
                          delay_ms = delay.as_millis() as u64, kind = %failure.kind,
                          "retry attempted");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Which backend served the most recent call for a service.
    pub fn last_backend(&self, service: &str) -> Option<BackendKind> {
        self.services
            .get(service)
            .and_then(|s| s.last_backend.lock().ok().and_then(|l| *l))
    }

    pub fn breaker_snapshot(&self, service: &str) -> Option<BreakerSnapshot> {
        self.services.get(service).map(|s| s.breaker.snapshot())
    }

    pub async fn limiter_snapshot(
        &self,
        service: &str,
    ) -> Option<crate::resilience::RateLimiterSnapshot> {
        match self.services.get(service) {
            Some(s) => Some(s.limiter.snapshot().await),
            None => None,
        }
    }

    pub fn credentials(&self) -> &Arc<CredentialManager> {
        &self.credentials
    }
}
