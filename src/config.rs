//! Static adapter configuration.
//!
//! One [`ServiceDescriptor`] per external collaborator, loaded once at
//! startup (YAML) and immutable thereafter. Resilience policies differ only
//! in their values; the algorithms are shared.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{Failure, Result};

/// Which backend implementation serves a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Structured tool-discoverable RPC channel.
    Protocol,
    /// Direct REST API.
    Rest,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Protocol => f.write_str("protocol"),
            BackendKind::Rest => f.write_str("rest"),
        }
    }
}

/// Token-bucket parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    /// Maximum burst size (tokens).
    #[serde(default = "default_capacity")]
    pub capacity: f64,
    /// Tokens replenished per second.
    #[serde(default = "default_refill_rate")]
    pub refill_rate: f64,
}

fn default_capacity() -> f64 {
    10.0
}

fn default_refill_rate() -> f64 {
    5.0
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            refill_rate: default_refill_rate(),
        }
    }
}

/// Circuit breaker thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerPolicy {
    /// Consecutive counted failures before the circuit opens.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// How long the circuit stays open before admitting a trial call.
    /// A half-open trial failure restarts the same timeout.
    #[serde(default = "default_recovery_timeout_ms")]
    pub recovery_timeout_ms: u64,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_timeout_ms() -> u64 {
    30_000
}

impl Default for BreakerPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_ms: default_recovery_timeout_ms(),
        }
    }
}

impl BreakerPolicy {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }
}

/// Bounded-retry parameters. Backoff before attempt k (k >= 1) is
/// `min(base * 2^(k-1), max) + jitter`, jitter uniform in `[0, base)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RetryPolicy {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// How the credential manager obtains tokens for a service.
///
/// Secrets themselves come from the OS keyring or environment; the
/// configuration only names where to look.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum CredentialSpec {
    /// Long-lived API key: keyring entry first, then `{SERVICE}_API_KEY`
    /// (or the named variable).
    ApiKey {
        #[serde(default)]
        env: Option<String>,
    },
    /// OAuth refresh-token grant against a token endpoint.
    Oauth {
        token_url: String,
        client_id_env: String,
        client_secret_env: String,
        refresh_token_env: String,
        #[serde(default)]
        scope: Option<String>,
    },
}

impl Default for CredentialSpec {
    fn default() -> Self {
        CredentialSpec::ApiKey { env: None }
    }
}

/// Static description of one external collaborator service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub id: String,
    #[serde(default = "default_preferred")]
    pub preferred: BackendKind,
    /// Base URL for the REST backend, if one is configured.
    #[serde(default)]
    pub rest_base_url: Option<String>,
    /// Endpoint or command URI for the protocol channel, if configured.
    #[serde(default)]
    pub protocol_endpoint: Option<String>,
    #[serde(default)]
    pub rate_limit: RateLimitPolicy,
    #[serde(default)]
    pub circuit_breaker: BreakerPolicy,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub credentials: CredentialSpec,
}

fn default_preferred() -> BackendKind {
    BackendKind::Protocol
}

/// Top-level adapter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterConfig {
    pub services: Vec<ServiceDescriptor>,
}

impl AdapterConfig {
    pub fn from_yaml_str(s: &str) -> Result<Self> {
        let cfg: AdapterConfig = serde_yaml::from_str(s)
            .map_err(|e| Failure::validation(format!("invalid adapter config: {e}")))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_yaml_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Failure::validation(format!(
                "cannot read adapter config {}: {e}",
                path.as_ref().display()
            ))
        })?;
        Self::from_yaml_str(&raw)
    }

    /// Fail fast on configuration errors so they never surface at call time.
    pub fn validate(&self) -> Result<()> {
        if self.services.is_empty() {
            return Err(Failure::validation("adapter config declares no services"));
        }
        let mut seen = std::collections::HashSet::new();
        for svc in &self.services {
            if !seen.insert(svc.id.as_str()) {
                return Err(Failure::validation(format!(
                    "duplicate service id '{}'",
                    svc.id
                )));
            }
            let rl = &svc.rate_limit;
            if !rl.capacity.is_finite() || rl.capacity < 1.0 {
                return Err(Failure::validation(format!(
                    "service '{}': rate_limit.capacity must be >= 1, got {}",
                    svc.id, rl.capacity
                )));
            }
            if !rl.refill_rate.is_finite() || rl.refill_rate <= 0.0 {
                return Err(Failure::validation(format!(
                    "service '{}': rate_limit.refill_rate must be > 0, got {}",
                    svc.id, rl.refill_rate
                )));
            }
            if svc.circuit_breaker.failure_threshold == 0 {
                return Err(Failure::validation(format!(
                    "service '{}': circuit_breaker.failure_threshold must be >= 1",
                    svc.id
                )));
            }
            if svc.retry.base_delay_ms == 0 {
                return Err(Failure::validation(format!(
                    "service '{}': retry.base_delay_ms must be >= 1",
                    svc.id
                )));
            }
            if let Some(base) = &svc.rest_base_url {
                url::Url::parse(base).map_err(|e| {
                    Failure::validation(format!(
                        "service '{}': invalid rest_base_url '{base}': {e}",
                        svc.id
                    ))
                })?;
            }
            if svc.rest_base_url.is_none() && svc.protocol_endpoint.is_none() {
                return Err(Failure::validation(format!(
                    "service '{}': no backend configured (need rest_base_url or protocol_endpoint)",
                    svc.id
                )));
            }
        }
        Ok(())
    }

    pub fn service(&self, id: &str) -> Option<&ServiceDescriptor> {
        self.services.iter().find(|s| s.id == id)
    }
}
