//! Credential acquisition, caching, and proactive refresh.
//!
//! The manager is the only writer of [`CredentialRecord`]s; backends receive
//! tokens as opaque strings. Cached tokens are returned while more than the
//! refresh buffer (default 5 minutes) remains before expiry; otherwise a
//! refresh runs before returning. Concurrent stale detections share one
//! refresh call: reads go through an `RwLock` fast path and the refresh
//! itself is guarded by a per-service mutex with a re-check after acquiring,
//! so unrelated token reads are never serialized.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use keyring::Entry;
use serde::Deserialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::config::{CredentialSpec, ServiceDescriptor};
use crate::{Failure, Result};

const DEFAULT_REFRESH_BUFFER: Duration = Duration::from_secs(300);

/// One credential set for one service. Replaced wholesale on refresh, never
/// partially mutated.
#[derive(Debug, Clone)]
pub struct CredentialRecord {
    pub access_token: String,
    pub expires_at: Option<Instant>,
    pub refresh_token: Option<String>,
    pub scope: Option<String>,
}

impl CredentialRecord {
    fn fresh(&self, buffer: Duration) -> bool {
        match self.expires_at {
            None => true,
            Some(at) => Instant::now() + buffer < at,
        }
    }
}

/// OAuth token endpoint response (refresh_token grant).
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    scope: Option<String>,
}

#[derive(Debug, Clone)]
enum Source {
    /// Long-lived API key resolved from keyring or environment.
    Static { env_override: Option<String> },
    /// Refresh-token grant against an OAuth token endpoint.
    Oauth {
        token_url: String,
        client_id_env: String,
        client_secret_env: String,
        refresh_token_env: String,
        scope: Option<String>,
    },
}

struct ServiceCredentials {
    source: Source,
    cache: RwLock<Option<CredentialRecord>>,
    refresh_lock: Mutex<()>,
}

pub struct CredentialManager {
    services: HashMap<String, Arc<ServiceCredentials>>,
    refresh_buffer: Duration,
    http: reqwest::Client,
}

impl CredentialManager {
    pub fn from_descriptors<'a>(
        descriptors: impl IntoIterator<Item = &'a ServiceDescriptor>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Failure::transient(format!("http client init failed: {e}")))?;

        let mut services = HashMap::new();
        for desc in descriptors {
            let source = match &desc.credentials {
                CredentialSpec::ApiKey { env } => Source::Static {
                    env_override: env.clone(),
                },
                CredentialSpec::Oauth {
                    token_url,
                    client_id_env,
                    client_secret_env,
                    refresh_token_env,
                    scope,
                } => Source::Oauth {
                    token_url: token_url.clone(),
                    client_id_env: client_id_env.clone(),
                    client_secret_env: client_secret_env.clone(),
                    refresh_token_env: refresh_token_env.clone(),
                    scope: scope.clone(),
                },
            };
            services.insert(
                desc.id.clone(),
                Arc::new(ServiceCredentials {
                    source,
                    cache: RwLock::new(None),
                    refresh_lock: Mutex::new(()),
                }),
            );
        }

        Ok(Self {
            services,
            refresh_buffer: DEFAULT_REFRESH_BUFFER,
            http,
        })
    }

    pub fn with_refresh_buffer(mut self, buffer: Duration) -> Self {
        self.refresh_buffer = buffer;
        self
    }

    /// Current access token for `service`, refreshing first if the cached
    /// record is inside the refresh buffer.
    pub async fn token(&self, service: &str) -> Result<String> {
        let svc = self.services.get(service).ok_or_else(|| {
            Failure::auth_failure(format!("no credentials configured for service {service}"))
        })?;

        // Fast path: shared read of a still-fresh record.
        if let Some(record) = svc.cache.read().await.as_ref() {
            if record.fresh(self.refresh_buffer) {
                return Ok(record.access_token.clone());
            }
        }

        // Slow path: single-flight refresh. Whoever wins the lock refreshes;
        // everyone else finds the fresh record on the re-check.
        let _flight = svc.refresh_lock.lock().await;
        if let Some(record) = svc.cache.read().await.as_ref() {
            if record.fresh(self.refresh_buffer) {
                return Ok(record.access_token.clone());
            }
        }

        let record = self.refresh(service, svc).await?;
        let token = record.access_token.clone();
        *svc.cache.write().await = Some(record);
        Ok(token)
    }

    async fn refresh(&self, service: &str, svc: &ServiceCredentials) -> Result<CredentialRecord> {
        match &svc.source {
            Source::Static { env_override } => {
                let key = lookup_static_key(service, env_override.as_deref()).ok_or_else(|| {
                    Failure::auth_failure(format!(
                        "no API key for service {service} (checked keyring and environment)"
                    ))
                })?;
                debug!(service, "loaded static credential");
                Ok(CredentialRecord {
                    access_token: key,
                    expires_at: None,
                    refresh_token: None,
                    scope: None,
                })
            }
            Source::Oauth {
                token_url,
                client_id_env,
                client_secret_env,
                refresh_token_env,
                scope,
            } => {
                let client_id = require_env(client_id_env)?;
                let client_secret = require_env(client_secret_env)?;
                let refresh_token = match svc.cache.read().await.as_ref() {
                    // Prefer a rotated refresh token from the previous grant.
                    Some(rec) if rec.refresh_token.is_some() => {
                        rec.refresh_token.clone().unwrap_or_default()
                    }
                    _ => require_env(refresh_token_env)?,
                };

                let mut form = vec![
                    ("grant_type", "refresh_token".to_string()),
                    ("client_id", client_id),
                    ("client_secret", client_secret),
                    ("refresh_token", refresh_token),
                ];
                if let Some(s) = scope {
                    form.push(("scope", s.clone()));
                }

                let resp = self
                    .http
                    .post(token_url)
                    .form(&form)
                    .send()
                    .await
                    .map_err(|e| {
                        Failure::auth_failure(format!("token refresh for {service} failed: {e}"))
                    })?;

                let status = resp.status().as_u16();
                if !(200..300).contains(&status) {
                    let body = resp.text().await.unwrap_or_default();
                    return Err(Failure::auth_failure(format!(
                        "token refresh for {service} rejected (HTTP {status}): {body}"
                    )));
                }

                let parsed: TokenResponse = resp.json().await.map_err(|e| {
                    Failure::auth_failure(format!(
                        "token refresh for {service} returned malformed body: {e}"
                    ))
                })?;

                info!(service, "credential refreshed");
                Ok(CredentialRecord {
                    access_token: parsed.access_token,
                    expires_at: parsed
                        .expires_in
                        .map(|secs| Instant::now() + Duration::from_secs(secs)),
                    refresh_token: parsed.refresh_token,
                    scope: parsed.scope,
                })
            }
        }
    }

    /// Seed a record directly. Used by tests and by hosts that run their own
    /// auth flow and hand the adapter a live token.
    pub async fn install(&self, service: &str, record: CredentialRecord) -> Result<()> {
        let svc = self.services.get(service).ok_or_else(|| {
            Failure::auth_failure(format!("no credentials configured for service {service}"))
        })?;
        *svc.cache.write().await = Some(record);
        Ok(())
    }
}

/// Keyring first, environment second (`{SERVICE}_API_KEY` unless overridden).
fn lookup_static_key(service: &str, env_override: Option<&str>) -> Option<String> {
    if let Ok(entry) = Entry::new("collab-adapter", service) {
        if let Ok(key) = entry.get_password() {
            return Some(key);
        }
    }
    let var = match env_override {
        Some(v) => v.to_string(),
        None => format!("{}_API_KEY", service.to_uppercase()),
    };
    std::env::var(var).ok()
}

fn require_env(var: &str) -> Result<String> {
    std::env::var(var)
        .map_err(|_| Failure::auth_failure(format!("environment variable {var} not set")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendKind;

    fn descriptor(id: &str, spec: CredentialSpec) -> ServiceDescriptor {
        ServiceDescriptor {
            id: id.to_string(),
            preferred: BackendKind::Rest,
            rest_base_url: Some("https://example.com".to_string()),
            protocol_endpoint: None,
            rate_limit: Default::default(),
            circuit_breaker: Default::default(),
            retry: Default::default(),
            credentials: spec,
        }
    }

    #[tokio::test]
    async fn unknown_service_is_auth_failure() {
        let mgr = CredentialManager::from_descriptors(&[]).unwrap();
        let err = mgr.token("nowhere").await.unwrap_err();
        assert_eq!(err.kind, crate::FailureKind::AuthFailure);
    }

    #[tokio::test]
    async fn installed_record_is_served_from_cache() {
        let descs = vec![descriptor("slack", CredentialSpec::ApiKey { env: None })];
        let mgr = CredentialManager::from_descriptors(&descs).unwrap();
        mgr.install(
            "slack",
            CredentialRecord {
                access_token: "xoxb-test".to_string(),
                expires_at: None,
                refresh_token: None,
                scope: None,
            },
        )
        .await
        .unwrap();

        assert_eq!(mgr.token("slack").await.unwrap(), "xoxb-test");
    }

    #[tokio::test]
    async fn stale_record_triggers_refresh_path() {
        // Record expiring inside the buffer forces the slow path; the static
        // source then reads the env var.
        let descs = vec![descriptor(
            "github",
            CredentialSpec::ApiKey {
                env: Some("COLLAB_ADAPTER_TEST_GH_KEY".to_string()),
            },
        )];
        std::env::set_var("COLLAB_ADAPTER_TEST_GH_KEY", "ghp_fresh");
        let mgr = CredentialManager::from_descriptors(&descs).unwrap();
        mgr.install(
            "github",
            CredentialRecord {
                access_token: "ghp_stale".to_string(),
                expires_at: Some(Instant::now() + Duration::from_secs(1)),
                refresh_token: None,
                scope: None,
            },
        )
        .await
        .unwrap();

        // 1s remaining < 300s buffer, so the stale token must be replaced.
        assert_eq!(mgr.token("github").await.unwrap(), "ghp_fresh");
        std::env::remove_var("COLLAB_ADAPTER_TEST_GH_KEY");
    }

    #[tokio::test]
    async fn concurrent_stale_detections_share_one_refresh() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/oauth/token")
            .with_status(200)
            .with_body(r#"{"access_token": "fresh", "expires_in": 3600}"#)
            .expect(1)
            .create_async()
            .await;

        std::env::set_var("COLLAB_ADAPTER_TEST_SF_ID", "client-id");
        std::env::set_var("COLLAB_ADAPTER_TEST_SF_SECRET", "client-secret");
        std::env::set_var("COLLAB_ADAPTER_TEST_SF_RT", "refresh-token");
        let descs = vec![descriptor(
            "jira",
            CredentialSpec::Oauth {
                token_url: format!("{}/oauth/token", server.url()),
                client_id_env: "COLLAB_ADAPTER_TEST_SF_ID".to_string(),
                client_secret_env: "COLLAB_ADAPTER_TEST_SF_SECRET".to_string(),
                refresh_token_env: "COLLAB_ADAPTER_TEST_SF_RT".to_string(),
                scope: None,
            },
        )];
        let mgr = Arc::new(CredentialManager::from_descriptors(&descs).unwrap());

        // Stale record: every task detects it and wants a refresh.
        mgr.install(
            "jira",
            CredentialRecord {
                access_token: "stale".to_string(),
                expires_at: Some(Instant::now() + Duration::from_secs(1)),
                refresh_token: None,
                scope: None,
            },
        )
        .await
        .unwrap();

        let mut handles = vec![];
        for _ in 0..16 {
            let mgr = Arc::clone(&mgr);
            handles.push(tokio::spawn(async move { mgr.token("jira").await }));
        }
        for h in handles {
            assert_eq!(h.await.unwrap().unwrap(), "fresh");
        }

        // Sixteen stale detections, exactly one token-endpoint call.
        mock.assert_async().await;
        std::env::remove_var("COLLAB_ADAPTER_TEST_SF_ID");
        std::env::remove_var("COLLAB_ADAPTER_TEST_SF_SECRET");
        std::env::remove_var("COLLAB_ADAPTER_TEST_SF_RT");
    }

    #[tokio::test]
    async fn oauth_refresh_requires_configured_env() {
        let descs = vec![descriptor(
            "confluence",
            CredentialSpec::Oauth {
                token_url: "https://auth.atlassian.com/oauth/token".to_string(),
                client_id_env: "COLLAB_ADAPTER_TEST_MISSING_ID".to_string(),
                client_secret_env: "COLLAB_ADAPTER_TEST_MISSING_SECRET".to_string(),
                refresh_token_env: "COLLAB_ADAPTER_TEST_MISSING_RT".to_string(),
                scope: None,
            },
        )];
        let mgr = CredentialManager::from_descriptors(&descs).unwrap();
        let err = mgr.token("confluence").await.unwrap_err();
        assert_eq!(err.kind, crate::FailureKind::AuthFailure);
        assert!(!err.retryable);
    }
}
