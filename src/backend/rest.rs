//! Direct REST backend.
//!
//! One instance per service, built around a pooled `reqwest` client. Routes
//! come from the service's [`RestProfile`]; responses are mapped into the
//! shared failure taxonomy. The idempotency key travels as the standard
//! `Idempotency-Key` header so retried mutations deduplicate server-side.

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use crate::backend::profiles::{PayloadAs, RestProfile, Route};
use crate::config::BackendKind;
use crate::{Failure, Operation, OperationResult, Result};

use super::Backend;

pub struct RestBackend {
    service: String,
    base_url: String,
    profile: RestProfile,
    client: reqwest::Client,
}

impl RestBackend {
    pub fn new(
        service: impl Into<String>,
        base_url: impl Into<String>,
        profile: RestProfile,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(32)
            .pool_idle_timeout(Some(Duration::from_secs(90)))
            .build()
            .map_err(|e| Failure::transient(format!("http client init failed: {e}")))?;

        Ok(Self {
            service: service.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            profile,
            client,
        })
    }

    /// Fill `{field}` placeholders in a path template from payload scalars.
    /// Consumed fields are removed from the returned payload copy so they are
    /// not sent twice.
    fn render_path(route: &Route, payload: &Value) -> Result<(String, Value)> {
        let mut path = route.path.to_string();
        let mut remaining = payload.clone();

        while let Some(start) = path.find('{') {
            let end = path[start..].find('}').map(|i| start + i).ok_or_else(|| {
                Failure::validation(format!("malformed path template {}", route.path))
            })?;
            let field = path[start + 1..end].to_string();

            let value = remaining
                .as_object()
                .and_then(|o| o.get(&field))
                .and_then(scalar_to_string)
                .ok_or_else(|| {
                    Failure::validation(format!(
                        "payload is missing path parameter '{field}' for {}",
                        route.path
                    ))
                })?;

            path.replace_range(start..=end, &value);
            if let Some(obj) = remaining.as_object_mut() {
                obj.remove(&field);
            }
        }

        Ok((path, remaining))
    }

    fn query_pairs(payload: &Value) -> Vec<(String, String)> {
        match payload.as_object() {
            Some(obj) => obj
                .iter()
                .filter_map(|(k, v)| scalar_to_string(v).map(|s| (k.clone(), s)))
                .collect(),
            None => Vec::new(),
        }
    }
}

fn scalar_to_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

#[async_trait]
impl Backend for RestBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Rest
    }

    fn supports(&self, operation: &str) -> bool {
        self.profile.supports(operation)
    }

    async fn invoke(&self, op: &Operation, token: &str) -> OperationResult {
        let route = self.profile.route(&op.name).ok_or_else(|| {
            Failure::unsupported(format!(
                "service {} has no REST route for operation {}",
                self.service, op.name
            ))
        })?;

        let (path, payload) = Self::render_path(route, &op.payload)?;
        let url = format!("{}{}", self.base_url, path);

        let mut req = match route.method {
            "POST" => self.client.post(&url),
            "PUT" => self.client.put(&url),
            "DELETE" => self.client.delete(&url),
            _ => self.client.get(&url),
        };

        req = req.bearer_auth(token).header("accept", "application/json");

        if let Some(key) = &op.idempotency_key {
            req = req.header("idempotency-key", key);
        }

        match route.send {
            PayloadAs::Json => req = req.json(&payload),
            PayloadAs::Query => req = req.query(&Self::query_pairs(&payload)),
            PayloadAs::None => {}
        }

        debug!(service = %self.service, operation = %op.name, method = route.method,
               path = %path, "rest request");

        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() {
                Failure::transient(format!("request to {} timed out: {e}", self.service))
            } else {
                Failure::transient(format!("request to {} failed: {e}", self.service))
            }
        })?;

        let status = resp.status().as_u16();
        if !(200..300).contains(&status) {
            let retry_after = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let body = resp.text().await.unwrap_or_default();
            let mut message = format!("{} returned HTTP {status}: {body}", self.service);
            if let Some(after) = retry_after {
                message.push_str(&format!(" (retry-after: {after})"));
            }
            return Err(Failure::from_status(status, message));
        }

        if status == 204 {
            return Ok(Value::Null);
        }

        resp.json::<Value>().await.map_err(|e| {
            Failure::transient(format!(
                "{} returned an unreadable body: {e}",
                self.service
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn render_path_substitutes_and_strips_fields() {
        let route = Route {
            method: "POST",
            path: "/repos/{owner}/{repo}/issues",
            send: PayloadAs::Json,
        };
        let payload = json!({"owner": "acme", "repo": "widgets", "title": "crash"});
        let (path, remaining) = RestBackend::render_path(&route, &payload).unwrap();
        assert_eq!(path, "/repos/acme/widgets/issues");
        assert_eq!(remaining, json!({"title": "crash"}));
    }

    #[test]
    fn render_path_missing_field_is_validation() {
        let route = Route {
            method: "GET",
            path: "/rest/api/3/issue/{key}",
            send: PayloadAs::None,
        };
        let err = RestBackend::render_path(&route, &json!({})).unwrap_err();
        assert_eq!(err.kind, crate::FailureKind::Validation);
        assert!(err.message.contains("key"));
    }

    #[test]
    fn query_pairs_skip_nested_values() {
        let payload = json!({"limit": 10, "cursor": "abc", "filters": {"a": 1}});
        let mut pairs = RestBackend::query_pairs(&payload);
        pairs.sort();
        assert_eq!(
            pairs,
            vec![
                ("cursor".to_string(), "abc".to_string()),
                ("limit".to_string(), "10".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn success_returns_body() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/rest/api/3/issue")
            .match_header("authorization", "Bearer tok")
            .match_header("idempotency-key", "k-1")
            .with_status(201)
            .with_body(r#"{"key": "PROJ-1"}"#)
            .create_async()
            .await;

        let backend =
            RestBackend::new("jira", server.url(), RestProfile::jira()).unwrap();
        let op = Operation::new("jira", "create_issue")
            .with_payload(json!({"summary": "crash"}))
            .with_idempotency_key("k-1");

        let out = backend.invoke(&op, "tok").await.unwrap();
        assert_eq!(out["key"], "PROJ-1");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn server_error_maps_to_transient() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v3/views")
            .with_status(503)
            .with_body("down")
            .create_async()
            .await;

        let backend =
            RestBackend::new("cloudability", server.url(), RestProfile::cloudability()).unwrap();
        let op = Operation::new("cloudability", "list_views");
        let err = backend.invoke(&op, "tok").await.unwrap_err();
        assert_eq!(err.kind, crate::FailureKind::Transient);
        assert!(err.retryable);
    }

    #[tokio::test]
    async fn too_many_requests_maps_to_rate_limited() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/api/chat.postMessage")
            .with_status(429)
            .with_header("retry-after", "7")
            .create_async()
            .await;

        let backend = RestBackend::new("slack", server.url(), RestProfile::slack()).unwrap();
        let op = Operation::new("slack", "post_message").with_payload(json!({"text": "hi"}));
        let err = backend.invoke(&op, "tok").await.unwrap_err();
        assert_eq!(err.kind, crate::FailureKind::RateLimited);
        assert!(err.message.contains("retry-after: 7"));
    }

    #[tokio::test]
    async fn unauthorized_maps_to_auth_failure() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/repos/acme/widgets")
            .with_status(401)
            .create_async()
            .await;

        let backend = RestBackend::new("github", server.url(), RestProfile::github()).unwrap();
        let op = Operation::new("github", "get_repo")
            .with_payload(json!({"owner": "acme", "repo": "widgets"}));
        let err = backend.invoke(&op, "tok").await.unwrap_err();
        assert_eq!(err.kind, crate::FailureKind::AuthFailure);
        assert!(!err.retryable);
    }

    #[tokio::test]
    async fn query_route_sends_payload_as_params() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/rest/api/3/search")
            .match_query(mockito::Matcher::UrlEncoded(
                "jql".to_string(),
                "project = PROJ".to_string(),
            ))
            .with_body(r#"{"issues": []}"#)
            .create_async()
            .await;

        let backend = RestBackend::new("jira", server.url(), RestProfile::jira()).unwrap();
        let op = Operation::new("jira", "search_issues")
            .with_payload(json!({"jql": "project = PROJ"}));
        backend.invoke(&op, "tok").await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn unknown_operation_is_unsupported() {
        let backend =
            RestBackend::new("jira", "https://example.invalid", RestProfile::jira()).unwrap();
        let op = Operation::new("jira", "get_cost_report");
        let err = backend.invoke(&op, "tok").await.unwrap_err();
        assert_eq!(err.kind, crate::FailureKind::Unsupported);
    }
}
