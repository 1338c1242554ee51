//! Protocol-channel backend.
//!
//! Wraps a tool-discoverable RPC transport: the channel exposes a set of
//! named tools per service (`tools/list`) and executes them (`tools/call`).
//! The concrete transport (stdio subprocess, SSE endpoint, …) lives behind
//! the [`ToolChannel`] trait; this backend only handles discovery, payload
//! pass-through, and error mapping.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::config::BackendKind;
use crate::{Failure, Operation, OperationResult, Result};

use super::Backend;

/// A tool advertised by the channel.
#[derive(Debug, Clone)]
pub struct ToolInfo {
    pub name: String,
    pub description: Option<String>,
}

/// Result of one tool call. `is_error` marks a tool-level rejection (the
/// transport worked, the tool refused the input).
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    pub content: Value,
    pub is_error: bool,
}

/// Transport seam for the structured protocol channel.
///
/// `call_tool` receives the current access token so per-request
/// authentication stays live across refreshes; channels that authenticate
/// once at connect may ignore it.
#[async_trait]
pub trait ToolChannel: Send + Sync {
    async fn list_tools(&self) -> Result<Vec<ToolInfo>>;
    async fn call_tool(&self, name: &str, arguments: Value, token: &str) -> Result<ToolOutcome>;
}

/// How long the channel sits out after a transport failure before the
/// selector tries it again.
const DEFAULT_CHANNEL_COOLDOWN: Duration = Duration::from_secs(30);

pub struct ProtocolBackend {
    service: String,
    channel: Arc<dyn ToolChannel>,
    tools: HashSet<String>,
    connected: bool,
    channel_cooldown: Duration,
    /// Set on transport failure; the backend reports unhealthy until this
    /// passes, then the next selection tries the channel again.
    unavailable_until: Mutex<Option<Instant>>,
}

impl ProtocolBackend {
    /// Connect and discover the tool set. A failed discovery still yields a
    /// backend, marked unavailable, so the selector can fall back to REST
    /// without treating initialization failure as a call error.
    pub async fn connect(service: impl Into<String>, channel: Arc<dyn ToolChannel>) -> Self {
        let service = service.into();
        match channel.list_tools().await {
            Ok(tools) => {
                info!(service = %service, tools = tools.len(), "protocol channel connected");
                Self {
                    service,
                    channel,
                    tools: tools.into_iter().map(|t| t.name).collect(),
                    connected: true,
                    channel_cooldown: DEFAULT_CHANNEL_COOLDOWN,
                    unavailable_until: Mutex::new(None),
                }
            }
            Err(e) => {
                warn!(service = %service, error = %e, "protocol channel unavailable, selector will fall back");
                Self {
                    service,
                    channel,
                    tools: HashSet::new(),
                    connected: false,
                    channel_cooldown: DEFAULT_CHANNEL_COOLDOWN,
                    unavailable_until: Mutex::new(None),
                }
            }
        }
    }

    /// Override the post-failure cooldown before the channel is retried.
    pub fn with_channel_cooldown(mut self, cooldown: Duration) -> Self {
        self.channel_cooldown = cooldown;
        self
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    fn mark_unavailable(&self) {
        if let Ok(mut until) = self.unavailable_until.lock() {
            *until = Some(Instant::now() + self.channel_cooldown);
        }
        warn!(service = %self.service, cooldown_ms = self.channel_cooldown.as_millis() as u64,
              "protocol channel sidelined, retrying after cooldown");
    }

    fn mark_available(&self) {
        if let Ok(mut until) = self.unavailable_until.lock() {
            *until = None;
        }
    }
}

#[async_trait]
impl Backend for ProtocolBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Protocol
    }

    fn supports(&self, operation: &str) -> bool {
        self.tools.contains(operation)
    }

    fn healthy(&self) -> bool {
        if !self.connected {
            return false;
        }
        match self.unavailable_until.lock() {
            Ok(until) => match *until {
                Some(at) => Instant::now() >= at,
                None => true,
            },
            Err(_) => false,
        }
    }

    async fn invoke(&self, op: &Operation, token: &str) -> OperationResult {
        // Pass the payload through as tool arguments; splice in the
        // idempotency key so the server can deduplicate retried mutations.
        let mut arguments = op.payload.clone();
        if let (Some(key), Some(obj)) = (&op.idempotency_key, arguments.as_object_mut()) {
            obj.insert("idempotency_key".to_string(), Value::String(key.clone()));
        }

        match self.channel.call_tool(&op.name, arguments, token).await {
            Ok(outcome) if outcome.is_error => Err(Failure::validation(format!(
                "tool {} rejected the request: {}",
                op.name, outcome.content
            ))),
            Ok(outcome) => {
                self.mark_available();
                Ok(outcome.content)
            }
            Err(e) => {
                // Transport-level trouble: sideline the channel so following
                // selections go to REST until the cooldown passes.
                if e.kind == crate::FailureKind::Transient {
                    self.mark_unavailable();
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct StubChannel {
        tools: Vec<&'static str>,
        fail_listing: bool,
        /// Fail this many calls with a transient error before succeeding.
        fail_first: AtomicU32,
        calls: AtomicU32,
        seen_tokens: Mutex<Vec<String>>,
    }

    impl StubChannel {
        fn new(tools: Vec<&'static str>) -> Self {
            Self {
                tools,
                fail_listing: false,
                fail_first: AtomicU32::new(0),
                calls: AtomicU32::new(0),
                seen_tokens: Mutex::new(Vec::new()),
            }
        }

        fn failing_first(tools: Vec<&'static str>, failures: u32) -> Self {
            let stub = Self::new(tools);
            stub.fail_first.store(failures, Ordering::SeqCst);
            stub
        }
    }

    #[async_trait]
    impl ToolChannel for StubChannel {
        async fn list_tools(&self) -> Result<Vec<ToolInfo>> {
            if self.fail_listing {
                return Err(Failure::transient("channel down"));
            }
            Ok(self
                .tools
                .iter()
                .map(|t| ToolInfo {
                    name: t.to_string(),
                    description: None,
                })
                .collect())
        }

        async fn call_tool(&self, name: &str, arguments: Value, token: &str) -> Result<ToolOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Ok(mut tokens) = self.seen_tokens.lock() {
                tokens.push(token.to_string());
            }
            if self
                .fail_first
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(Failure::transient("connection reset"));
            }
            if name == "reject_me" {
                return Ok(ToolOutcome {
                    content: Value::String("bad input".to_string()),
                    is_error: true,
                });
            }
            Ok(ToolOutcome {
                content: arguments,
                is_error: false,
            })
        }
    }

    #[tokio::test]
    async fn discovery_populates_supports() {
        let channel = Arc::new(StubChannel::new(vec!["create_issue", "search_issues"]));
        let backend = ProtocolBackend::connect("jira", channel).await;
        assert!(backend.healthy());
        assert!(backend.supports("create_issue"));
        assert!(!backend.supports("get_cost_report"));
    }

    #[tokio::test]
    async fn failed_discovery_marks_unavailable() {
        let mut stub = StubChannel::new(vec!["create_issue"]);
        stub.fail_listing = true;
        let backend = ProtocolBackend::connect("jira", Arc::new(stub)).await;
        assert!(!backend.healthy());
        assert!(!backend.supports("create_issue"));
    }

    #[tokio::test]
    async fn idempotency_key_is_spliced_into_arguments() {
        let channel = Arc::new(StubChannel::new(vec!["create_issue"]));
        let backend = ProtocolBackend::connect("jira", channel).await;
        let op = Operation::new("jira", "create_issue")
            .with_payload(serde_json::json!({"summary": "crash"}))
            .with_idempotency_key("abc-123");
        let echoed = backend.invoke(&op, "tok").await.unwrap();
        assert_eq!(echoed["idempotency_key"], "abc-123");
        assert_eq!(echoed["summary"], "crash");
    }

    #[tokio::test]
    async fn tool_rejection_maps_to_validation() {
        let channel = Arc::new(StubChannel::new(vec!["reject_me"]));
        let backend = ProtocolBackend::connect("jira", channel).await;
        let op = Operation::new("jira", "reject_me");
        let err = backend.invoke(&op, "tok").await.unwrap_err();
        assert_eq!(err.kind, crate::FailureKind::Validation);
        assert!(!err.retryable);
    }

    #[tokio::test]
    async fn transport_failure_sidelines_until_cooldown() {
        let stub = StubChannel::failing_first(vec!["create_issue"], 1);
        let backend = ProtocolBackend::connect("jira", Arc::new(stub)).await
            .with_channel_cooldown(Duration::from_millis(20));
        assert!(backend.healthy());

        let op = Operation::new("jira", "create_issue");
        let err = backend.invoke(&op, "tok").await.unwrap_err();
        assert_eq!(err.kind, crate::FailureKind::Transient);
        assert!(!backend.healthy());

        // Cooldown elapsed: the channel is tried again and one success
        // restores it for good.
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(backend.healthy());
        backend.invoke(&op, "tok").await.unwrap();
        assert!(backend.healthy());
    }

    #[tokio::test]
    async fn token_is_passed_to_the_channel() {
        let channel = Arc::new(StubChannel::new(vec!["create_issue"]));
        let backend = ProtocolBackend::connect("jira", Arc::clone(&channel) as Arc<dyn ToolChannel>).await;
        let op = Operation::new("jira", "create_issue");
        backend.invoke(&op, "tok-1").await.unwrap();
        backend.invoke(&op, "tok-2").await.unwrap();
        assert_eq!(
            *channel.seen_tokens.lock().unwrap(),
            vec!["tok-1".to_string(), "tok-2".to_string()]
        );
    }
}
