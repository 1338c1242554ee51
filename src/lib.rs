//! # collab-adapter
//!
//! Resilient integration adapter for external collaborator services (issue
//! trackers, wikis, code hosts, chat platforms, cost-management APIs).
//!
//! ## Overview
//!
//! The adapter routes operations to a service through either a structured
//! protocol channel (a tool-discoverable RPC transport) or a direct REST
//! backend, while enforcing per-service rate limits, circuit breaking on
//! sustained failure, bounded retries with exponential backoff and jitter,
//! and credential refresh. Callers see one contract:
//!
//! ```rust,no_run
//! use collab_adapter::{Adapter, AdapterConfig};
//!
//! #[tokio::main]
//! async fn main() -> collab_adapter::Result<()> {
//!     let config = AdapterConfig::from_yaml_file("adapter.yaml")?;
//!     let adapter = Adapter::builder(config).build().await?;
//!
//!     let issue = adapter
//!         .execute(
//!             "jira",
//!             "create_issue",
//!             serde_json::json!({"summary": "Checkout page crashes on submit"}),
//!             Some("order-4711-crash".to_string()),
//!             None,
//!         )
//!         .await?;
//!     println!("created {}", issue["key"]);
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`adapter`] | Backend selection, retry loop, caller-facing facade |
//! | [`backend`] | Protocol-channel and REST backends, per-service profiles |
//! | [`config`] | Static per-service descriptors and policies |
//! | [`credentials`] | Token cache with single-flight refresh |
//! | [`error`] | Shared failure taxonomy |
//! | [`operation`] | Request value objects |
//! | [`resilience`] | Circuit breaker, rate limiter, backoff |
//!
//! ## Failure semantics
//!
//! The adapter recovers only from `Transient` and `RateLimited` failures,
//! via bounded retry; every other kind propagates to the caller untouched.
//! A call always yields exactly one terminal result, even when several
//! attempts run internally.

pub mod adapter;
pub mod backend;
pub mod config;
pub mod credentials;
pub mod error;
pub mod operation;
pub mod resilience;

pub use adapter::{Adapter, AdapterBuilder, ExecuteMode};
pub use backend::{Backend, ProtocolBackend, RestBackend, ToolChannel, ToolInfo, ToolOutcome};
pub use config::{
    AdapterConfig, BackendKind, BreakerPolicy, CredentialSpec, RateLimitPolicy, RetryPolicy,
    ServiceDescriptor,
};
pub use credentials::{CredentialManager, CredentialRecord};
pub use error::{Failure, FailureKind};
pub use operation::Operation;
pub use resilience::{CircuitBreaker, CircuitState, RateLimiter};

/// Result type alias for the library.
pub type Result<T> = std::result::Result<T, Failure>;

/// Terminal outcome of one adapter operation: a success payload or a typed
/// failure.
pub type OperationResult = Result<serde_json::Value>;
