//! Service backends: protocol channel and direct REST.
//!
//! Backends translate the generic [`Operation`](crate::Operation) payload
//! into service-specific request shapes and map service errors into the
//! shared [`Failure`](crate::Failure) taxonomy. The payload itself stays
//! opaque: business-field validation belongs to the caller.

use async_trait::async_trait;

use crate::config::BackendKind;
use crate::{Operation, OperationResult};

pub mod profiles;
pub mod protocol;
pub mod rest;

pub use profiles::RestProfile;
pub use protocol::{ProtocolBackend, ToolChannel, ToolInfo, ToolOutcome};
pub use rest::RestBackend;

/// Narrow contract every backend implements. The selector never branches on
/// concrete types; it only asks `supports`/`healthy` and calls `invoke`.
#[async_trait]
pub trait Backend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Whether this backend implements the named operation.
    fn supports(&self, operation: &str) -> bool;

    /// Whether the backend is currently usable. A protocol channel that
    /// failed to initialize reports false so the selector falls back.
    fn healthy(&self) -> bool {
        true
    }

    /// Perform one attempt. Retry and admission decisions live above.
    async fn invoke(&self, op: &Operation, token: &str) -> OperationResult;
}
