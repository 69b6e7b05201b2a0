//! Tether Adapters
//!
//! One adapter per backend kind. An adapter normalizes a backend's wire
//! messages into the bridge's envelope shape and renders browser commands in
//! the backend's expected shape, so the bridge's routing stays
//! backend-agnostic — it only ever sees already-normalized envelopes.

mod foreign;
mod native;

use std::sync::Arc;

pub use foreign::ForeignAdapter;
pub use native::NativeAdapter;

use serde_json::Value;
use tether_protocol::{BackendKind, BrowserMessage, Envelope, EnvelopeError};
use thiserror::Error;

/// Errors that can occur while translating either direction.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("malformed backend message: {0}")]
    Envelope(#[from] EnvelopeError),

    #[error("malformed foreign event: {0}")]
    ForeignEvent(String),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Two-method translation seam between the bridge and a backend's wire
/// grammar.
pub trait ProtocolAdapter: Send + Sync {
    /// Normalize one backend wire message into the bridge's envelope shape.
    /// `Ok(None)` means the message was transport-level and the adapter
    /// consumed it.
    fn normalize_inbound(&self, raw: Value) -> Result<Option<Envelope>, AdapterError>;

    /// Render a browser command in the backend's expected wire shape.
    /// `Ok(None)` means the command has no meaning for this backend.
    fn normalize_outbound(&self, command: &BrowserMessage) -> Result<Option<Value>, AdapterError>;
}

/// Construct the adapter for a backend kind.
pub fn adapter_for(kind: BackendKind) -> Arc<dyn ProtocolAdapter> {
    match kind {
        BackendKind::Native => Arc::new(NativeAdapter::new()),
        BackendKind::Foreign => Arc::new(ForeignAdapter::new()),
    }
}
