//! Browser ↔ bridge messages
//!
//! Unlike backend traffic, the browser alphabet is closed: four command
//! types inbound, plus a small set of server-originated notices the bridge
//! emits alongside forwarded backend envelopes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Commands sent from a browser socket to the bridge.
///
/// The session is implied by the socket path, so no variant carries a
/// session id. Commands are translated by the session's protocol adapter and
/// written to the single CLI socket; with no live CLI socket they are
/// dropped — there is no store-and-forward queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BrowserMessage {
    UserMessage {
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        model: Option<String>,
    },
    PermissionResponse {
        request_id: String,
        /// "allow" or "deny".
        decision: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        updated_input: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Interrupt,
    SetPermissionMode {
        mode: String,
    },
}

/// Server-originated messages pushed to browser sockets.
///
/// Forwarded backend envelopes keep their own `type` discriminators; these
/// notices use types no backend emits, so a browser can dispatch on `type`
/// across both streams.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerNotice {
    /// CLI socket liveness for the session — browsers render a disconnected
    /// indicator on `connected: false`.
    CliStatus { session_id: String, connected: bool },

    /// Display name assigned (by the user or the auto-namer).
    SessionNamed { session_id: String, name: String },

    Error {
        code: String,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
}
