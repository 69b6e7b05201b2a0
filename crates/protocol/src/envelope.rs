//! Opaque backend envelope
//!
//! Backend CLI traffic is a stream of JSON objects discriminated by a `type`
//! field (and sometimes a `subtype`). The bridge only ever needs a handful of
//! well-known discriminators and fields; everything else must pass through to
//! browsers byte-for-byte, including types this crate has never heard of. So
//! the envelope wraps a raw `serde_json::Value` and exposes typed peeks
//! instead of being a closed enum.

use serde_json::Value;
use thiserror::Error;

use crate::PendingPermission;

/// Well-known discriminators of the native backend grammar. Adapters for
/// foreign backends normalize into these shapes.
pub const TYPE_SYSTEM: &str = "system";
pub const TYPE_RESULT: &str = "result";
pub const TYPE_CONTROL_REQUEST: &str = "control_request";
pub const SUBTYPE_INIT: &str = "init";
pub const SUBTYPE_STATUS: &str = "status";
pub const SUBTYPE_CAN_USE_TOOL: &str = "can_use_tool";

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("invalid envelope JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("envelope must be a JSON object with a string `type` field")]
    MissingType,
}

/// What the backend reports it is doing, from `system`/`status` notices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activity {
    Running,
    Idle,
    Compacting,
}

impl Activity {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Activity::Running),
            "idle" => Some(Activity::Idle),
            "compacting" => Some(Activity::Compacting),
            _ => None,
        }
    }
}

/// A single backend→bridge message, held as raw JSON.
#[derive(Debug, Clone)]
pub struct Envelope {
    raw: Value,
}

impl Envelope {
    /// Wrap an already-parsed value. Rejects anything that is not an object
    /// carrying a string `type`.
    pub fn from_value(raw: Value) -> Result<Self, EnvelopeError> {
        match raw.get("type").and_then(Value::as_str) {
            Some(_) => Ok(Self { raw }),
            None => Err(EnvelopeError::MissingType),
        }
    }

    pub fn parse(text: &str) -> Result<Self, EnvelopeError> {
        Self::from_value(serde_json::from_str(text)?)
    }

    pub fn msg_type(&self) -> &str {
        // Checked in from_value.
        self.raw.get("type").and_then(Value::as_str).unwrap_or("")
    }

    pub fn subtype(&self) -> Option<&str> {
        self.raw.get("subtype").and_then(Value::as_str)
    }

    pub fn is_init(&self) -> bool {
        self.msg_type() == TYPE_SYSTEM && self.subtype() == Some(SUBTYPE_INIT)
    }

    pub fn is_status(&self) -> bool {
        self.msg_type() == TYPE_SYSTEM && self.subtype() == Some(SUBTYPE_STATUS)
    }

    pub fn is_turn_complete(&self) -> bool {
        self.msg_type() == TYPE_RESULT
    }

    /// Backend-internal session identifier from an init notice.
    pub fn backend_session_id(&self) -> Option<&str> {
        self.raw.get("session_id").and_then(Value::as_str)
    }

    pub fn cwd(&self) -> Option<&str> {
        self.raw.get("cwd").and_then(Value::as_str)
    }

    pub fn model(&self) -> Option<&str> {
        self.raw.get("model").and_then(Value::as_str)
    }

    /// Activity indicator from a status notice.
    pub fn activity(&self) -> Option<Activity> {
        self.raw
            .get("status")
            .and_then(Value::as_str)
            .and_then(Activity::parse)
    }

    /// Extract a pending permission request from a
    /// `control_request`/`can_use_tool` envelope.
    pub fn permission_request(&self) -> Option<PendingPermission> {
        if self.msg_type() != TYPE_CONTROL_REQUEST {
            return None;
        }
        let request_id = self.raw.get("request_id").and_then(Value::as_str)?;
        let request = self.raw.get("request")?;
        if request.get("subtype").and_then(Value::as_str) != Some(SUBTYPE_CAN_USE_TOOL) {
            return None;
        }
        Some(PendingPermission {
            request_id: request_id.to_string(),
            tool_name: request
                .get("tool_name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            input: request.get("input").cloned().unwrap_or(Value::Null),
            suggestions: request.get("permission_suggestions").cloned(),
        })
    }

    pub fn as_value(&self) -> &Value {
        &self.raw
    }

    pub fn into_value(self) -> Value {
        self.raw
    }

    /// Serialized form forwarded to browsers.
    pub fn to_text(&self) -> String {
        self.raw.to_string()
    }
}
