//! Native backend adapter
//!
//! The native CLI already speaks the bridge's envelope grammar, so inbound
//! translation is a validating pass-through. Outbound commands are rendered
//! as the CLI's stream-json control messages: user turns as `user` payloads,
//! everything else as `control_request`/`control_response` frames.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use serde_json::{json, Value};
use tether_protocol::{BrowserMessage, Envelope};

use crate::{AdapterError, ProtocolAdapter};

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum OutboundFrame {
    User {
        message: UserPayload,
    },
    ControlRequest {
        request_id: String,
        request: ControlRequestBody,
    },
    ControlResponse {
        response: ControlResponseBody,
    },
}

#[derive(Debug, Serialize)]
struct UserPayload {
    role: &'static str,
    content: Vec<ContentBlock>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text { text: String },
}

#[derive(Debug, Serialize)]
#[serde(tag = "subtype", rename_all = "snake_case")]
enum ControlRequestBody {
    Interrupt,
    SetPermissionMode { mode: String },
}

#[derive(Debug, Serialize)]
#[serde(tag = "subtype", rename_all = "snake_case")]
enum ControlResponseBody {
    Success { request_id: String, response: Value },
}

#[derive(Default)]
pub struct NativeAdapter {
    request_counter: AtomicU64,
}

impl NativeAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_request_id(&self) -> String {
        let n = self.request_counter.fetch_add(1, Ordering::Relaxed);
        format!("bridge-{}", n)
    }
}

impl ProtocolAdapter for NativeAdapter {
    fn normalize_inbound(&self, raw: Value) -> Result<Option<Envelope>, AdapterError> {
        Ok(Some(Envelope::from_value(raw)?))
    }

    fn normalize_outbound(&self, command: &BrowserMessage) -> Result<Option<Value>, AdapterError> {
        let frame = match command {
            BrowserMessage::UserMessage { content, model: _ } => OutboundFrame::User {
                message: UserPayload {
                    role: "user",
                    content: vec![ContentBlock::Text {
                        text: content.clone(),
                    }],
                },
            },
            BrowserMessage::PermissionResponse {
                request_id,
                decision,
                updated_input,
                message,
            } => {
                let behavior = if decision == "allow" { "allow" } else { "deny" };
                let mut response = json!({ "behavior": behavior });
                if let Some(input) = updated_input {
                    response["updatedInput"] = input.clone();
                }
                if let Some(msg) = message {
                    response["message"] = Value::String(msg.clone());
                }
                OutboundFrame::ControlResponse {
                    response: ControlResponseBody::Success {
                        request_id: request_id.clone(),
                        response,
                    },
                }
            }
            BrowserMessage::Interrupt => OutboundFrame::ControlRequest {
                request_id: self.next_request_id(),
                request: ControlRequestBody::Interrupt,
            },
            BrowserMessage::SetPermissionMode { mode } => OutboundFrame::ControlRequest {
                request_id: self.next_request_id(),
                request: ControlRequestBody::SetPermissionMode { mode: mode.clone() },
            },
        };
        Ok(Some(serde_json::to_value(frame)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inbound_is_validating_pass_through() {
        let adapter = NativeAdapter::new();
        let raw = json!({"type":"assistant","message":{"content":[{"type":"text","text":"hi"}]}});
        let env = adapter
            .normalize_inbound(raw.clone())
            .expect("normalize")
            .expect("envelope");
        assert_eq!(env.as_value(), &raw);

        assert!(adapter.normalize_inbound(json!({"no_type": true})).is_err());
    }

    #[test]
    fn user_message_renders_stream_json_user_payload() {
        let adapter = NativeAdapter::new();
        let out = adapter
            .normalize_outbound(&BrowserMessage::UserMessage {
                content: "run the tests".to_string(),
                model: None,
            })
            .expect("normalize")
            .expect("frame");
        assert_eq!(out["type"], "user");
        assert_eq!(out["message"]["role"], "user");
        assert_eq!(out["message"]["content"][0]["text"], "run the tests");
    }

    #[test]
    fn permission_response_echoes_request_id_and_behavior() {
        let adapter = NativeAdapter::new();
        let out = adapter
            .normalize_outbound(&BrowserMessage::PermissionResponse {
                request_id: "req-3".to_string(),
                decision: "deny".to_string(),
                updated_input: None,
                message: Some("not in this repo".to_string()),
            })
            .expect("normalize")
            .expect("frame");
        assert_eq!(out["type"], "control_response");
        assert_eq!(out["response"]["subtype"], "success");
        assert_eq!(out["response"]["request_id"], "req-3");
        assert_eq!(out["response"]["response"]["behavior"], "deny");
        assert_eq!(out["response"]["response"]["message"], "not in this repo");
    }

    #[test]
    fn allow_with_updated_input_carries_it_through() {
        let adapter = NativeAdapter::new();
        let out = adapter
            .normalize_outbound(&BrowserMessage::PermissionResponse {
                request_id: "req-4".to_string(),
                decision: "allow".to_string(),
                updated_input: Some(json!({"command":"echo safe"})),
                message: None,
            })
            .expect("normalize")
            .expect("frame");
        assert_eq!(out["response"]["response"]["behavior"], "allow");
        assert_eq!(
            out["response"]["response"]["updatedInput"]["command"],
            "echo safe"
        );
    }

    #[test]
    fn control_request_ids_are_unique() {
        let adapter = NativeAdapter::new();
        let a = adapter
            .normalize_outbound(&BrowserMessage::Interrupt)
            .expect("normalize")
            .expect("frame");
        let b = adapter
            .normalize_outbound(&BrowserMessage::SetPermissionMode {
                mode: "acceptEdits".to_string(),
            })
            .expect("normalize")
            .expect("frame");
        assert_eq!(a["type"], "control_request");
        assert_eq!(a["request"]["subtype"], "interrupt");
        assert_eq!(b["request"]["subtype"], "set_permission_mode");
        assert_eq!(b["request"]["mode"], "acceptEdits");
        assert_ne!(a["request_id"], b["request_id"]);
    }
}
