//! Foreign backend adapter
//!
//! The foreign CLI speaks an op/event grammar: the bridge submits
//! `{"id", "op": {...}}` operations and receives `{"id", "msg": {...}}`
//! events. Inbound events are normalized into the native envelope shapes the
//! bridge routes on; events with no browser-facing equivalent are wrapped as
//! `foreign_event` envelopes so nothing is silently lost.

use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::{json, Map, Value};
use tether_protocol::{BrowserMessage, Envelope};
use tracing::debug;

use crate::{AdapterError, ProtocolAdapter};

#[derive(Default)]
pub struct ForeignAdapter {
    submission_counter: AtomicU64,
}

impl ForeignAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    fn submit(&self, op: Value) -> Value {
        let n = self.submission_counter.fetch_add(1, Ordering::Relaxed);
        json!({ "id": format!("sub-{}", n), "op": op })
    }

    fn normalize_event(&self, event_type: &str, msg: &Map<String, Value>) -> Option<Value> {
        match event_type {
            "thread_started" => {
                let mut out = json!({ "type": "system", "subtype": "init" });
                if let Some(thread_id) = msg.get("thread_id").and_then(Value::as_str) {
                    out["session_id"] = Value::String(thread_id.to_string());
                }
                for key in ["cwd", "model"] {
                    if let Some(value) = msg.get(key) {
                        out[key] = value.clone();
                    }
                }
                Some(out)
            }
            "turn_started" => {
                Some(json!({ "type": "system", "subtype": "status", "status": "running" }))
            }
            "turn_complete" => Some(json!({ "type": "result", "subtype": "success" })),
            "turn_aborted" => {
                let mut out = json!({ "type": "result", "subtype": "aborted" });
                if let Some(reason) = msg.get("reason") {
                    out["reason"] = reason.clone();
                }
                Some(out)
            }
            "compaction_started" => {
                Some(json!({ "type": "system", "subtype": "status", "status": "compacting" }))
            }
            "exec_approval_request" => {
                let call_id = msg.get("call_id").and_then(Value::as_str)?;
                let mut input = json!({});
                for key in ["command", "cwd"] {
                    if let Some(value) = msg.get(key) {
                        input[key] = value.clone();
                    }
                }
                Some(json!({
                    "type": "control_request",
                    "request_id": call_id,
                    "request": {
                        "subtype": "can_use_tool",
                        "tool_name": "exec",
                        "input": input,
                    }
                }))
            }
            "patch_approval_request" => {
                let call_id = msg.get("call_id").and_then(Value::as_str)?;
                Some(json!({
                    "type": "control_request",
                    "request_id": call_id,
                    "request": {
                        "subtype": "can_use_tool",
                        "tool_name": "apply_patch",
                        "input": { "changes": msg.get("changes").cloned().unwrap_or(Value::Null) },
                    }
                }))
            }
            "agent_message" => Some(json!({
                "type": "assistant",
                "message": msg.get("message").cloned().unwrap_or(Value::Null),
            })),
            _ => None,
        }
    }
}

impl ProtocolAdapter for ForeignAdapter {
    fn normalize_inbound(&self, raw: Value) -> Result<Option<Envelope>, AdapterError> {
        let msg = raw
            .get("msg")
            .and_then(Value::as_object)
            .ok_or_else(|| AdapterError::ForeignEvent("missing `msg` object".to_string()))?;
        let event_type = msg
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| AdapterError::ForeignEvent("missing `msg.type`".to_string()))?;

        // Transport-level heartbeat, consumed here rather than surfaced.
        if event_type == "ping" {
            debug!(
                component = "foreign_adapter",
                event = "foreign.ping.consumed",
                "Consumed foreign transport ping"
            );
            return Ok(None);
        }

        let normalized = match self.normalize_event(event_type, msg) {
            Some(value) => value,
            None => {
                // No native equivalent — wrap so browsers still see it.
                let mut wrapped = json!({ "type": "foreign_event", "event": Value::Object(msg.clone()) });
                if let Some(id) = raw.get("id") {
                    wrapped["id"] = id.clone();
                }
                wrapped
            }
        };

        Ok(Some(Envelope::from_value(normalized)?))
    }

    fn normalize_outbound(&self, command: &BrowserMessage) -> Result<Option<Value>, AdapterError> {
        let submission = match command {
            BrowserMessage::UserMessage { content, model } => {
                let mut op = json!({
                    "type": "user_input",
                    "items": [ { "type": "text", "text": content } ],
                });
                if let Some(model) = model {
                    op["model"] = Value::String(model.clone());
                }
                self.submit(op)
            }
            BrowserMessage::PermissionResponse {
                request_id,
                decision,
                ..
            } => {
                let decision = if decision == "allow" {
                    "approved"
                } else {
                    "denied"
                };
                self.submit(json!({
                    "type": "exec_approval",
                    "id": request_id,
                    "decision": decision,
                }))
            }
            BrowserMessage::Interrupt => self.submit(json!({ "type": "interrupt" })),
            BrowserMessage::SetPermissionMode { mode } => self.submit(json!({
                "type": "override_context",
                "approval_policy": mode,
            })),
        };
        Ok(Some(submission))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter() -> ForeignAdapter {
        ForeignAdapter::new()
    }

    #[test]
    fn thread_started_normalizes_to_init() {
        let raw = json!({
            "id": "ev-1",
            "msg": { "type": "thread_started", "thread_id": "th-42", "cwd": "/repo", "model": "gpt" }
        });
        let env = adapter()
            .normalize_inbound(raw)
            .expect("normalize")
            .expect("envelope");
        assert!(env.is_init());
        assert_eq!(env.backend_session_id(), Some("th-42"));
        assert_eq!(env.cwd(), Some("/repo"));
        assert_eq!(env.model(), Some("gpt"));
    }

    #[test]
    fn turn_events_normalize_to_status_and_result() {
        let started = adapter()
            .normalize_inbound(json!({"id":"ev-2","msg":{"type":"turn_started"}}))
            .expect("normalize")
            .expect("envelope");
        assert!(started.is_status());

        let complete = adapter()
            .normalize_inbound(json!({"id":"ev-3","msg":{"type":"turn_complete"}}))
            .expect("normalize")
            .expect("envelope");
        assert!(complete.is_turn_complete());

        let aborted = adapter()
            .normalize_inbound(json!({"id":"ev-4","msg":{"type":"turn_aborted","reason":"interrupted"}}))
            .expect("normalize")
            .expect("envelope");
        assert!(aborted.is_turn_complete());
        assert_eq!(aborted.as_value()["reason"], "interrupted");
    }

    #[test]
    fn exec_approval_request_becomes_pending_permission() {
        let env = adapter()
            .normalize_inbound(json!({
                "id": "ev-5",
                "msg": { "type": "exec_approval_request", "call_id": "call-9", "command": "cargo test" }
            }))
            .expect("normalize")
            .expect("envelope");
        let pending = env.permission_request().expect("pending permission");
        assert_eq!(pending.request_id, "call-9");
        assert_eq!(pending.tool_name, "exec");
        assert_eq!(pending.input["command"], "cargo test");
    }

    #[test]
    fn pings_are_consumed() {
        let result = adapter()
            .normalize_inbound(json!({"id":"ev-6","msg":{"type":"ping"}}))
            .expect("normalize");
        assert!(result.is_none());
    }

    #[test]
    fn unknown_events_are_wrapped_not_dropped() {
        let env = adapter()
            .normalize_inbound(json!({"id":"ev-7","msg":{"type":"token_count","total":1234}}))
            .expect("normalize")
            .expect("envelope");
        assert_eq!(env.msg_type(), "foreign_event");
        assert_eq!(env.as_value()["event"]["type"], "token_count");
        assert_eq!(env.as_value()["event"]["total"], 1234);
        assert_eq!(env.as_value()["id"], "ev-7");
    }

    #[test]
    fn eventless_payloads_error() {
        assert!(adapter().normalize_inbound(json!({"id":"ev-8"})).is_err());
        assert!(adapter()
            .normalize_inbound(json!({"msg":{"no_type":true}}))
            .is_err());
    }

    #[test]
    fn user_message_submits_user_input_op() {
        let out = adapter()
            .normalize_outbound(&BrowserMessage::UserMessage {
                content: "add a failing test first".to_string(),
                model: Some("gpt-5".to_string()),
            })
            .expect("normalize")
            .expect("submission");
        assert_eq!(out["op"]["type"], "user_input");
        assert_eq!(out["op"]["items"][0]["text"], "add a failing test first");
        assert_eq!(out["op"]["model"], "gpt-5");
        assert!(out["id"].as_str().expect("id").starts_with("sub-"));
    }

    #[test]
    fn permission_decisions_map_to_foreign_vocabulary() {
        let allow = adapter()
            .normalize_outbound(&BrowserMessage::PermissionResponse {
                request_id: "call-9".to_string(),
                decision: "allow".to_string(),
                updated_input: None,
                message: None,
            })
            .expect("normalize")
            .expect("submission");
        assert_eq!(allow["op"]["type"], "exec_approval");
        assert_eq!(allow["op"]["id"], "call-9");
        assert_eq!(allow["op"]["decision"], "approved");

        let deny = adapter()
            .normalize_outbound(&BrowserMessage::PermissionResponse {
                request_id: "call-9".to_string(),
                decision: "deny".to_string(),
                updated_input: None,
                message: None,
            })
            .expect("normalize")
            .expect("submission");
        assert_eq!(deny["op"]["decision"], "denied");
    }

    #[test]
    fn interrupt_and_mode_change_submit_ops() {
        let interrupt = adapter()
            .normalize_outbound(&BrowserMessage::Interrupt)
            .expect("normalize")
            .expect("submission");
        assert_eq!(interrupt["op"]["type"], "interrupt");

        let mode = adapter()
            .normalize_outbound(&BrowserMessage::SetPermissionMode {
                mode: "never".to_string(),
            })
            .expect("normalize")
            .expect("submission");
        assert_eq!(mode["op"]["type"], "override_context");
        assert_eq!(mode["op"]["approval_policy"], "never");
    }
}
