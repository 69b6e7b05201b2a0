//! Message bridge — multiplexes one CLI socket against N browser sockets.
//!
//! Owns the live socket registries and all routing between them. Per session
//! there is at most one CLI connection (a newly accepted socket supersedes
//! and closes its predecessor) and any number of browser connections, all of
//! which receive an identical broadcast stream in arrival order. Routing is
//! backend-agnostic: each session's protocol adapter normalizes traffic both
//! ways, so the bridge only ever dispatches on already-normalized envelopes.
//!
//! Cross-cutting concerns (relaunch requests, git-info capture, first-turn
//! naming) are surfaced as [`BridgeEvent`]s on a channel wired once at
//! construction — no ambient callbacks, no global registries.

use std::collections::HashSet;
use std::sync::Arc;

use arc_swap::ArcSwap;
use bytes::Bytes;
use dashmap::DashMap;
use serde_json::{json, Value};
use tether_adapters::{adapter_for as make_adapter, ProtocolAdapter};
use tether_protocol::{
    Activity, BackendKind, BrowserMessage, PendingPermission, ServerNotice,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::launcher::ProcessLauncher;

/// A frame queued for a socket's send task.
#[derive(Debug, Clone, PartialEq)]
pub enum SocketFrame {
    Text(String),
    Pong(Bytes),
    /// Ask the send task to close the socket (used when a CLI connection is
    /// superseded).
    Close,
}

pub type FrameSender = mpsc::Sender<SocketFrame>;

/// Cross-cutting hooks emitted by the bridge, consumed by the event loop in
/// `events.rs`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeEvent {
    /// A browser connected to a session with no live CLI socket. Emitted at
    /// most once per relaunch episode (reset when a CLI socket opens).
    RelaunchNeeded { session_id: String },

    /// A session's working directory was observed for the first time.
    GitInfoObserved { session_id: String, cwd: String },

    /// The session's first turn completed; carries the user message that
    /// started it, for the auto-namer.
    FirstTurnCompleted {
        session_id: String,
        first_user_message: Option<String>,
    },

    /// Any turn completed (opportunistic git refresh).
    TurnCompleted { session_id: String },
}

struct CliConn {
    conn_id: u64,
    tx: FrameSender,
}

struct BrowserConn {
    conn_id: u64,
    tx: FrameSender,
}

#[derive(Default)]
struct TurnTracker {
    first_user_message: Option<String>,
    first_turn_seen: bool,
}

pub struct MessageBridge {
    launcher: Arc<ProcessLauncher>,
    cli_conns: DashMap<String, CliConn>,
    browser_conns: DashMap<String, Vec<BrowserConn>>,
    adapters: DashMap<String, Arc<dyn ProtocolAdapter>>,
    pending_permissions: DashMap<String, Vec<PendingPermission>>,
    turns: DashMap<String, TurnTracker>,
    git_seen: DashMap<String, ()>,
    relaunch_requested: DashMap<String, ()>,
    /// Backend message types with no browser-facing meaning. Runtime-
    /// extensible: the observed upstream set is not assumed complete.
    consumed_types: ArcSwap<HashSet<String>>,
    events_tx: mpsc::Sender<BridgeEvent>,
}

impl MessageBridge {
    pub fn new(launcher: Arc<ProcessLauncher>, events_tx: mpsc::Sender<BridgeEvent>) -> Arc<Self> {
        let consumed: HashSet<String> = ["keep_alive", "control_ack"]
            .into_iter()
            .map(str::to_string)
            .collect();
        Arc::new(Self {
            launcher,
            cli_conns: DashMap::new(),
            browser_conns: DashMap::new(),
            adapters: DashMap::new(),
            pending_permissions: DashMap::new(),
            turns: DashMap::new(),
            git_seen: DashMap::new(),
            relaunch_requested: DashMap::new(),
            consumed_types: ArcSwap::from_pointee(consumed),
            events_tx,
        })
    }

    /// Replace the locally-consumed type set.
    pub fn set_consumed_types<I: IntoIterator<Item = String>>(&self, types: I) {
        self.consumed_types
            .store(Arc::new(types.into_iter().collect()));
    }

    fn is_consumed(&self, msg_type: &str) -> bool {
        self.consumed_types.load().contains(msg_type)
    }

    /// Attach the protocol adapter for a session. Called alongside subprocess
    /// spawn; sessions without an explicit attachment fall back to an adapter
    /// derived from their recorded backend kind.
    pub fn attach_adapter(&self, session_id: &str, kind: BackendKind) {
        self.adapters.insert(session_id.to_string(), make_adapter(kind));
    }

    fn adapter(&self, session_id: &str) -> Arc<dyn ProtocolAdapter> {
        if let Some(adapter) = self.adapters.get(session_id) {
            return adapter.clone();
        }
        let kind = self
            .launcher
            .get_session(session_id)
            .map(|record| record.backend)
            .unwrap_or(BackendKind::Native);
        let adapter = make_adapter(kind);
        self.adapters.insert(session_id.to_string(), adapter.clone());
        adapter
    }

    // -- Socket lifecycle ---------------------------------------------------

    /// Register *the* CLI connection for a session, superseding any previous
    /// one. The predecessor is asked to close; its queued messages stop
    /// mattering because routing checks the registered conn id.
    pub async fn cli_open(&self, session_id: &str, conn_id: u64, tx: FrameSender) {
        let previous = self
            .cli_conns
            .insert(session_id.to_string(), CliConn { conn_id, tx });
        if let Some(previous) = previous {
            info!(
                component = "bridge",
                event = "bridge.cli.superseded",
                session_id = %session_id,
                old_connection_id = previous.conn_id,
                new_connection_id = conn_id,
                "New CLI socket supersedes previous one"
            );
            let _ = previous.tx.send(SocketFrame::Close).await;
        } else {
            info!(
                component = "bridge",
                event = "bridge.cli.opened",
                session_id = %session_id,
                connection_id = conn_id,
                "CLI socket opened"
            );
        }

        // A fresh CLI connection ends the relaunch episode and invalidates
        // any permission requests the previous process was waiting on — the
        // backend re-issues those that are still pending.
        self.relaunch_requested.remove(session_id);
        self.pending_permissions.remove(session_id);

        self.launcher.mark_connected(session_id).await;
        self.broadcast_notice(
            session_id,
            &ServerNotice::CliStatus {
                session_id: session_id.to_string(),
                connected: true,
            },
        )
        .await;
    }

    /// Deregister a CLI connection. Does not trigger a relaunch and does not
    /// reset the session's lifecycle — it only removes the write target;
    /// browsers render a disconnected indicator.
    pub async fn cli_close(&self, session_id: &str, conn_id: u64) {
        let removed = self
            .cli_conns
            .remove_if(session_id, |_, conn| conn.conn_id == conn_id);
        if removed.is_none() {
            // A superseded socket closing late; the live registration stays.
            return;
        }
        info!(
            component = "bridge",
            event = "bridge.cli.closed",
            session_id = %session_id,
            connection_id = conn_id,
            "CLI socket closed"
        );
        self.broadcast_notice(
            session_id,
            &ServerNotice::CliStatus {
                session_id: session_id.to_string(),
                connected: false,
            },
        )
        .await;
    }

    /// Add a browser socket to the session's fan-out set. Pending permission
    /// requests are replayed so a late tab can answer them; if the session
    /// has no live CLI socket and is not archived, a relaunch is requested —
    /// once per episode, however many tabs pile in.
    pub async fn browser_open(&self, session_id: &str, conn_id: u64, tx: FrameSender) {
        self.browser_conns
            .entry(session_id.to_string())
            .or_default()
            .push(BrowserConn {
                conn_id,
                tx: tx.clone(),
            });
        debug!(
            component = "bridge",
            event = "bridge.browser.opened",
            session_id = %session_id,
            connection_id = conn_id,
            "Browser socket opened"
        );

        let pending: Vec<PendingPermission> = self
            .pending_permissions
            .get(session_id)
            .map(|entry| entry.clone())
            .unwrap_or_default();
        for request in pending {
            let _ = tx
                .send(SocketFrame::Text(permission_envelope(&request).to_string()))
                .await;
        }

        if self.cli_conns.contains_key(session_id) {
            return;
        }
        let Some(record) = self.launcher.get_session(session_id) else {
            return;
        };
        if record.archived {
            return;
        }
        if self
            .relaunch_requested
            .insert(session_id.to_string(), ())
            .is_none()
        {
            info!(
                component = "bridge",
                event = "bridge.relaunch.requested",
                session_id = %session_id,
                "Browser connected with no live CLI socket, requesting relaunch"
            );
            self.emit(BridgeEvent::RelaunchNeeded {
                session_id: session_id.to_string(),
            })
            .await;
        }
    }

    pub async fn browser_close(&self, session_id: &str, conn_id: u64) {
        let mut drop_entry = false;
        if let Some(mut conns) = self.browser_conns.get_mut(session_id) {
            conns.retain(|conn| conn.conn_id != conn_id);
            drop_entry = conns.is_empty();
        }
        if drop_entry {
            self.browser_conns
                .remove_if(session_id, |_, conns| conns.is_empty());
        }
        debug!(
            component = "bridge",
            event = "bridge.browser.closed",
            session_id = %session_id,
            connection_id = conn_id,
            "Browser socket closed"
        );
    }

    pub fn browser_count(&self, session_id: &str) -> usize {
        self.browser_conns
            .get(session_id)
            .map(|conns| conns.len())
            .unwrap_or(0)
    }

    pub fn any_browsers(&self) -> bool {
        self.browser_conns.iter().any(|entry| !entry.is_empty())
    }

    /// Drop every in-memory trace of a session (after delete).
    pub async fn forget_session(&self, session_id: &str) {
        if let Some((_, conn)) = self.cli_conns.remove(session_id) {
            let _ = conn.tx.send(SocketFrame::Close).await;
        }
        if let Some((_, conns)) = self.browser_conns.remove(session_id) {
            for conn in conns {
                let _ = conn.tx.send(SocketFrame::Close).await;
            }
        }
        self.adapters.remove(session_id);
        self.pending_permissions.remove(session_id);
        self.turns.remove(session_id);
        self.git_seen.remove(session_id);
        self.relaunch_requested.remove(session_id);
    }

    // -- Routing ------------------------------------------------------------

    /// Route one backend envelope. Runs to completion per message, so a CLI
    /// socket's messages reach browsers in arrival order.
    pub async fn route_cli_message(&self, session_id: &str, conn_id: u64, text: &str) {
        let current = self
            .cli_conns
            .get(session_id)
            .map(|conn| conn.conn_id == conn_id)
            .unwrap_or(false);
        if !current {
            debug!(
                component = "bridge",
                event = "bridge.cli.stale_message",
                session_id = %session_id,
                connection_id = conn_id,
                "Dropping message from superseded CLI socket"
            );
            return;
        }

        let raw: Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(e) => {
                warn!(
                    component = "bridge",
                    event = "bridge.cli.malformed",
                    session_id = %session_id,
                    error = %e,
                    payload_bytes = text.len(),
                    payload_preview = %truncate_for_log(text, 240),
                    "Malformed CLI envelope, dropping"
                );
                return;
            }
        };

        let adapter = self.adapter(session_id);
        let envelope = match adapter.normalize_inbound(raw) {
            Ok(Some(envelope)) => envelope,
            Ok(None) => return,
            Err(e) => {
                warn!(
                    component = "bridge",
                    event = "bridge.cli.normalize_failed",
                    session_id = %session_id,
                    error = %e,
                    "Failed to normalize CLI message, dropping"
                );
                return;
            }
        };

        if envelope.is_init() {
            if let Some(token) = envelope.backend_session_id() {
                self.launcher.set_resume_token(session_id, token).await;
            }
            let cwd = envelope
                .cwd()
                .map(str::to_string)
                .or_else(|| self.launcher.get_session(session_id).map(|r| r.cwd));
            if let Some(cwd) = cwd {
                if self.git_seen.insert(session_id.to_string(), ()).is_none() {
                    self.emit(BridgeEvent::GitInfoObserved {
                        session_id: session_id.to_string(),
                        cwd,
                    })
                    .await;
                }
            }
        } else if envelope.is_status() {
            if let Some(activity) = envelope.activity() {
                self.launcher.set_activity(session_id, activity).await;
            }
        } else if self.is_consumed(envelope.msg_type()) {
            debug!(
                component = "bridge",
                event = "bridge.cli.consumed",
                session_id = %session_id,
                msg_type = envelope.msg_type(),
                "Consumed transport-level message"
            );
            return;
        } else if envelope.is_turn_complete() {
            self.launcher.set_activity(session_id, Activity::Idle).await;
            let first_user_message = {
                let mut tracker = self.turns.entry(session_id.to_string()).or_default();
                if tracker.first_turn_seen {
                    None
                } else {
                    tracker.first_turn_seen = true;
                    Some(tracker.first_user_message.clone())
                }
            };
            if let Some(first_user_message) = first_user_message {
                self.emit(BridgeEvent::FirstTurnCompleted {
                    session_id: session_id.to_string(),
                    first_user_message,
                })
                .await;
            }
            self.emit(BridgeEvent::TurnCompleted {
                session_id: session_id.to_string(),
            })
            .await;
        } else if let Some(request) = envelope.permission_request() {
            debug!(
                component = "bridge",
                event = "bridge.permission.pending",
                session_id = %session_id,
                request_id = %request.request_id,
                tool_name = %request.tool_name,
                "Recorded pending permission request"
            );
            self.pending_permissions
                .entry(session_id.to_string())
                .or_default()
                .push(request);
        }

        self.fan_out(session_id, envelope.to_text()).await;
    }

    /// Route one browser command to the session's CLI socket. With no live
    /// CLI socket the command is dropped — there is no store-and-forward
    /// queue; browsers learn liveness from `CliStatus` notices.
    pub async fn route_browser_message(&self, session_id: &str, text: &str) {
        let message: BrowserMessage = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(e) => {
                warn!(
                    component = "bridge",
                    event = "bridge.browser.malformed",
                    session_id = %session_id,
                    error = %e,
                    payload_bytes = text.len(),
                    payload_preview = %truncate_for_log(text, 240),
                    "Malformed browser command, dropping"
                );
                return;
            }
        };

        match &message {
            BrowserMessage::UserMessage { content, .. } => {
                let mut tracker = self.turns.entry(session_id.to_string()).or_default();
                if tracker.first_user_message.is_none() {
                    tracker.first_user_message = Some(content.clone());
                }
            }
            BrowserMessage::PermissionResponse { request_id, .. } => {
                if let Some(mut pending) = self.pending_permissions.get_mut(session_id) {
                    pending.retain(|request| request.request_id != *request_id);
                }
            }
            _ => {}
        }

        if let BrowserMessage::SetPermissionMode { mode } = &message {
            self.launcher.set_permission_mode(session_id, mode).await;
        }

        let adapter = self.adapter(session_id);
        let outbound = match adapter.normalize_outbound(&message) {
            Ok(Some(outbound)) => outbound,
            Ok(None) => return,
            Err(e) => {
                warn!(
                    component = "bridge",
                    event = "bridge.browser.normalize_failed",
                    session_id = %session_id,
                    error = %e,
                    "Failed to render browser command, dropping"
                );
                return;
            }
        };

        let tx = self.cli_conns.get(session_id).map(|conn| conn.tx.clone());
        match tx {
            Some(tx) => {
                let _ = tx.send(SocketFrame::Text(outbound.to_string())).await;
            }
            None => {
                debug!(
                    component = "bridge",
                    event = "bridge.browser.command_dropped",
                    session_id = %session_id,
                    "No live CLI socket, dropping browser command"
                );
            }
        }
    }

    // -- Broadcast primitives ----------------------------------------------

    /// Generic fan-out of an arbitrary payload (PR status pushes etc.).
    /// No-op when no browser sockets are registered.
    pub async fn broadcast_to_session(&self, session_id: &str, payload: Value) {
        self.fan_out(session_id, payload.to_string()).await;
    }

    pub async fn broadcast_notice(&self, session_id: &str, notice: &ServerNotice) {
        match serde_json::to_string(notice) {
            Ok(text) => self.fan_out(session_id, text).await,
            Err(e) => warn!(
                component = "bridge",
                event = "bridge.notice.serialize_failed",
                session_id = %session_id,
                error = %e,
                "Failed to serialize server notice"
            ),
        }
    }

    async fn fan_out(&self, session_id: &str, text: String) {
        let senders: Vec<FrameSender> = self
            .browser_conns
            .get(session_id)
            .map(|conns| conns.iter().map(|conn| conn.tx.clone()).collect())
            .unwrap_or_default();
        for tx in senders {
            let _ = tx.send(SocketFrame::Text(text.clone())).await;
        }
    }

    async fn emit(&self, event: BridgeEvent) {
        if self.events_tx.send(event).await.is_err() {
            warn!(
                component = "bridge",
                event = "bridge.events.closed",
                "Bridge event channel closed, hook dropped"
            );
        }
    }
}

/// Re-render a pending permission in the envelope shape it originally
/// arrived in, for replay to late-joining browser sockets.
fn permission_envelope(request: &PendingPermission) -> Value {
    let mut body = json!({
        "subtype": "can_use_tool",
        "tool_name": request.tool_name,
        "input": request.input,
    });
    if let Some(suggestions) = &request.suggestions {
        body["permission_suggestions"] = suggestions.clone();
    }
    json!({
        "type": "control_request",
        "request_id": request.request_id,
        "request": body,
    })
}

fn truncate_for_log(text: &str, max: usize) -> &str {
    let end = (0..=max.min(text.len()))
        .rev()
        .find(|&i| text.is_char_boundary(i))
        .unwrap_or(0);
    &text[..end]
}
