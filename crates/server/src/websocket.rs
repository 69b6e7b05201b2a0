//! WebSocket handling for both endpoint families.
//!
//! `/ws/cli/{session_id}` carries backend→bridge envelopes inbound and
//! bridge→backend commands outbound; `/ws/browser/{session_id}` carries the
//! forwarded broadcast stream outbound and browser commands inbound. Each
//! socket gets an outbound frame channel plus a send task; the read loop
//! hands every text frame to the bridge, which owns all routing decisions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::bridge::SocketFrame;
use crate::state::AppState;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Clone, Copy, PartialEq, Eq)]
enum SocketKind {
    Cli,
    Browser,
}

impl SocketKind {
    fn as_str(self) -> &'static str {
        match self {
            SocketKind::Cli => "cli",
            SocketKind::Browser => "browser",
        }
    }
}

/// Upgrade handler for `/ws/cli/{session_id}` — accepted only from the
/// locally-spawned subprocess, so no auth beyond the local bind.
pub async fn cli_ws_handler(
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, session_id, SocketKind::Cli))
}

/// Upgrade handler for `/ws/browser/{session_id}` — token-gated by the auth
/// middleware when configured.
pub async fn browser_ws_handler(
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, session_id, SocketKind::Browser))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, session_id: String, kind: SocketKind) {
    let conn_id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);

    if state.launcher.get_session(&session_id).is_none() {
        warn!(
            component = "websocket",
            event = "ws.connection.unknown_session",
            kind = kind.as_str(),
            session_id = %session_id,
            connection_id = conn_id,
            "Socket for unknown session, closing"
        );
        return;
    }

    info!(
        component = "websocket",
        event = "ws.connection.opened",
        kind = kind.as_str(),
        session_id = %session_id,
        connection_id = conn_id,
        "WebSocket connection opened"
    );

    let (mut ws_tx, mut ws_rx) = socket.split();

    // Channel feeding this socket's send task; the bridge holds the sender
    // in its registry.
    let (frame_tx, mut frame_rx) = mpsc::channel::<SocketFrame>(256);

    let send_task = tokio::spawn(async move {
        while let Some(frame) = frame_rx.recv().await {
            let result = match frame {
                SocketFrame::Text(text) => ws_tx.send(Message::Text(text.into())).await,
                SocketFrame::Pong(data) => ws_tx.send(Message::Pong(data)).await,
                SocketFrame::Close => {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
            };
            if result.is_err() {
                debug!(
                    component = "websocket",
                    event = "ws.send.disconnected",
                    connection_id = conn_id,
                    "WebSocket send failed, peer disconnected"
                );
                break;
            }
        }
    });

    match kind {
        SocketKind::Cli => {
            state
                .bridge
                .cli_open(&session_id, conn_id, frame_tx.clone())
                .await
        }
        SocketKind::Browser => {
            state
                .bridge
                .browser_open(&session_id, conn_id, frame_tx.clone())
                .await
        }
    }

    while let Some(result) = ws_rx.next().await {
        let text = match result {
            Ok(Message::Text(text)) => text,
            Ok(Message::Ping(data)) => {
                let _ = frame_tx.send(SocketFrame::Pong(data)).await;
                continue;
            }
            Ok(Message::Close(_)) => {
                info!(
                    component = "websocket",
                    event = "ws.connection.close_frame",
                    kind = kind.as_str(),
                    session_id = %session_id,
                    connection_id = conn_id,
                    "Peer sent close frame"
                );
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                warn!(
                    component = "websocket",
                    event = "ws.connection.error",
                    kind = kind.as_str(),
                    session_id = %session_id,
                    connection_id = conn_id,
                    error = %e,
                    "WebSocket error"
                );
                break;
            }
        };

        match kind {
            SocketKind::Cli => {
                state
                    .bridge
                    .route_cli_message(&session_id, conn_id, &text)
                    .await
            }
            SocketKind::Browser => state.bridge.route_browser_message(&session_id, &text).await,
        }
    }

    match kind {
        SocketKind::Cli => state.bridge.cli_close(&session_id, conn_id).await,
        SocketKind::Browser => state.bridge.browser_close(&session_id, conn_id).await,
    }

    // Dropping the last sender ends the send task.
    drop(frame_tx);
    let _ = send_task.await;

    info!(
        component = "websocket",
        event = "ws.connection.closed",
        kind = kind.as_str(),
        session_id = %session_id,
        connection_id = conn_id,
        "WebSocket connection closed"
    );
}
