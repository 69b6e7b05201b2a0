//! HTTP JSON API for the browser shell.
//!
//! Session CRUD lives here; everything conversational rides the WebSocket
//! endpoints. Errors use a small `{code, message}` envelope mirroring the
//! error notices pushed over the browser socket.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::json;
use tether_protocol::{BackendKind, SessionRecord};
use tracing::info;

use crate::launcher::LaunchError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub backend: BackendKind,
    pub cwd: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub permission_mode: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RenameSessionRequest {
    pub name: String,
}

pub async fn list_sessions(State(state): State<Arc<AppState>>) -> Json<Vec<SessionRecord>> {
    Json(state.launcher.list_sessions())
}

pub async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Response {
    match state.launcher.get_session(&session_id) {
        Some(record) => Json(record).into_response(),
        None => error_response(&LaunchError::UnknownSession(session_id)),
    }
}

pub async fn create_session(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateSessionRequest>,
) -> Response {
    match state
        .launcher
        .create(
            request.cwd,
            request.model,
            request.backend,
            request.permission_mode,
        )
        .await
    {
        Ok(record) => {
            state.bridge.attach_adapter(&record.id, record.backend);
            (StatusCode::CREATED, Json(record)).into_response()
        }
        Err(e) => error_response(&e),
    }
}

pub async fn relaunch_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Response {
    match state.launcher.relaunch(&session_id).await {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(e) => error_response(&e),
    }
}

pub async fn archive_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Response {
    match state.launcher.archive(&session_id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(&e),
    }
}

pub async fn unarchive_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Response {
    match state.launcher.unarchive(&session_id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(&e),
    }
}

pub async fn rename_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Json(request): Json<RenameSessionRequest>,
) -> Response {
    if state.launcher.get_session(&session_id).is_none() {
        return error_response(&LaunchError::UnknownSession(session_id));
    }
    state
        .launcher
        .set_display_name(&session_id, &request.name)
        .await;
    state
        .bridge
        .broadcast_notice(
            &session_id,
            &tether_protocol::ServerNotice::SessionNamed {
                session_id: session_id.clone(),
                name: request.name,
            },
        )
        .await;
    StatusCode::NO_CONTENT.into_response()
}

pub async fn delete_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Response {
    match state.launcher.delete(&session_id).await {
        Ok(()) => {
            state.bridge.forget_session(&session_id).await;
            info!(
                component = "http_api",
                event = "api.session.deleted",
                session_id = %session_id,
                "Session deleted via API"
            );
            StatusCode::NO_CONTENT.into_response()
        }
        Err(e) => error_response(&e),
    }
}

fn error_response(error: &LaunchError) -> Response {
    let (status, code) = match error {
        LaunchError::UnknownSession(_) => (StatusCode::NOT_FOUND, "unknown_session"),
        LaunchError::Archived(_) => (StatusCode::CONFLICT, "session_archived"),
        LaunchError::Spawn(_) => (StatusCode::BAD_GATEWAY, "spawn_failed"),
        LaunchError::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, "store_error"),
    };
    (
        status,
        Json(json!({ "code": code, "message": error.to_string() })),
    )
        .into_response()
}
