//! Optional auth token middleware.
//!
//! When `--auth-token` is configured, all requests to `/ws/browser/*` and
//! `/api/*` must include `Authorization: Bearer <token>` (or `?token=<token>`
//! for WebSocket upgrades, which can't set headers from a browser). The
//! `/health` endpoint and `/ws/cli/*` stay unauthenticated — CLI sockets are
//! opened by locally-spawned subprocesses and are implicitly trusted.

use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::Response,
};

/// Axum middleware that checks for a valid auth token.
pub async fn auth_middleware(
    State(expected_token): State<String>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    let path = req.uri().path();

    if !requires_auth(path) {
        return Ok(next.run(req).await);
    }

    // Check Authorization header first
    if let Some(auth_header) = req.headers().get("authorization") {
        if let Ok(value) = auth_header.to_str() {
            if let Some(token) = value.strip_prefix("Bearer ") {
                if token == expected_token {
                    return Ok(next.run(req).await);
                }
            }
        }
    }

    // Check ?token= query param (for WebSocket connections)
    if let Some(query) = req.uri().query() {
        for pair in query.split('&') {
            if let Some(token) = pair.strip_prefix("token=") {
                if token == expected_token {
                    return Ok(next.run(req).await);
                }
            }
        }
    }

    Err(StatusCode::UNAUTHORIZED)
}

fn requires_auth(path: &str) -> bool {
    !(path == "/health" || path.starts_with("/ws/cli/"))
}
