//! Tether Server
//!
//! Session orchestration and protocol bridge for AI coding-agent CLIs:
//! supervises each session's backend subprocess and multiplexes its CLI
//! socket against any number of browser sockets, across restarts and
//! reconnects.

mod auth;
mod bridge;
mod events;
mod git;
mod http_api;
mod launcher;
mod logging;
mod migration_runner;
mod naming;
mod paths;
mod pr_status;
mod state;
mod store;
mod watchdog;
mod websocket;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::{middleware, response::IntoResponse, routing::get, routing::post, Router};
use clap::Parser;
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::bridge::MessageBridge;
use crate::launcher::{LaunchConfig, ProcessLauncher};
use crate::state::AppState;
use crate::store::SessionStore;

#[derive(Parser, Debug)]
#[command(name = "tether", about = "Drive AI coding-agent CLIs from a browser")]
struct Args {
    /// Port to listen on.
    #[arg(long, default_value_t = 4000, env = "TETHER_PORT")]
    port: u16,

    /// Bind address.
    #[arg(long, default_value = "127.0.0.1", env = "TETHER_BIND")]
    bind: String,

    /// Data directory (default `~/.tether`).
    #[arg(long, env = "TETHER_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Require this bearer token on browser-facing routes.
    #[arg(long, env = "TETHER_AUTH_TOKEN")]
    auth_token: Option<String>,

    /// Binary spawned for native-backend sessions.
    #[arg(long, default_value = "claude", env = "TETHER_NATIVE_AGENT_BIN")]
    native_agent_bin: String,

    /// Binary spawned for foreign-backend sessions.
    #[arg(long, default_value = "codex", env = "TETHER_FOREIGN_AGENT_BIN")]
    foreign_agent_bin: String,

    /// Seconds restored sessions get to reconnect before being relaunched.
    #[arg(long, default_value_t = 10, env = "TETHER_RECONNECT_GRACE_SECS")]
    reconnect_grace_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    paths::init_data_dir(args.data_dir.as_deref());
    paths::ensure_dirs()?;
    let logging = logging::init_logging()?;

    info!(
        component = "server",
        event = "server.starting",
        run_id = %logging.run_id,
        data_dir = %paths::data_dir().display(),
        "Starting Tether server"
    );

    // Schema first; everything else reads through the store.
    {
        let mut conn = rusqlite::Connection::open(paths::db_path())?;
        migration_runner::run_migrations(&mut conn)?;
    }

    let store = SessionStore::new(paths::db_path());
    let launch_config = LaunchConfig {
        native_bin: args.native_agent_bin.clone(),
        foreign_bin: args.foreign_agent_bin.clone(),
        server_url: format!("ws://{}:{}", args.bind, args.port),
    };
    let launcher = ProcessLauncher::new(store, launch_config);

    // Hook wiring is declared once, here: the bridge emits events, the event
    // loop turns them into relaunches, git refreshes, and naming.
    let (events_tx, events_rx) = mpsc::channel(256);
    let bridge = MessageBridge::new(launcher.clone(), events_tx);
    events::spawn_event_loop(events_rx, launcher.clone(), bridge.clone());

    // The observed upstream set of transport-only message types is not
    // assumed complete; operators can widen it without a rebuild.
    if let Ok(types) = std::env::var("TETHER_CONSUMED_TYPES") {
        bridge.set_consumed_types(
            types
                .split(',')
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty()),
        );
    }

    let restored = launcher.restore_from_disk().await?;
    info!(
        component = "server",
        event = "server.restored",
        sessions = restored,
        grace_secs = args.reconnect_grace_secs,
        "Restored sessions; reconnection supervisor armed"
    );
    watchdog::spawn(
        launcher.clone(),
        Duration::from_secs(args.reconnect_grace_secs),
    );

    pr_status::PrStatusPoller::new(launcher.clone(), bridge.clone()).spawn();

    let app_state = Arc::new(AppState { launcher, bridge });

    let mut app = Router::new()
        .route("/ws/cli/{session_id}", get(websocket::cli_ws_handler))
        .route(
            "/ws/browser/{session_id}",
            get(websocket::browser_ws_handler),
        )
        .route(
            "/api/sessions",
            get(http_api::list_sessions).post(http_api::create_session),
        )
        .route(
            "/api/sessions/{session_id}",
            get(http_api::get_session).delete(http_api::delete_session),
        )
        .route(
            "/api/sessions/{session_id}/archive",
            post(http_api::archive_session),
        )
        .route(
            "/api/sessions/{session_id}/unarchive",
            post(http_api::unarchive_session),
        )
        .route(
            "/api/sessions/{session_id}/relaunch",
            post(http_api::relaunch_session),
        )
        .route(
            "/api/sessions/{session_id}/name",
            post(http_api::rename_session),
        )
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(app_state);

    // Flag/env first, then the provisioned token file.
    let auth_token = args.auth_token.clone().or_else(|| {
        std::fs::read_to_string(paths::token_file_path())
            .ok()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
    });
    if let Some(token) = auth_token {
        app = app.layer(middleware::from_fn_with_state(token, auth::auth_middleware));
    }

    let addr: SocketAddr = format!("{}:{}", args.bind, args.port).parse()?;
    info!(
        component = "server",
        event = "server.listening",
        addr = %addr,
        "Listening"
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn health_handler() -> impl IntoResponse {
    "OK"
}
