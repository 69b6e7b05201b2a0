//! Bridge event loop — the observer side of the bridge's hook channel.
//!
//! The bridge emits [`BridgeEvent`]s for cross-cutting concerns; this loop,
//! wired once at construction in `main.rs`, turns them into launcher calls,
//! git refreshes, and session naming. Keeping the wiring here means the
//! bridge and launcher stay testable without sockets, and no component holds
//! ad hoc mutable callback fields.

use std::sync::Arc;

use tether_protocol::ServerNotice;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::bridge::{BridgeEvent, MessageBridge};
use crate::git;
use crate::launcher::ProcessLauncher;
use crate::naming::{name_from_first_prompt, NamingGuard};

pub fn spawn_event_loop(
    mut events_rx: mpsc::Receiver<BridgeEvent>,
    launcher: Arc<ProcessLauncher>,
    bridge: Arc<MessageBridge>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let naming_guard = NamingGuard::new();
        while let Some(event) = events_rx.recv().await {
            handle_event(event, &launcher, &bridge, &naming_guard).await;
        }
    })
}

pub(crate) async fn handle_event(
    event: BridgeEvent,
    launcher: &Arc<ProcessLauncher>,
    bridge: &Arc<MessageBridge>,
    naming_guard: &NamingGuard,
) {
    match event {
        BridgeEvent::RelaunchNeeded { session_id } => {
            if let Err(e) = launcher.relaunch(&session_id).await {
                warn!(
                    component = "events",
                    event = "events.relaunch.failed",
                    session_id = %session_id,
                    error = %e,
                    "Relaunch requested by bridge failed"
                );
            }
        }
        BridgeEvent::GitInfoObserved { session_id, cwd } => {
            refresh_git(launcher, &session_id, &cwd).await;
        }
        BridgeEvent::TurnCompleted { session_id } => {
            if let Some(record) = launcher.get_session(&session_id) {
                refresh_git(launcher, &session_id, &record.cwd).await;
            }
        }
        BridgeEvent::FirstTurnCompleted {
            session_id,
            first_user_message,
        } => {
            apply_first_turn_name(&session_id, first_user_message, launcher, bridge, naming_guard)
                .await;
        }
    }
}

async fn refresh_git(launcher: &Arc<ProcessLauncher>, session_id: &str, cwd: &str) {
    if let Some(summary) = git::resolve_summary(cwd).await {
        launcher.update_git_summary(session_id, summary).await;
    }
}

async fn apply_first_turn_name(
    session_id: &str,
    first_user_message: Option<String>,
    launcher: &Arc<ProcessLauncher>,
    bridge: &Arc<MessageBridge>,
    naming_guard: &NamingGuard,
) {
    let Some(prompt) = first_user_message else {
        return;
    };
    if !naming_guard.try_claim(session_id) {
        return;
    }
    let Some(record) = launcher.get_session(session_id) else {
        return;
    };
    if record.display_name.is_some() {
        return;
    }
    let Some(name) = name_from_first_prompt(&prompt) else {
        return;
    };

    if launcher.set_display_name(session_id, &name).await {
        info!(
            component = "events",
            event = "events.session.named",
            session_id = %session_id,
            name = %name,
            "Named session from first prompt"
        );
        bridge
            .broadcast_notice(
                session_id,
                &ServerNotice::SessionNamed {
                    session_id: session_id.to_string(),
                    name,
                },
            )
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::SocketFrame;
    use crate::launcher::ProcessLauncher;
    use crate::store::test_support::temp_store;
    use tether_protocol::BackendKind;

    async fn setup() -> (
        tempfile::TempDir,
        Arc<ProcessLauncher>,
        Arc<MessageBridge>,
        String,
    ) {
        let (dir, store) = temp_store();
        let launcher = ProcessLauncher::new(
            store,
            crate::launcher::test_support::stub_agent_config(dir.path()),
        );
        let (events_tx, _events_rx) = mpsc::channel(8);
        let bridge = MessageBridge::new(launcher.clone(), events_tx);
        let id = launcher
            .create("/tmp".to_string(), None, BackendKind::Native, None)
            .await
            .expect("create")
            .id;
        (dir, launcher, bridge, id)
    }

    #[tokio::test]
    async fn first_turn_names_the_session_and_notifies_browsers() {
        let (_dir, launcher, bridge, id) = setup().await;
        let guard = NamingGuard::new();

        let (btx, mut brx) = mpsc::channel(16);
        bridge.browser_open(&id, 1, btx).await;
        while brx.try_recv().is_ok() {}

        handle_event(
            BridgeEvent::FirstTurnCompleted {
                session_id: id.clone(),
                first_user_message: Some("Refactor the storage layer".to_string()),
            },
            &launcher,
            &bridge,
            &guard,
        )
        .await;

        assert_eq!(
            launcher
                .get_session(&id)
                .expect("session")
                .display_name
                .as_deref(),
            Some("Refactor the storage layer")
        );

        let mut saw_notice = false;
        while let Ok(frame) = brx.try_recv() {
            if let SocketFrame::Text(text) = frame {
                let value: serde_json::Value = serde_json::from_str(&text).expect("json");
                if value["type"] == "session_named" {
                    assert_eq!(value["name"], "Refactor the storage layer");
                    saw_notice = true;
                }
            }
        }
        assert!(saw_notice);
    }

    #[tokio::test]
    async fn naming_never_overwrites_an_existing_name() {
        let (_dir, launcher, bridge, id) = setup().await;
        let guard = NamingGuard::new();
        launcher.set_display_name(&id, "My session").await;

        handle_event(
            BridgeEvent::FirstTurnCompleted {
                session_id: id.clone(),
                first_user_message: Some("Something else entirely".to_string()),
            },
            &launcher,
            &bridge,
            &guard,
        )
        .await;

        assert_eq!(
            launcher
                .get_session(&id)
                .expect("session")
                .display_name
                .as_deref(),
            Some("My session")
        );
    }

    #[tokio::test]
    async fn relaunch_needed_relaunches_via_the_launcher() {
        let (_dir, launcher, bridge, id) = setup().await;
        let guard = NamingGuard::new();
        assert_eq!(launcher.spawn_count(), 1);

        handle_event(
            BridgeEvent::RelaunchNeeded {
                session_id: id.clone(),
            },
            &launcher,
            &bridge,
            &guard,
        )
        .await;

        assert_eq!(launcher.spawn_count(), 2);
    }
}
