//! Reconnection supervisor — boot-time watchdog.
//!
//! After a restart, restored sessions sit in `Starting` waiting for their old
//! subprocess to reconnect its CLI socket. This supervisor runs once per
//! boot: it sleeps through the grace period, then relaunches every
//! non-archived session whose socket never came back. That bounds how long a
//! session can sit in limbo without requiring a browser to be open to
//! trigger recovery.

use std::sync::Arc;
use std::time::Duration;

use tether_protocol::Lifecycle;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::launcher::ProcessLauncher;

/// Spawn the one-shot supervisor. Call after `restore_from_disk()`.
pub fn spawn(launcher: Arc<ProcessLauncher>, grace: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(grace).await;
        run_once(&launcher).await;
    })
}

pub(crate) async fn run_once(launcher: &Arc<ProcessLauncher>) {
    let stragglers: Vec<_> = launcher
        .starting_sessions()
        .into_iter()
        .filter(|record| !record.archived)
        .collect();

    if stragglers.is_empty() {
        info!(
            component = "watchdog",
            event = "watchdog.no_stragglers",
            "All restored sessions reconnected within the grace period"
        );
        return;
    }

    for record in stragglers {
        debug_assert_eq!(record.lifecycle, Lifecycle::Starting);
        match launcher.relaunch(&record.id).await {
            Ok(()) => info!(
                component = "watchdog",
                event = "watchdog.session.relaunched",
                session_id = %record.id,
                "CLI socket never reconnected, relaunched session"
            ),
            Err(e) => warn!(
                component = "watchdog",
                event = "watchdog.relaunch.failed",
                session_id = %record.id,
                error = %e,
                "Failed to relaunch straggler session"
            ),
        }
    }
}
