//! Process launcher — owns the session state machine.
//!
//! Spawns, kills, and resumes the backend CLI subprocess for each session,
//! and owns the in-memory session map. The map always mirrors the session
//! store; every mutation here persists through it. Subprocesses dial back
//! into the server on `/ws/cli/{session_id}` — the socket URL is passed as a
//! launch argument, so the launcher never touches subprocess stdio beyond
//! draining stderr into the logs.

use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tether_protocol::{Activity, BackendKind, GitSummary, Lifecycle, SessionRecord};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::store::{SessionStore, StoreError};

/// How long concurrent relaunch requests for one session collapse into a
/// single effective relaunch.
pub const RELAUNCH_COOLDOWN: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("unknown session {0}")]
    UnknownSession(String),

    #[error("session {0} is archived")]
    Archived(String),

    #[error("failed to spawn backend process: {0}")]
    Spawn(#[from] std::io::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Per-backend launch configuration.
#[derive(Debug, Clone)]
pub struct LaunchConfig {
    pub native_bin: String,
    pub foreign_bin: String,
    /// Base URL subprocesses dial back to, e.g. `ws://127.0.0.1:4000`.
    pub server_url: String,
}

impl LaunchConfig {
    /// Argument vector for a session's subprocess. The CLI socket URL always
    /// rides along; model, permission mode, and the remembered resume token
    /// are appended in each backend's own flag vocabulary.
    fn build_args(&self, record: &SessionRecord) -> Vec<String> {
        let url = format!("{}/ws/cli/{}", self.server_url, record.id);
        let mut args = match record.backend {
            BackendKind::Native => vec!["--bridge-ws".to_string(), url],
            BackendKind::Foreign => vec!["--attach".to_string(), url],
        };
        if let Some(model) = &record.model {
            args.extend(["--model".to_string(), model.clone()]);
        }
        match record.backend {
            BackendKind::Native => {
                if let Some(mode) = &record.permission_mode {
                    args.extend(["--permission-mode".to_string(), mode.clone()]);
                }
                if let Some(token) = &record.resume_token {
                    args.extend(["--resume".to_string(), token.clone()]);
                }
            }
            BackendKind::Foreign => {
                if let Some(mode) = &record.permission_mode {
                    args.extend(["--approval-policy".to_string(), mode.clone()]);
                }
                if let Some(token) = &record.resume_token {
                    args.extend(["--thread".to_string(), token.clone()]);
                }
            }
        }
        args
    }

    fn bin_for(&self, backend: BackendKind) -> &str {
        match backend {
            BackendKind::Native => &self.native_bin,
            BackendKind::Foreign => &self.foreign_bin,
        }
    }
}

/// Live subprocess bookkeeping. The monitor task owns the `Child`; the
/// launcher keeps only the kill channel and the spawn generation used to
/// discard stale exit notices.
struct ProcessHandle {
    pid: u32,
    generation: u64,
    kill_tx: oneshot::Sender<oneshot::Sender<()>>,
}

pub struct ProcessLauncher {
    sessions: DashMap<String, SessionRecord>,
    processes: DashMap<String, ProcessHandle>,
    relaunch_inflight: DashMap<String, Instant>,
    spawn_generation: AtomicU64,
    store: SessionStore,
    config: LaunchConfig,
    cooldown: Duration,
}

impl ProcessLauncher {
    pub fn new(store: SessionStore, config: LaunchConfig) -> Arc<Self> {
        Arc::new(Self {
            sessions: DashMap::new(),
            processes: DashMap::new(),
            relaunch_inflight: DashMap::new(),
            spawn_generation: AtomicU64::new(0),
            store,
            config,
            cooldown: RELAUNCH_COOLDOWN,
        })
    }

    /// Like [`new`] but with a custom relaunch cool-down (tests).
    pub fn with_cooldown(store: SessionStore, config: LaunchConfig, cooldown: Duration) -> Arc<Self> {
        Arc::new(Self {
            sessions: DashMap::new(),
            processes: DashMap::new(),
            relaunch_inflight: DashMap::new(),
            spawn_generation: AtomicU64::new(0),
            store,
            config,
            cooldown,
        })
    }

    /// Create a session: allocate an id, persist initial metadata, spawn the
    /// subprocess. Spawn failure removes the persisted record so no orphaned
    /// metadata is left behind.
    pub async fn create(
        self: &Arc<Self>,
        cwd: String,
        model: Option<String>,
        backend: BackendKind,
        permission_mode: Option<String>,
    ) -> Result<SessionRecord, LaunchError> {
        let id = Uuid::new_v4().to_string();
        let mut record =
            SessionRecord::new(id.clone(), backend, cwd, model, permission_mode, now_secs());

        self.persist(record.clone()).await;

        if let Err(e) = self.spawn_process(&mut record) {
            if let Err(remove_err) = self.store.remove(id.clone()).await {
                warn!(
                    component = "launcher",
                    event = "launcher.create.cleanup_failed",
                    session_id = %id,
                    error = %remove_err,
                    "Failed to remove metadata after spawn failure"
                );
            }
            return Err(e);
        }

        // Persist the map's view, not our local copy — a short-lived process
        // may already have been recorded as exited.
        let committed = self.get_session(&id).unwrap_or_else(|| record.clone());
        self.persist(committed.clone()).await;

        info!(
            component = "launcher",
            event = "launcher.session.created",
            session_id = %id,
            backend = record.backend.as_str(),
            cwd = %record.cwd,
            pid = record.pid,
            "Session created"
        );
        Ok(committed)
    }

    /// Terminate-and-respawn. Safe to call concurrently for the same id:
    /// callers inside the cool-down window are absorbed, not queued. Spawn
    /// failure leaves the session `Exited` with the previous exit code.
    pub async fn relaunch(self: &Arc<Self>, session_id: &str) -> Result<(), LaunchError> {
        let started = Instant::now();
        match self.relaunch_inflight.entry(session_id.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().elapsed() < self.cooldown {
                    debug!(
                        component = "launcher",
                        event = "launcher.relaunch.absorbed",
                        session_id = %session_id,
                        "Relaunch already in flight, absorbing"
                    );
                    return Ok(());
                }
                occupied.insert(started);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(started);
            }
        }

        // Clear the marker once the cool-down has elapsed, unless a newer
        // relaunch refreshed it in the meantime.
        {
            let launcher = Arc::downgrade(self);
            let session_id = session_id.to_string();
            let cooldown = self.cooldown;
            tokio::spawn(async move {
                tokio::time::sleep(cooldown).await;
                if let Some(launcher) = launcher.upgrade() {
                    launcher
                        .relaunch_inflight
                        .remove_if(&session_id, |_, inserted| *inserted == started);
                }
            });
        }

        let mut record = self
            .sessions
            .get(session_id)
            .map(|entry| entry.clone())
            .ok_or_else(|| LaunchError::UnknownSession(session_id.to_string()))?;
        if record.archived {
            return Err(LaunchError::Archived(session_id.to_string()));
        }

        self.terminate_process(session_id).await;

        // The monitor may have recorded the exit just now; respawn from the
        // freshest copy so the previous exit code survives a spawn failure.
        if let Some(entry) = self.sessions.get(session_id) {
            record = entry.clone();
        }
        record.exit_code = None;
        if !apply_transition(&mut record, Lifecycle::Starting) {
            // Every state may re-enter Starting; this is unreachable but the
            // table stays authoritative.
            return Ok(());
        }

        if let Err(e) = self.spawn_process(&mut record) {
            warn!(
                component = "launcher",
                event = "launcher.relaunch.spawn_failed",
                session_id = %session_id,
                error = %e,
                "Relaunch spawn failed"
            );
            return Err(e);
        }

        let committed = self.get_session(session_id).unwrap_or(record);
        self.persist(committed).await;

        info!(
            component = "launcher",
            event = "launcher.session.relaunched",
            session_id = %session_id,
            "Session relaunched"
        );
        Ok(())
    }

    /// Called when the CLI socket opens. `Starting → Connected`; a session
    /// already `Connected`/`Running` is left alone (routing discovers
    /// activity on its own).
    pub async fn mark_connected(&self, session_id: &str) {
        let updated = {
            let Some(mut entry) = self.sessions.get_mut(session_id) else {
                warn!(
                    component = "launcher",
                    event = "launcher.mark_connected.unknown",
                    session_id = %session_id,
                    "CLI socket opened for unknown session"
                );
                return;
            };
            match entry.lifecycle {
                Lifecycle::Starting => {
                    apply_transition(&mut entry, Lifecycle::Connected);
                    Some(entry.clone())
                }
                Lifecycle::Connected | Lifecycle::Running => None,
                Lifecycle::Exited => {
                    // A socket for a process we recorded as dead. Not in the
                    // table; apply_transition logs the rejection. Relaunch is
                    // the way back to a live state.
                    apply_transition(&mut entry, Lifecycle::Connected);
                    None
                }
            }
        };
        if let Some(record) = updated {
            self.persist(record).await;
        }
    }

    /// Drive `Connected ⇄ Running` from backend status/turn routing.
    pub async fn set_activity(&self, session_id: &str, activity: Activity) {
        let updated = {
            let Some(mut entry) = self.sessions.get_mut(session_id) else {
                return;
            };
            let next = match activity {
                Activity::Running | Activity::Compacting => Lifecycle::Running,
                Activity::Idle => Lifecycle::Connected,
            };
            if entry.lifecycle == next {
                None
            } else if apply_transition(&mut entry, next) {
                Some(entry.clone())
            } else {
                None
            }
        };
        if let Some(record) = updated {
            self.persist(record).await;
        }
    }

    /// Record the backend-internal resumption token, reused on every
    /// subsequent relaunch.
    pub async fn set_resume_token(&self, session_id: &str, token: &str) {
        let updated = {
            let Some(mut entry) = self.sessions.get_mut(session_id) else {
                return;
            };
            if entry.resume_token.as_deref() == Some(token) {
                None
            } else {
                entry.resume_token = Some(token.to_string());
                Some(entry.clone())
            }
        };
        if let Some(record) = updated {
            info!(
                component = "launcher",
                event = "launcher.resume_token.recorded",
                session_id = %session_id,
                "Recorded backend resumption token"
            );
            self.persist(record).await;
        }
    }

    /// Set the display name. Returns false if the session is unknown or the
    /// name was already set to this value.
    pub async fn set_display_name(&self, session_id: &str, name: &str) -> bool {
        let updated = {
            let Some(mut entry) = self.sessions.get_mut(session_id) else {
                return false;
            };
            if entry.display_name.as_deref() == Some(name) {
                None
            } else {
                entry.display_name = Some(name.to_string());
                Some(entry.clone())
            }
        };
        match updated {
            Some(record) => {
                self.persist(record).await;
                true
            }
            None => false,
        }
    }

    pub async fn set_permission_mode(&self, session_id: &str, mode: &str) {
        let updated = {
            let Some(mut entry) = self.sessions.get_mut(session_id) else {
                return;
            };
            entry.permission_mode = Some(mode.to_string());
            entry.clone()
        };
        self.persist(updated).await;
    }

    pub async fn update_git_summary(&self, session_id: &str, summary: GitSummary) {
        let updated = {
            let Some(mut entry) = self.sessions.get_mut(session_id) else {
                return;
            };
            entry.git = Some(summary);
            entry.clone()
        };
        self.persist(updated).await;
    }

    pub fn get_session(&self, session_id: &str) -> Option<SessionRecord> {
        self.sessions.get(session_id).map(|entry| entry.clone())
    }

    pub fn list_sessions(&self) -> Vec<SessionRecord> {
        let mut records: Vec<SessionRecord> =
            self.sessions.iter().map(|entry| entry.clone()).collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        records
    }

    /// Sessions still waiting for their CLI socket.
    pub fn starting_sessions(&self) -> Vec<SessionRecord> {
        self.sessions
            .iter()
            .filter(|entry| entry.lifecycle == Lifecycle::Starting)
            .map(|entry| entry.clone())
            .collect()
    }

    pub async fn archive(&self, session_id: &str) -> Result<(), LaunchError> {
        self.set_archived(session_id, true).await
    }

    pub async fn unarchive(&self, session_id: &str) -> Result<(), LaunchError> {
        self.set_archived(session_id, false).await
    }

    async fn set_archived(&self, session_id: &str, archived: bool) -> Result<(), LaunchError> {
        let updated = {
            let mut entry = self
                .sessions
                .get_mut(session_id)
                .ok_or_else(|| LaunchError::UnknownSession(session_id.to_string()))?;
            entry.archived = archived;
            entry.clone()
        };
        self.persist(updated).await;
        Ok(())
    }

    /// Remove the session entirely: kill the subprocess, drop the record.
    pub async fn delete(&self, session_id: &str) -> Result<(), LaunchError> {
        self.terminate_process(session_id).await;
        self.sessions
            .remove(session_id)
            .ok_or_else(|| LaunchError::UnknownSession(session_id.to_string()))?;
        self.relaunch_inflight.remove(session_id);
        self.store.remove(session_id.to_string()).await?;
        info!(
            component = "launcher",
            event = "launcher.session.deleted",
            session_id = %session_id,
            "Session deleted"
        );
        Ok(())
    }

    /// Boot-time restore. Never respawns: the old subprocess may still be
    /// alive and about to reconnect its socket. Non-archived sessions that
    /// were not `Exited` restore as `Starting`; the reconnection supervisor
    /// owns recovery for any that never reconnect.
    pub async fn restore_from_disk(&self) -> Result<usize, StoreError> {
        let records = self.store.load().await?;
        let count = records.len();

        for mut record in records {
            if !record.archived && record.lifecycle != Lifecycle::Exited {
                let alive = record
                    .pid
                    .map(process_alive)
                    .unwrap_or(false);
                info!(
                    component = "launcher",
                    event = "launcher.restore.awaiting_reconnect",
                    session_id = %record.id,
                    previous_state = record.lifecycle.as_str(),
                    pid = record.pid,
                    pid_alive = alive,
                    "Restored session, awaiting CLI reconnect"
                );
                record.lifecycle = Lifecycle::Starting;
                if !alive {
                    record.pid = None;
                }
                self.persist(record.clone()).await;
            }
            self.sessions.insert(record.id.clone(), record);
        }

        info!(
            component = "launcher",
            event = "launcher.restore.complete",
            sessions = count,
            "Restored sessions from disk"
        );
        Ok(count)
    }

    /// Spawn the subprocess and its monitor task. The updated record is
    /// committed to the session map before the monitor exists, so an exit
    /// notice can never race the commit; persisting is the caller's job.
    fn spawn_process(self: &Arc<Self>, record: &mut SessionRecord) -> Result<(), LaunchError> {
        let bin = self.config.bin_for(record.backend).to_string();
        let args = self.config.build_args(record);

        debug!(
            component = "launcher",
            event = "launcher.spawn",
            session_id = %record.id,
            bin = %bin,
            resume = record.resume_token.is_some(),
            "Spawning backend CLI"
        );

        let mut child = Command::new(&bin)
            .args(&args)
            .current_dir(&record.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let pid = child.id().unwrap_or_default();
        let generation = self.spawn_generation.fetch_add(1, Ordering::Relaxed) + 1;
        let (kill_tx, kill_rx) = oneshot::channel();

        if let Some(stderr) = child.stderr.take() {
            let session_id = record.id.clone();
            tokio::spawn(async move {
                let reader = BufReader::new(stderr);
                let mut lines = reader.lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(
                        component = "launcher",
                        event = "launcher.backend.stderr",
                        session_id = %session_id,
                        line = %line,
                        "Backend CLI stderr"
                    );
                }
            });
        }

        record.pid = Some(pid);
        self.sessions.insert(record.id.clone(), record.clone());
        self.processes.insert(
            record.id.clone(),
            ProcessHandle {
                pid,
                generation,
                kill_tx,
            },
        );
        tokio::spawn(monitor_process(
            Arc::downgrade(self),
            record.id.clone(),
            generation,
            child,
            kill_rx,
        ));

        Ok(())
    }

    /// Kill the live subprocess for a session (if any) and wait until its
    /// exit has been recorded.
    async fn terminate_process(&self, session_id: &str) {
        if let Some((_, handle)) = self.processes.remove(session_id) {
            let (ack_tx, ack_rx) = oneshot::channel();
            if handle.kill_tx.send(ack_tx).is_ok() {
                let _ = ack_rx.await;
            }
        }
    }

    /// From the monitor task. Stale generations (an exit racing a newer
    /// spawn) are discarded.
    async fn record_exit(&self, session_id: &str, generation: u64, exit_code: Option<i32>) {
        if let Some(handle) = self.processes.get(session_id) {
            if handle.generation != generation {
                debug!(
                    component = "launcher",
                    event = "launcher.exit.stale",
                    session_id = %session_id,
                    generation = generation,
                    "Ignoring exit notice from a superseded spawn"
                );
                return;
            }
        }
        self.processes
            .remove_if(session_id, |_, handle| handle.generation == generation);

        let updated = {
            let Some(mut entry) = self.sessions.get_mut(session_id) else {
                return;
            };
            if !apply_transition(&mut entry, Lifecycle::Exited) {
                return;
            }
            entry.pid = None;
            entry.exit_code = exit_code;
            entry.clone()
        };

        info!(
            component = "launcher",
            event = "launcher.session.exited",
            session_id = %session_id,
            exit_code = exit_code,
            "Backend process exited"
        );
        self.persist(updated).await;
    }

    /// Best-effort durability: write failures are logged, in-memory state is
    /// not rolled back.
    async fn persist(&self, record: SessionRecord) {
        let session_id = record.id.clone();
        if let Err(e) = self.store.upsert(record).await {
            warn!(
                component = "launcher",
                event = "launcher.persist.failed",
                session_id = %session_id,
                error = %e,
                "Failed to persist session metadata"
            );
        }
    }

    #[cfg(test)]
    pub(crate) fn spawn_count(&self) -> u64 {
        self.spawn_generation.load(Ordering::Relaxed)
    }
}

/// Log-and-reject transitions not in the [`Lifecycle`] table.
fn apply_transition(record: &mut SessionRecord, next: Lifecycle) -> bool {
    match record.lifecycle.transition(next) {
        Ok(next) => {
            record.lifecycle = next;
            true
        }
        Err(rejected) => {
            warn!(
                component = "launcher",
                event = "launcher.transition.rejected",
                session_id = %record.id,
                error = %rejected,
                "Rejected lifecycle transition"
            );
            false
        }
    }
}

/// Owns the `Child`: waits for natural exit, or a kill request carrying an
/// ack channel that is answered once the exit has been recorded.
async fn monitor_process(
    launcher: Weak<ProcessLauncher>,
    session_id: String,
    generation: u64,
    mut child: Child,
    kill_rx: oneshot::Receiver<oneshot::Sender<()>>,
) {
    enum Outcome {
        Exited(Option<i32>),
        Kill(Option<oneshot::Sender<()>>),
    }

    let outcome = tokio::select! {
        status = child.wait() => Outcome::Exited(status.ok().and_then(|s| s.code())),
        request = kill_rx => Outcome::Kill(request.ok()),
    };

    let (exit_code, ack) = match outcome {
        Outcome::Exited(exit_code) => (exit_code, None),
        Outcome::Kill(ack) => {
            let _ = child.start_kill();
            let status = child.wait().await;
            (status.ok().and_then(|s| s.code()), ack)
        }
    };

    if let Some(launcher) = launcher.upgrade() {
        launcher.record_exit(&session_id, generation, exit_code).await;
    }
    if let Some(ack) = ack {
        let _ = ack.send(());
    }
}

fn process_alive(pid: u32) -> bool {
    // Signal 0 probes for existence without touching the process.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::LaunchConfig;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    /// Launch config whose "agent" is a stub that ignores its arguments and
    /// stays alive until killed, so lifecycle assertions are deterministic.
    pub fn stub_agent_config(dir: &Path) -> LaunchConfig {
        let bin = dir.join("agent-stub.sh");
        std::fs::write(&bin, "#!/bin/sh\nsleep 60\n").expect("write agent stub");
        let mut perms = std::fs::metadata(&bin).expect("stub metadata").permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&bin, perms).expect("chmod agent stub");
        LaunchConfig {
            native_bin: bin.display().to_string(),
            foreign_bin: bin.display().to_string(),
            server_url: "ws://127.0.0.1:4000".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::stub_agent_config;
    use super::*;
    use crate::store::test_support::temp_store;

    fn failing_config() -> LaunchConfig {
        LaunchConfig {
            native_bin: "/nonexistent/tether-test-agent".to_string(),
            foreign_bin: "/nonexistent/tether-test-agent".to_string(),
            server_url: "ws://127.0.0.1:4000".to_string(),
        }
    }

    #[tokio::test]
    async fn create_persists_and_restores() {
        let (_dir, store) = temp_store();
        let launcher = ProcessLauncher::new(store.clone(), stub_agent_config(_dir.path()));

        let record = launcher
            .create("/tmp".to_string(), None, BackendKind::Native, None)
            .await
            .expect("create");
        assert_eq!(record.lifecycle, Lifecycle::Starting);
        assert!(record.pid.is_some());

        // A second launcher over the same store sees the session.
        let restored = ProcessLauncher::new(store, stub_agent_config(_dir.path()));
        let count = restored.restore_from_disk().await.expect("restore");
        assert_eq!(count, 1);
        let got = restored.get_session(&record.id).expect("session");
        assert_eq!(got.id, record.id);
        assert_eq!(got.lifecycle, Lifecycle::Starting);
        assert_eq!(got.cwd, "/tmp");
    }

    #[tokio::test]
    async fn spawn_failure_leaves_no_orphaned_metadata() {
        let (_dir, store) = temp_store();
        let launcher = ProcessLauncher::new(store.clone(), failing_config());

        let result = launcher
            .create("/tmp".to_string(), None, BackendKind::Native, None)
            .await;
        assert!(matches!(result, Err(LaunchError::Spawn(_))));
        assert!(launcher.list_sessions().is_empty());
        assert!(store.load().await.expect("load").is_empty());
    }

    #[tokio::test]
    async fn mark_connected_transitions_starting_to_connected() {
        let (_dir, store) = temp_store();
        let launcher = ProcessLauncher::new(store, stub_agent_config(_dir.path()));
        let record = launcher
            .create("/tmp".to_string(), None, BackendKind::Native, None)
            .await
            .expect("create");

        launcher.mark_connected(&record.id).await;
        assert_eq!(
            launcher.get_session(&record.id).expect("session").lifecycle,
            Lifecycle::Connected
        );

        // A second open is a no-op, not a rejected transition.
        launcher.mark_connected(&record.id).await;
        assert_eq!(
            launcher.get_session(&record.id).expect("session").lifecycle,
            Lifecycle::Connected
        );
    }

    #[tokio::test]
    async fn activity_drives_connected_and_running() {
        let (_dir, store) = temp_store();
        let launcher = ProcessLauncher::new(store, stub_agent_config(_dir.path()));
        let record = launcher
            .create("/tmp".to_string(), None, BackendKind::Native, None)
            .await
            .expect("create");

        // Running before the socket ever connected is not in the table.
        launcher.set_activity(&record.id, Activity::Running).await;
        assert_eq!(
            launcher.get_session(&record.id).expect("session").lifecycle,
            Lifecycle::Starting
        );

        launcher.mark_connected(&record.id).await;
        launcher.set_activity(&record.id, Activity::Running).await;
        assert_eq!(
            launcher.get_session(&record.id).expect("session").lifecycle,
            Lifecycle::Running
        );

        launcher.set_activity(&record.id, Activity::Idle).await;
        assert_eq!(
            launcher.get_session(&record.id).expect("session").lifecycle,
            Lifecycle::Connected
        );
    }

    #[tokio::test]
    async fn concurrent_relaunches_collapse_into_one() {
        let (_dir, store) = temp_store();
        let launcher = ProcessLauncher::new(store, stub_agent_config(_dir.path()));
        let record = launcher
            .create("/tmp".to_string(), None, BackendKind::Native, None)
            .await
            .expect("create");
        assert_eq!(launcher.spawn_count(), 1);

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let launcher = launcher.clone();
            let id = record.id.clone();
            tasks.push(tokio::spawn(async move { launcher.relaunch(&id).await }));
        }
        for task in tasks {
            task.await.expect("join").expect("relaunch");
        }

        // Eight concurrent callers, exactly one termination+respawn cycle.
        assert_eq!(launcher.spawn_count(), 2);
    }

    #[tokio::test]
    async fn relaunch_reuses_the_resume_token() {
        let (_dir, store) = temp_store();
        let launcher =
            ProcessLauncher::with_cooldown(store, stub_agent_config(_dir.path()), Duration::from_millis(0));
        let record = launcher
            .create("/tmp".to_string(), None, BackendKind::Native, None)
            .await
            .expect("create");

        launcher.set_resume_token(&record.id, "backend-7").await;
        launcher.relaunch(&record.id).await.expect("relaunch");

        let got = launcher.get_session(&record.id).expect("session");
        assert_eq!(got.resume_token.as_deref(), Some("backend-7"));
        assert_eq!(got.lifecycle, Lifecycle::Starting);
        assert_eq!(got.exit_code, None);

        // The token lands in the spawn arguments.
        let args = stub_agent_config(_dir.path()).build_args(&got);
        let pos = args.iter().position(|a| a == "--resume").expect("--resume");
        assert_eq!(args[pos + 1], "backend-7");
    }

    #[tokio::test]
    async fn relaunch_of_archived_session_is_refused() {
        let (_dir, store) = temp_store();
        let launcher =
            ProcessLauncher::with_cooldown(store, stub_agent_config(_dir.path()), Duration::from_millis(0));
        let record = launcher
            .create("/tmp".to_string(), None, BackendKind::Native, None)
            .await
            .expect("create");
        launcher.archive(&record.id).await.expect("archive");

        let result = launcher.relaunch(&record.id).await;
        assert!(matches!(result, Err(LaunchError::Archived(_))));
    }

    #[tokio::test]
    async fn delete_removes_record_everywhere() {
        let (_dir, store) = temp_store();
        let launcher = ProcessLauncher::new(store.clone(), stub_agent_config(_dir.path()));
        let record = launcher
            .create("/tmp".to_string(), None, BackendKind::Native, None)
            .await
            .expect("create");

        launcher.delete(&record.id).await.expect("delete");
        assert!(launcher.get_session(&record.id).is_none());
        assert!(store.load().await.expect("load").is_empty());

        let result = launcher.delete(&record.id).await;
        assert!(matches!(result, Err(LaunchError::UnknownSession(_))));
    }

    #[tokio::test]
    async fn exited_restores_as_exited_and_archived_verbatim() {
        let (_dir, store) = temp_store();

        let mut exited = SessionRecord::new(
            "sess-exited".to_string(),
            BackendKind::Native,
            "/repo".to_string(),
            None,
            None,
            1,
        );
        exited.lifecycle = Lifecycle::Exited;
        exited.exit_code = Some(1);
        store.upsert(exited).await.expect("upsert");

        let mut archived = SessionRecord::new(
            "sess-archived".to_string(),
            BackendKind::Foreign,
            "/repo".to_string(),
            None,
            None,
            2,
        );
        archived.lifecycle = Lifecycle::Running;
        archived.archived = true;
        store.upsert(archived).await.expect("upsert");

        let mut live = SessionRecord::new(
            "sess-live".to_string(),
            BackendKind::Native,
            "/repo".to_string(),
            None,
            None,
            3,
        );
        live.lifecycle = Lifecycle::Running;
        store.upsert(live).await.expect("upsert");

        let launcher = ProcessLauncher::new(store, stub_agent_config(_dir.path()));
        launcher.restore_from_disk().await.expect("restore");

        assert_eq!(
            launcher.get_session("sess-exited").expect("s").lifecycle,
            Lifecycle::Exited
        );
        // Archived sessions restore verbatim, even mid-run states.
        assert_eq!(
            launcher.get_session("sess-archived").expect("s").lifecycle,
            Lifecycle::Running
        );
        assert_eq!(
            launcher.get_session("sess-live").expect("s").lifecycle,
            Lifecycle::Starting
        );
        // Restore never respawns.
        assert_eq!(launcher.spawn_count(), 0);
    }
}
