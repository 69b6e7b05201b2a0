//! Core types shared across the protocol

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Which external CLI protocol a session speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Native,
    Foreign,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Native => "native",
            BackendKind::Foreign => "foreign",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "native" => Some(BackendKind::Native),
            "foreign" => Some(BackendKind::Foreign),
            _ => None,
        }
    }
}

/// Session lifecycle state.
///
/// `Exited` is not terminal — a relaunch moves the session back to
/// `Starting`. The `archived` flag on [`SessionRecord`] is orthogonal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    /// Subprocess spawned, CLI socket not yet open.
    Starting,
    /// CLI socket open, no turn in progress.
    Connected,
    /// A turn is in progress.
    Running,
    /// Subprocess terminated; exit code recorded on the session.
    Exited,
}

impl Lifecycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            Lifecycle::Starting => "starting",
            Lifecycle::Connected => "connected",
            Lifecycle::Running => "running",
            Lifecycle::Exited => "exited",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "starting" => Some(Lifecycle::Starting),
            "connected" => Some(Lifecycle::Connected),
            "running" => Some(Lifecycle::Running),
            "exited" => Some(Lifecycle::Exited),
            _ => None,
        }
    }

    /// Transition table. Relaunch re-enters `Starting` from any state;
    /// a process can die in any state; `Running` is only entered from
    /// `Connected` and only drops back to `Connected`.
    ///
    /// ```text
    /// Starting  → Connected | Exited | Starting
    /// Connected → Running   | Exited | Starting
    /// Running   → Connected | Exited | Starting
    /// Exited    → Starting
    /// ```
    pub fn can_transition(self, next: Lifecycle) -> bool {
        use Lifecycle::*;
        matches!(
            (self, next),
            (Starting, Connected)
                | (Starting, Exited)
                | (Starting, Starting)
                | (Connected, Running)
                | (Connected, Exited)
                | (Connected, Starting)
                | (Running, Connected)
                | (Running, Exited)
                | (Running, Starting)
                | (Exited, Starting)
        )
    }

    /// Checked transition; `Err` names the rejected edge.
    pub fn transition(self, next: Lifecycle) -> Result<Lifecycle, InvalidTransition> {
        if self.can_transition(next) {
            Ok(next)
        } else {
            Err(InvalidTransition {
                from: self,
                to: next,
            })
        }
    }
}

/// Attempted lifecycle transition not present in the table.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid lifecycle transition {from:?} → {to:?}")]
pub struct InvalidTransition {
    pub from: Lifecycle,
    pub to: Lifecycle,
}

/// Opportunistic git summary for a session's working directory.
/// Never authoritative — refreshed when the working directory is first
/// observed and again as turns complete.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitSummary {
    pub branch: Option<String>,
    pub ahead: i64,
    pub behind: i64,
    pub lines_added: i64,
    pub lines_removed: i64,
}

/// Persisted session metadata — one durable record per session, keyed by id.
///
/// The id is allocated once and never changes across relaunches. The
/// `resume_token` is the backend's own session identifier; once learned it is
/// passed to every subsequent relaunch for best-effort conversation
/// continuity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub backend: BackendKind,
    pub cwd: String,
    pub model: Option<String>,
    pub permission_mode: Option<String>,
    pub lifecycle: Lifecycle,
    pub pid: Option<u32>,
    pub resume_token: Option<String>,
    pub archived: bool,
    pub display_name: Option<String>,
    /// Unix seconds.
    pub created_at: i64,
    pub exit_code: Option<i32>,
    pub git: Option<GitSummary>,
}

impl SessionRecord {
    /// Fresh record in the initial `Starting` state.
    pub fn new(
        id: String,
        backend: BackendKind,
        cwd: String,
        model: Option<String>,
        permission_mode: Option<String>,
        created_at: i64,
    ) -> Self {
        Self {
            id,
            backend,
            cwd,
            model,
            permission_mode,
            lifecycle: Lifecycle::Starting,
            pid: None,
            resume_token: None,
            archived: false,
            display_name: None,
            created_at,
            exit_code: None,
            git: None,
        }
    }
}

/// A permission request the backend is waiting on.
///
/// Held in memory by the bridge until a matching response arrives from any
/// browser socket or the session's conversation ends. Never persisted — the
/// backend re-issues on reconnect if still pending.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingPermission {
    pub request_id: String,
    pub tool_name: String,
    pub input: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestions: Option<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_roundtrips_through_strings() {
        for state in [
            Lifecycle::Starting,
            Lifecycle::Connected,
            Lifecycle::Running,
            Lifecycle::Exited,
        ] {
            assert_eq!(Lifecycle::parse(state.as_str()), Some(state));
        }
        assert_eq!(Lifecycle::parse("limbo"), None);
    }

    #[test]
    fn transition_table_accepts_documented_edges() {
        assert!(Lifecycle::Starting.can_transition(Lifecycle::Connected));
        assert!(Lifecycle::Connected.can_transition(Lifecycle::Running));
        assert!(Lifecycle::Running.can_transition(Lifecycle::Connected));
        assert!(Lifecycle::Running.can_transition(Lifecycle::Exited));
        assert!(Lifecycle::Exited.can_transition(Lifecycle::Starting));
        // Relaunch while still starting collapses into Starting → Starting.
        assert!(Lifecycle::Starting.can_transition(Lifecycle::Starting));
    }

    #[test]
    fn transition_table_rejects_undocumented_edges() {
        assert!(!Lifecycle::Exited.can_transition(Lifecycle::Connected));
        assert!(!Lifecycle::Exited.can_transition(Lifecycle::Running));
        assert!(!Lifecycle::Starting.can_transition(Lifecycle::Running));
        assert!(!Lifecycle::Connected.can_transition(Lifecycle::Connected));
        assert!(!Lifecycle::Running.can_transition(Lifecycle::Running));
    }

    #[test]
    fn checked_transition_names_the_rejected_edge() {
        assert_eq!(
            Lifecycle::Connected.transition(Lifecycle::Running),
            Ok(Lifecycle::Running)
        );
        let rejected = Lifecycle::Exited
            .transition(Lifecycle::Running)
            .expect_err("edge not in table");
        assert_eq!(rejected.from, Lifecycle::Exited);
        assert_eq!(rejected.to, Lifecycle::Running);
        assert!(rejected.to_string().contains("Exited"));
    }

    #[test]
    fn backend_kind_roundtrips_through_strings() {
        assert_eq!(BackendKind::parse("native"), Some(BackendKind::Native));
        assert_eq!(BackendKind::parse("foreign"), Some(BackendKind::Foreign));
        assert_eq!(BackendKind::parse("claude"), None);
    }

    #[test]
    fn session_record_serializes_snake_case() {
        let record = SessionRecord::new(
            "sess-1".to_string(),
            BackendKind::Native,
            "/repo".to_string(),
            Some("opus".to_string()),
            None,
            1_700_000_000,
        );
        let json = serde_json::to_value(&record).expect("serialize");
        assert_eq!(json["backend"], "native");
        assert_eq!(json["lifecycle"], "starting");
        assert_eq!(json["archived"], false);
        assert_eq!(json["created_at"], 1_700_000_000i64);
    }
}
