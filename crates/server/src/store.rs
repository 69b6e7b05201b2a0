//! Session store — durable session metadata in SQLite.
//!
//! One row per session, keyed by id. `upsert` is a whole-record overwrite
//! (every column set on conflict), so a corrupt record can never bleed into
//! its neighbors, and the store stays the single source of truth across
//! restarts: in-memory launcher state is always derived from it, never the
//! reverse. rusqlite is synchronous, so every operation runs under
//! `spawn_blocking`.

use std::path::PathBuf;

use rusqlite::{params, Connection, Row};
use tether_protocol::{BackendKind, GitSummary, Lifecycle, SessionRecord};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("store task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Handle to the sessions table. Cheap to clone; each operation opens its
/// own connection (WAL mode makes that safe for this write rate).
#[derive(Clone)]
pub struct SessionStore {
    db_path: PathBuf,
}

impl SessionStore {
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path }
    }

    fn open(&self) -> Result<Connection, rusqlite::Error> {
        let conn = Connection::open(&self.db_path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;
             PRAGMA synchronous = NORMAL;",
        )?;
        Ok(conn)
    }

    /// Boot-time full scan. Rows that fail to decode are skipped with a
    /// warning instead of poisoning the whole load.
    pub async fn load(&self) -> Result<Vec<SessionRecord>, StoreError> {
        let store = self.clone();
        let records = tokio::task::spawn_blocking(move || -> Result<_, rusqlite::Error> {
            let conn = store.open()?;
            let mut stmt = conn.prepare(
                "SELECT id, backend, cwd, model, permission_mode, lifecycle, pid,
                        resume_token, archived, display_name, created_at, exit_code,
                        git_branch, git_ahead, git_behind, git_lines_added, git_lines_removed
                 FROM sessions
                 ORDER BY created_at",
            )?;
            let rows = stmt.query_map([], decode_row)?;
            let mut records = Vec::new();
            for row in rows {
                match row? {
                    Ok(record) => records.push(record),
                    Err(reason) => {
                        warn!(
                            component = "store",
                            event = "store.load.skipped_row",
                            reason = %reason,
                            "Skipping undecodable session row"
                        );
                    }
                }
            }
            Ok(records)
        })
        .await??;
        Ok(records)
    }

    /// Whole-record overwrite.
    pub async fn upsert(&self, record: SessionRecord) -> Result<(), StoreError> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || -> Result<(), rusqlite::Error> {
            let conn = store.open()?;
            let git = record.git.clone().unwrap_or_default();
            conn.execute(
                "INSERT INTO sessions (id, backend, cwd, model, permission_mode, lifecycle, pid,
                                       resume_token, archived, display_name, created_at, exit_code,
                                       git_branch, git_ahead, git_behind, git_lines_added, git_lines_removed)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
                 ON CONFLICT(id) DO UPDATE SET
                   backend = ?2, cwd = ?3, model = ?4, permission_mode = ?5, lifecycle = ?6,
                   pid = ?7, resume_token = ?8, archived = ?9, display_name = ?10,
                   created_at = ?11, exit_code = ?12, git_branch = ?13, git_ahead = ?14,
                   git_behind = ?15, git_lines_added = ?16, git_lines_removed = ?17",
                params![
                    record.id,
                    record.backend.as_str(),
                    record.cwd,
                    record.model,
                    record.permission_mode,
                    record.lifecycle.as_str(),
                    record.pid,
                    record.resume_token,
                    record.archived,
                    record.display_name,
                    record.created_at,
                    record.exit_code,
                    git.branch,
                    git.ahead,
                    git.behind,
                    git.lines_added,
                    git.lines_removed,
                ],
            )?;
            Ok(())
        })
        .await??;
        Ok(())
    }

    pub async fn remove(&self, id: String) -> Result<(), StoreError> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || -> Result<(), rusqlite::Error> {
            let conn = store.open()?;
            conn.execute("DELETE FROM sessions WHERE id = ?1", params![id])?;
            Ok(())
        })
        .await??;
        Ok(())
    }
}

/// Decode one row; inner `Err(String)` marks an undecodable record so the
/// caller can skip it without aborting the scan.
fn decode_row(row: &Row<'_>) -> Result<Result<SessionRecord, String>, rusqlite::Error> {
    let id: String = row.get(0)?;
    let backend_raw: String = row.get(1)?;
    let lifecycle_raw: String = row.get(5)?;

    let Some(backend) = BackendKind::parse(&backend_raw) else {
        return Ok(Err(format!("{}: unknown backend {:?}", id, backend_raw)));
    };
    let Some(lifecycle) = Lifecycle::parse(&lifecycle_raw) else {
        return Ok(Err(format!("{}: unknown lifecycle {:?}", id, lifecycle_raw)));
    };

    let git_branch: Option<String> = row.get(12)?;
    let git = GitSummary {
        branch: git_branch,
        ahead: row.get(13)?,
        behind: row.get(14)?,
        lines_added: row.get(15)?,
        lines_removed: row.get(16)?,
    };
    let git = if git == GitSummary::default() {
        None
    } else {
        Some(git)
    };

    Ok(Ok(SessionRecord {
        id,
        backend,
        cwd: row.get(2)?,
        model: row.get(3)?,
        permission_mode: row.get(4)?,
        lifecycle,
        pid: row.get(6)?,
        resume_token: row.get(7)?,
        archived: row.get(8)?,
        display_name: row.get(9)?,
        created_at: row.get(10)?,
        exit_code: row.get(11)?,
        git,
    }))
}


#[cfg(test)]
mod tests {
    use super::test_support::temp_store;
    use super::*;

    fn record(id: &str) -> SessionRecord {
        SessionRecord::new(
            id.to_string(),
            BackendKind::Native,
            "/repo".to_string(),
            Some("opus".to_string()),
            Some("default".to_string()),
            1_700_000_000,
        )
    }

    #[tokio::test]
    async fn upsert_then_load_roundtrips_every_field() {
        let (_dir, store) = temp_store();

        let mut rec = record("sess-1");
        rec.lifecycle = Lifecycle::Running;
        rec.pid = Some(4242);
        rec.resume_token = Some("backend-abc".to_string());
        rec.display_name = Some("Fix the flaky test".to_string());
        rec.exit_code = None;
        rec.git = Some(GitSummary {
            branch: Some("main".to_string()),
            ahead: 2,
            behind: 1,
            lines_added: 120,
            lines_removed: 48,
        });

        store.upsert(rec.clone()).await.expect("upsert");
        let loaded = store.load().await.expect("load");
        assert_eq!(loaded.len(), 1);
        let got = &loaded[0];
        assert_eq!(got.id, rec.id);
        assert_eq!(got.backend, rec.backend);
        assert_eq!(got.cwd, rec.cwd);
        assert_eq!(got.model, rec.model);
        assert_eq!(got.permission_mode, rec.permission_mode);
        assert_eq!(got.lifecycle, rec.lifecycle);
        assert_eq!(got.pid, rec.pid);
        assert_eq!(got.resume_token, rec.resume_token);
        assert_eq!(got.archived, rec.archived);
        assert_eq!(got.display_name, rec.display_name);
        assert_eq!(got.created_at, rec.created_at);
        assert_eq!(got.git, rec.git);
    }

    #[tokio::test]
    async fn upsert_overwrites_the_whole_record() {
        let (_dir, store) = temp_store();

        let mut rec = record("sess-2");
        rec.resume_token = Some("token-1".to_string());
        store.upsert(rec.clone()).await.expect("first upsert");

        // Second write clears the token — the overwrite must not preserve it.
        rec.resume_token = None;
        rec.lifecycle = Lifecycle::Exited;
        rec.exit_code = Some(1);
        store.upsert(rec).await.expect("second upsert");

        let loaded = store.load().await.expect("load");
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].resume_token, None);
        assert_eq!(loaded[0].lifecycle, Lifecycle::Exited);
        assert_eq!(loaded[0].exit_code, Some(1));
    }

    #[tokio::test]
    async fn remove_deletes_only_the_named_session() {
        let (_dir, store) = temp_store();
        store.upsert(record("sess-a")).await.expect("upsert a");
        store.upsert(record("sess-b")).await.expect("upsert b");

        store.remove("sess-a".to_string()).await.expect("remove");

        let loaded = store.load().await.expect("load");
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, "sess-b");
    }

    #[tokio::test]
    async fn load_skips_undecodable_rows() {
        let (_dir, store) = temp_store();
        store.upsert(record("sess-good")).await.expect("upsert");

        // Corrupt a single record directly.
        let conn = Connection::open(store.db_path.clone()).expect("open");
        conn.execute(
            "INSERT INTO sessions (id, backend, cwd, lifecycle, created_at)
             VALUES ('sess-bad', 'martian', '/tmp', 'starting', 0)",
            [],
        )
        .expect("insert bad row");

        let loaded = store.load().await.expect("load");
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, "sess-good");
    }
}
