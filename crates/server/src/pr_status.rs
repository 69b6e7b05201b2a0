//! GitHub PR status poller.
//!
//! Pushes open-PR status for each watched session's branch through the
//! bridge's generic broadcast primitive. The cadence is adaptive — fast
//! while any browser is connected, slow otherwise — and a per-session
//! fetch-in-flight marker prevents overlapping fetches for the same key,
//! the same re-entrancy pattern the launcher uses for relaunches. Poller
//! failures never touch routing; the next tick simply retries.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::bridge::MessageBridge;
use crate::git;
use crate::launcher::ProcessLauncher;

const FAST_INTERVAL: Duration = Duration::from_secs(30);
const SLOW_INTERVAL: Duration = Duration::from_secs(300);

pub struct PrStatusPoller {
    launcher: Arc<ProcessLauncher>,
    bridge: Arc<MessageBridge>,
    client: reqwest::Client,
    inflight: DashMap<String, ()>,
}

impl PrStatusPoller {
    pub fn new(launcher: Arc<ProcessLauncher>, bridge: Arc<MessageBridge>) -> Arc<Self> {
        Arc::new(Self {
            launcher,
            bridge,
            client: reqwest::Client::new(),
            inflight: DashMap::new(),
        })
    }

    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let interval = poll_interval(self.bridge.any_browsers());
                tokio::time::sleep(interval).await;
                self.poll_once().await;
            }
        })
    }

    pub(crate) async fn poll_once(self: &Arc<Self>) {
        let Ok(token) = std::env::var("GITHUB_TOKEN") else {
            return;
        };
        if token.is_empty() {
            return;
        }

        for record in self.launcher.list_sessions() {
            if record.archived {
                continue;
            }
            // Only fetch for sessions somebody is actually watching.
            if self.bridge.browser_count(&record.id) == 0 {
                continue;
            }
            let Some(branch) = record.git.as_ref().and_then(|g| g.branch.clone()) else {
                continue;
            };
            if self.inflight.insert(record.id.clone(), ()).is_some() {
                debug!(
                    component = "pr_status",
                    event = "pr_status.fetch.overlapping",
                    session_id = %record.id,
                    "Fetch already in flight, skipping"
                );
                continue;
            }

            let poller = self.clone();
            let token = token.clone();
            tokio::spawn(async move {
                poller
                    .fetch_and_broadcast(&record.id, &record.cwd, &branch, &token)
                    .await;
                poller.inflight.remove(&record.id);
            });
        }
    }

    async fn fetch_and_broadcast(&self, session_id: &str, cwd: &str, branch: &str, token: &str) {
        let Some(slug) = git::resolve_github_slug(cwd).await else {
            return;
        };
        match self.fetch_open_pr(&slug, branch, token).await {
            Ok(pr) => {
                self.bridge
                    .broadcast_to_session(
                        session_id,
                        json!({
                            "type": "pr_status",
                            "session_id": session_id,
                            "branch": branch,
                            "pr": pr,
                        }),
                    )
                    .await;
            }
            Err(e) => {
                warn!(
                    component = "pr_status",
                    event = "pr_status.fetch.failed",
                    session_id = %session_id,
                    branch = %branch,
                    error = %e,
                    "PR status fetch failed"
                );
            }
        }
    }

    async fn fetch_open_pr(
        &self,
        slug: &str,
        branch: &str,
        token: &str,
    ) -> Result<Value, anyhow::Error> {
        let owner = slug.split('/').next().unwrap_or_default();
        let url = format!(
            "https://api.github.com/repos/{}/pulls?state=open&head={}:{}",
            slug, owner, branch
        );
        let resp = self
            .client
            .get(&url)
            .header("Authorization", format!("Bearer {}", token))
            .header("User-Agent", "tether-server")
            .header("Accept", "application/vnd.github+json")
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("GitHub API error {}: {}", status, text);
        }

        let pulls: Value = resp.json().await?;
        Ok(summarize_pr(&pulls))
    }
}

fn poll_interval(any_browsers: bool) -> Duration {
    if any_browsers {
        FAST_INTERVAL
    } else {
        SLOW_INTERVAL
    }
}

/// First open PR from a pulls listing, reduced to the fields browsers show.
/// `null` when the branch has no open PR, so the UI can clear stale state.
fn summarize_pr(pulls: &Value) -> Value {
    let Some(pr) = pulls.as_array().and_then(|list| list.first()) else {
        return Value::Null;
    };
    json!({
        "number": pr.get("number"),
        "title": pr.get("title"),
        "state": pr.get("state"),
        "draft": pr.get("draft"),
        "url": pr.get("html_url"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_adapts_to_browser_presence() {
        assert_eq!(poll_interval(true), FAST_INTERVAL);
        assert_eq!(poll_interval(false), SLOW_INTERVAL);
        assert!(poll_interval(true) < poll_interval(false));
    }

    #[test]
    fn summarizes_the_first_open_pr() {
        let pulls = json!([{
            "number": 17,
            "title": "Teach the bridge about keep-alives",
            "state": "open",
            "draft": false,
            "html_url": "https://github.com/octo/widgets/pull/17",
            "user": {"login": "octocat"}
        }]);
        let summary = summarize_pr(&pulls);
        assert_eq!(summary["number"], 17);
        assert_eq!(summary["title"], "Teach the bridge about keep-alives");
        assert_eq!(summary["url"], "https://github.com/octo/widgets/pull/17");
        assert!(summary.get("user").is_none());
    }

    #[test]
    fn no_open_pr_summarizes_to_null() {
        assert_eq!(summarize_pr(&json!([])), Value::Null);
        assert_eq!(summarize_pr(&json!({})), Value::Null);
    }
}
