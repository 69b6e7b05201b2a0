//! Shared git utilities for resolving branch/summary info from a working directory.

use std::process::Stdio;
use tether_protocol::GitSummary;
use tokio::process::Command;

/// Resolve the opportunistic git summary for a working directory: branch,
/// ahead/behind vs upstream, cumulative changed-line counts. `None` when the
/// directory is not a git checkout.
pub async fn resolve_summary(cwd: &str) -> Option<GitSummary> {
    let branch = resolve_git_branch(cwd).await?;
    let (behind, ahead) = ahead_behind(cwd).await.unwrap_or((0, 0));
    let (lines_added, lines_removed) = diff_totals(cwd).await.unwrap_or((0, 0));
    Some(GitSummary {
        branch: Some(branch),
        ahead,
        behind,
        lines_added,
        lines_removed,
    })
}

/// Resolve just the git branch from a working directory.
pub async fn resolve_git_branch(path: &str) -> Option<String> {
    run_git(&["rev-parse", "--abbrev-ref", "HEAD"], path).await
}

/// Resolve the `owner/repo` slug from the origin remote, if it points at
/// GitHub.
pub async fn resolve_github_slug(path: &str) -> Option<String> {
    let url = run_git(&["config", "--get", "remote.origin.url"], path).await?;
    parse_github_remote(&url)
}

async fn ahead_behind(cwd: &str) -> Option<(i64, i64)> {
    let out = run_git(
        &["rev-list", "--left-right", "--count", "@{upstream}...HEAD"],
        cwd,
    )
    .await?;
    parse_ahead_behind(&out)
}

async fn diff_totals(cwd: &str) -> Option<(i64, i64)> {
    let out = run_git(&["diff", "--numstat", "HEAD"], cwd).await?;
    Some(parse_numstat(&out))
}

/// `rev-list --left-right --count upstream...HEAD` prints
/// `<upstream-only>\t<head-only>`, i.e. behind then ahead.
fn parse_ahead_behind(out: &str) -> Option<(i64, i64)> {
    let mut parts = out.split_whitespace();
    let behind = parts.next()?.parse().ok()?;
    let ahead = parts.next()?.parse().ok()?;
    Some((behind, ahead))
}

fn parse_numstat(out: &str) -> (i64, i64) {
    let mut added = 0;
    let mut removed = 0;
    for line in out.lines() {
        let mut cols = line.split('\t');
        // Binary files show "-" in both columns; skip them.
        if let (Some(a), Some(r)) = (cols.next(), cols.next()) {
            if let (Ok(a), Ok(r)) = (a.trim().parse::<i64>(), r.trim().parse::<i64>()) {
                added += a;
                removed += r;
            }
        }
    }
    (added, removed)
}

/// Extract `owner/repo` from the common GitHub remote spellings.
fn parse_github_remote(url: &str) -> Option<String> {
    let url = url.trim().trim_end_matches(".git");
    let rest = url
        .strip_prefix("git@github.com:")
        .or_else(|| url.strip_prefix("https://github.com/"))
        .or_else(|| url.strip_prefix("ssh://git@github.com/"))?;
    let mut parts = rest.splitn(2, '/');
    let owner = parts.next()?;
    let repo = parts.next()?;
    if owner.is_empty() || repo.is_empty() || repo.contains('/') {
        return None;
    }
    Some(format!("{}/{}", owner, repo))
}

async fn run_git(args: &[&str], cwd: &str) -> Option<String> {
    let output = Command::new("/usr/bin/git")
        .args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .output()
        .await
        .ok()?;

    if !output.status.success() {
        return None;
    }

    let text = String::from_utf8(output.stdout).ok()?;
    let text = text.trim();
    if text.is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}
