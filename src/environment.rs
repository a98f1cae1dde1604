// src/environment.rs
//
// =============================================================================
// WHIRR: ENVIRONMENT CAPTURE
// =============================================================================
//
// Best-effort git and pip-freeze capture at run open. Every failure is
// silent and the field is simply omitted: environment capture must never
// fail a run. `std::process::Command` has no built-in timeout, so each
// command runs on a blocking thread and is raced against a timer.

use serde::{Deserialize, Serialize};
use std::process::Command;
use std::time::Duration;
use tokio::time::timeout;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitInfo {
    pub commit: String,
    pub short_hash: String,
    pub branch: String,
    pub dirty: bool,
    pub remote: Option<String>,
}

async fn run_with_timeout(args: &[&str], dur: Duration) -> Option<String> {
    let program = args[0].to_string();
    let rest: Vec<String> = args[1..].iter().map(|s| s.to_string()).collect();

    let handle = tokio::task::spawn_blocking(move || {
        Command::new(&program).args(&rest).output().ok()
    });

    match timeout(dur, handle).await {
        Ok(Ok(Some(output))) if output.status.success() => {
            Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
        }
        _ => None,
    }
}

/// Best-effort git metadata. Returns `None` entirely if the working tree
/// isn't a git repo (or `git` isn't on `PATH`, or any step times out).
pub async fn capture_git_info() -> Option<GitInfo> {
    const TIMEOUT: Duration = Duration::from_secs(5);

    let inside = run_with_timeout(&["git", "rev-parse", "--is-inside-work-tree"], TIMEOUT).await?;
    if inside != "true" {
        return None;
    }

    let commit = run_with_timeout(&["git", "rev-parse", "HEAD"], TIMEOUT).await?;
    let short_hash = run_with_timeout(&["git", "rev-parse", "--short", "HEAD"], TIMEOUT).await?;
    let status = run_with_timeout(&["git", "status", "--porcelain"], TIMEOUT).await;
    let dirty = status.map(|s| !s.is_empty()).unwrap_or(false);
    let branch = run_with_timeout(&["git", "rev-parse", "--abbrev-ref", "HEAD"], TIMEOUT)
        .await
        .unwrap_or_default();
    let remote = run_with_timeout(&["git", "remote", "get-url", "origin"], TIMEOUT).await;

    Some(GitInfo {
        commit,
        short_hash,
        branch,
        dirty,
        remote,
    })
}

/// Best-effort `pip freeze` equivalent for `requirements.txt`. Tries `pip
/// freeze` then falls back to `python -m pip freeze`, matching the original.
pub async fn capture_pip_freeze() -> Option<String> {
    const TIMEOUT: Duration = Duration::from_secs(30);

    if let Some(out) = run_with_timeout(&["pip", "freeze"], TIMEOUT).await {
        return Some(out);
    }
    run_with_timeout(&["python", "-m", "pip", "freeze"], TIMEOUT).await
}
