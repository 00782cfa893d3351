//! Opening a pull request: the orchestrator's one integration with the PR
//! hosting service, used via a single external command rather than any
//! hosting-specific client library, exactly like the version-control system
//! is used via a handful of documented `git` subprocess calls.

use std::path::Path;
use std::process::Command;

/// What happened when a pull request was requested for a pushed branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrOutcome {
    Opened,
    /// The worker's own pipeline already succeeded; a PR-hosting failure is
    /// reported, not propagated as a worker failure.
    Skipped { reason: String },
}

fn pr_binary() -> String {
    std::env::var("WIGGUM_PR_COMMAND").unwrap_or_else(|_| "gh".to_string())
}

/// Open a pull request for `branch`, titled after the task, with `body` as
/// its description. Run from `repo_path` so the hosting CLI can infer the
/// remote.
pub fn open_pull_request(repo_path: &Path, branch: &str, task_id: &str, body: &str) -> PrOutcome {
    let binary = pr_binary();
    let title = format!("{task_id}: {}", body.lines().next().unwrap_or(task_id));

    let result = Command::new(&binary)
        .args(["pr", "create", "--head", branch, "--title", &title, "--body", body])
        .current_dir(repo_path)
        .output();

    match result {
        Ok(output) if output.status.success() => PrOutcome::Opened,
        Ok(output) => PrOutcome::Skipped {
            reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        },
        Err(e) => PrOutcome::Skipped { reason: e.to_string() },
    }
}
