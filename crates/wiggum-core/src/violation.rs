//! The violation monitor: a background task that periodically checks the
//! main project's working tree for uncommitted changes outside the
//! orchestrator's own metadata directory, catching an agent that escaped
//! its worktree.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::worktree::WorktreeManager;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViolationRecord {
    pub detected_at_epoch: u64,
    pub detail: String,
}

/// Appends a `ViolationRecord` to `<worker>/violation_flag.txt` if it does
/// not already exist (first violation wins; the sentinel's mere presence is
/// what matters to worker-lifecycle cleanup).
fn record_violation(worker_dir: &Path, detail: &str) -> std::io::Result<()> {
    let sentinel = worker_dir.join("violation_flag.txt");
    if sentinel.exists() {
        return Ok(());
    }
    let epoch = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    std::fs::write(&sentinel, format!("{epoch} {detail}\n"))
}

/// Spawn the violation monitor as a background tokio task. Polls
/// `interval` until cancelled via the returned [`CancellationToken`].
pub fn spawn_monitor(
    worktree: WorktreeManager,
    worker_dir: PathBuf,
    interval: Duration,
) -> (JoinHandle<()>, CancellationToken) {
    let token = CancellationToken::new();
    let child_token = token.clone();

    let handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = child_token.cancelled() => break,
                _ = tokio::time::sleep(interval) => {
                    match worktree.main_tree_is_dirty() {
                        Ok(true) => {
                            tracing::warn!(worker = %worker_dir.display(), "detected write outside worktree");
                            if let Err(e) = record_violation(&worker_dir, "main tree dirty outside worktree") {
                                tracing::warn!(error = %e, "failed to write violation sentinel");
                            }
                        }
                        Ok(false) => {}
                        Err(e) => {
                            tracing::warn!(error = %e, "violation monitor failed to check main tree status");
                        }
                    }
                }
            }
        }
    });

    (handle, token)
}

/// Whether a violation was recorded for this worker.
pub fn has_violation(worker_dir: &Path) -> bool {
    worker_dir.join("violation_flag.txt").exists()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn record_violation_is_idempotent() {
        let dir = TempDir::new().unwrap();
        record_violation(dir.path(), "first").unwrap();
        let first_contents = std::fs::read_to_string(dir.path().join("violation_flag.txt")).unwrap();
        record_violation(dir.path(), "second").unwrap();
        let second_contents = std::fs::read_to_string(dir.path().join("violation_flag.txt")).unwrap();
        assert_eq!(first_contents, second_contents);
    }

    #[test]
    fn has_violation_reflects_sentinel_presence() {
        let dir = TempDir::new().unwrap();
        assert!(!has_violation(dir.path()));
        record_violation(dir.path(), "x").unwrap();
        assert!(has_violation(dir.path()));
    }
}
