//! `wiggum clean` command: force-remove worktrees and stale worker
//! directories under the workers root. Never touches the board.

use std::path::Path;

use anyhow::{Context, Result};

use wiggum_core::lifecycle::is_worker_alive;
use wiggum_core::worktree::WorktreeManager;

pub fn run_clean(project_dir: &Path, workers_root: &Path) -> Result<()> {
    let worktree = WorktreeManager::new(project_dir).context("failed to open project repository")?;

    let mut removed = 0;
    let mut pruned = 0;

    if workers_root.is_dir() {
        for entry in std::fs::read_dir(workers_root).context("failed to read workers root")? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let worker_dir = entry.path();

            let workspace = worker_dir.join("workspace");
            if workspace.exists() {
                match worktree.remove_worktree(&workspace) {
                    Ok(()) => {
                        println!("  removed worktree: {}", workspace.display());
                        removed += 1;
                    }
                    Err(e) => {
                        eprintln!("  warning: failed to remove worktree {}: {e}", workspace.display());
                    }
                }
            }

            if !is_worker_alive(&worker_dir) {
                if let Err(e) = std::fs::remove_dir_all(&worker_dir) {
                    eprintln!("  warning: failed to remove stale worker dir {}: {e}", worker_dir.display());
                } else {
                    println!("  pruned stale worker dir: {}", worker_dir.display());
                    pruned += 1;
                }
            }
        }
    }

    worktree.cleanup_stale().ok();

    println!("\nclean complete: {removed} worktree(s) removed, {pruned} worker dir(s) pruned.");
    Ok(())
}
