//! Git worktree management for worker isolation.
//!
//! Each worker runs in its own git worktree, pinned to the task's base
//! revision, providing filesystem isolation without the overhead of a full
//! repository clone. Worktrees share the object store of the main
//! repository but have independent working directories and index files.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error("not a git repository: {0}")]
    NotAGitRepo(PathBuf),

    #[error("git command failed: {message}")]
    GitCommand {
        message: String,
        #[source]
        source: std::io::Error,
    },

    #[error("git {command} failed (exit {code}): {stderr}")]
    GitExit {
        command: String,
        code: i32,
        stderr: String,
    },

    #[error("worktree path exists but has unexpected branch: expected {expected}, found {found}")]
    BranchMismatch { expected: String, found: String },

    #[error("failed to parse worktree list output: {0}")]
    ParseError(String),
}

/// Result of a merge operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeResult {
    Success,
    Conflict { details: String },
}

/// Information about a single git worktree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeInfo {
    pub path: PathBuf,
    pub branch: Option<String>,
    pub head_commit: String,
}

/// Manages git worktrees for worker isolation against one main repository.
///
/// Git does not support concurrent worktree operations on the same
/// repository (it takes a lock file on the shared object store). This
/// manager serialises all mutating git operations through an internal mutex
/// so that concurrently running worker lifecycles do not race.
#[derive(Debug)]
pub struct WorktreeManager {
    repo_path: PathBuf,
    git_lock: Arc<Mutex<()>>,
}

impl Clone for WorktreeManager {
    fn clone(&self) -> Self {
        Self {
            repo_path: self.repo_path.clone(),
            git_lock: Arc::clone(&self.git_lock),
        }
    }
}

impl WorktreeManager {
    /// Create a new `WorktreeManager` rooted at `repo_path`.
    ///
    /// # Errors
    ///
    /// Returns [`WorktreeError::NotAGitRepo`] if `repo_path` is not a git
    /// repository.
    pub fn new(repo_path: impl Into<PathBuf>) -> Result<Self, WorktreeError> {
        let repo_path = repo_path.into();

        let output = Command::new("git")
            .arg("rev-parse")
            .arg("--git-dir")
            .current_dir(&repo_path)
            .output()
            .map_err(|e| WorktreeError::GitCommand {
                message: "failed to run git rev-parse".into(),
                source: e,
            })?;

        if !output.status.success() {
            return Err(WorktreeError::NotAGitRepo(repo_path));
        }

        Ok(Self {
            repo_path,
            git_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    /// Build the conventional branch name for a task attempt.
    ///
    /// Format: `wiggum/<task_id>` for a main attempt, or
    /// `wiggum/<task_id>/<suffix>` for a fix/resolve follow-up.
    pub fn branch_name(task_id: &str, suffix: Option<&str>) -> String {
        match suffix {
            Some(s) => format!("wiggum/{task_id}/{s}"),
            None => format!("wiggum/{task_id}"),
        }
    }

    /// Create a worktree at the exact path `worktree_path`, on `branch_name`,
    /// pinned to `base_revision` (a commit-ish; typically the board's
    /// current default branch tip). If `branch_name` does not yet exist it
    /// is created from `base_revision`.
    ///
    /// This operation is idempotent: if a worktree already exists at
    /// `worktree_path` with the expected branch, it is returned as-is.
    pub fn create_worktree(
        &self,
        worktree_path: &Path,
        branch_name: &str,
        base_revision: &str,
    ) -> Result<WorktreeInfo, WorktreeError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());

        if let Ok(existing) = self.find_worktree_by_path(worktree_path) {
            if let Some(ref branch) = existing.branch {
                if branch == branch_name {
                    tracing::info!(
                        path = %worktree_path.display(),
                        branch = branch_name,
                        "worktree already exists, returning existing"
                    );
                    return Ok(existing);
                }
                return Err(WorktreeError::BranchMismatch {
                    expected: branch_name.to_string(),
                    found: branch.clone(),
                });
            }
            tracing::info!(path = %worktree_path.display(), "worktree exists with detached HEAD, returning existing");
            return Ok(existing);
        }

        if let Some(parent) = worktree_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| WorktreeError::GitCommand {
                message: format!("failed to create parent of {}", worktree_path.display()),
                source: e,
            })?;
        }

        let branch_exists = self.branch_exists(branch_name)?;

        let output = if branch_exists {
            Command::new("git")
                .args(["worktree", "add"])
                .arg(worktree_path)
                .arg(branch_name)
                .current_dir(&self.repo_path)
                .output()
                .map_err(|e| WorktreeError::GitCommand {
                    message: "failed to run git worktree add".into(),
                    source: e,
                })?
        } else {
            Command::new("git")
                .args(["worktree", "add", "-b"])
                .arg(branch_name)
                .arg(worktree_path)
                .arg(base_revision)
                .current_dir(&self.repo_path)
                .output()
                .map_err(|e| WorktreeError::GitCommand {
                    message: "failed to run git worktree add -b".into(),
                    source: e,
                })?
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            self.cleanup_partial(worktree_path);
            return Err(WorktreeError::GitExit {
                command: "worktree add".into(),
                code: output.status.code().unwrap_or(-1),
                stderr,
            });
        }

        self.find_worktree_by_path(worktree_path)
    }

    /// Remove a worktree by its path. No-op if it does not exist.
    pub fn remove_worktree(&self, path: &Path) -> Result<(), WorktreeError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());

        if self.find_worktree_by_path(path).is_err() {
            if path.exists() {
                tracing::warn!(path = %path.display(), "directory exists but not registered as worktree, removing");
                let _ = std::fs::remove_dir_all(path);
            }
            return Ok(());
        }

        let output = Command::new("git")
            .args(["worktree", "remove", "--force"])
            .arg(path)
            .current_dir(&self.repo_path)
            .output()
            .map_err(|e| WorktreeError::GitCommand {
                message: "failed to run git worktree remove".into(),
                source: e,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            if stderr.contains("is not a working tree") {
                return Ok(());
            }
            return Err(WorktreeError::GitExit {
                command: "worktree remove".into(),
                code: output.status.code().unwrap_or(-1),
                stderr,
            });
        }

        Ok(())
    }

    pub fn list_worktrees(&self) -> Result<Vec<WorktreeInfo>, WorktreeError> {
        let output = Command::new("git")
            .args(["worktree", "list", "--porcelain"])
            .current_dir(&self.repo_path)
            .output()
            .map_err(|e| WorktreeError::GitCommand {
                message: "failed to run git worktree list".into(),
                source: e,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            return Err(WorktreeError::GitExit {
                command: "worktree list".into(),
                code: output.status.code().unwrap_or(-1),
                stderr,
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_porcelain_output(&stdout)
    }

    /// Run `git worktree prune` to drop references to worktrees whose
    /// directories were removed externally.
    pub fn cleanup_stale(&self) -> Result<(), WorktreeError> {
        let output = Command::new("git")
            .args(["worktree", "prune"])
            .current_dir(&self.repo_path)
            .output()
            .map_err(|e| WorktreeError::GitCommand {
                message: "failed to run git worktree prune".into(),
                source: e,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            return Err(WorktreeError::GitExit {
                command: "worktree prune".into(),
                code: output.status.code().unwrap_or(-1),
                stderr,
            });
        }

        Ok(())
    }

    /// Merge `branch_name` into the repository's current branch with
    /// `--no-ff`. Conflicts abort the merge automatically and are reported
    /// as [`MergeResult::Conflict`] rather than an error.
    pub fn merge_branch(&self, branch_name: &str) -> Result<MergeResult, WorktreeError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());

        let output = Command::new("git")
            .args(["merge", "--no-ff", branch_name])
            .current_dir(&self.repo_path)
            .output()
            .map_err(|e| WorktreeError::GitCommand {
                message: "failed to run git merge".into(),
                source: e,
            })?;

        if output.status.success() {
            return Ok(MergeResult::Success);
        }

        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();

        if stderr.contains("CONFLICT") || stdout.contains("CONFLICT") || stderr.contains("Automatic merge failed") {
            let _ = Command::new("git")
                .args(["merge", "--abort"])
                .current_dir(&self.repo_path)
                .output();

            return Ok(MergeResult::Conflict {
                details: format!("{stdout}\n{stderr}").trim().to_string(),
            });
        }

        Err(WorktreeError::GitExit {
            command: "merge".into(),
            code: output.status.code().unwrap_or(-1),
            stderr,
        })
    }

    /// Push `branch_name` to `origin`, setting it as the upstream. This is
    /// the orchestrator's one direct touch of a remote, done once a worker's
    /// pipeline has completed successfully so a pull request can be opened
    /// against it.
    pub fn push_branch(&self, branch_name: &str) -> Result<(), WorktreeError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());

        let output = Command::new("git")
            .args(["push", "-u", "origin", branch_name])
            .current_dir(&self.repo_path)
            .output()
            .map_err(|e| WorktreeError::GitCommand {
                message: "failed to run git push".into(),
                source: e,
            })?;

        if output.status.success() {
            return Ok(());
        }

        Err(WorktreeError::GitExit {
            command: "push".into(),
            code: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    /// Force-delete a local branch. Idempotent: succeeds even if the branch
    /// does not exist.
    pub fn delete_branch(&self, branch_name: &str) -> Result<(), WorktreeError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());

        let output = Command::new("git")
            .args(["branch", "-D", branch_name])
            .current_dir(&self.repo_path)
            .output()
            .map_err(|e| WorktreeError::GitCommand {
                message: "failed to run git branch -D".into(),
                source: e,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            if stderr.contains("not found") {
                return Ok(());
            }
            return Err(WorktreeError::GitExit {
                command: "branch -D".into(),
                code: output.status.code().unwrap_or(-1),
                stderr,
            });
        }

        Ok(())
    }

    /// Check whether a branch exists in the repository.
    pub fn branch_exists(&self, branch_name: &str) -> Result<bool, WorktreeError> {
        let output = Command::new("git")
            .args(["rev-parse", "--verify"])
            .arg(format!("refs/heads/{branch_name}"))
            .current_dir(&self.repo_path)
            .output()
            .map_err(|e| WorktreeError::GitCommand {
                message: "failed to run git rev-parse --verify".into(),
                source: e,
            })?;

        Ok(output.status.success())
    }

    /// Resolve `rev` to a commit SHA, used to pin a worktree to the board's
    /// current default-branch tip at creation time.
    pub fn resolve_revision(&self, rev: &str) -> Result<String, WorktreeError> {
        let output = Command::new("git")
            .args(["rev-parse", "--verify"])
            .arg(rev)
            .current_dir(&self.repo_path)
            .output()
            .map_err(|e| WorktreeError::GitCommand {
                message: "failed to run git rev-parse".into(),
                source: e,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            return Err(WorktreeError::GitExit {
                command: "rev-parse".into(),
                code: output.status.code().unwrap_or(-1),
                stderr,
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Check for uncommitted changes in the main repository's own working
    /// tree, outside any worktree. Used by the violation monitor to detect
    /// an agent that escaped its worktree.
    pub fn main_tree_is_dirty(&self) -> Result<bool, WorktreeError> {
        let output = Command::new("git")
            .args(["status", "--porcelain"])
            .current_dir(&self.repo_path)
            .output()
            .map_err(|e| WorktreeError::GitCommand {
                message: "failed to run git status".into(),
                source: e,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            return Err(WorktreeError::GitExit {
                command: "status".into(),
                code: output.status.code().unwrap_or(-1),
                stderr,
            });
        }

        Ok(!output.stdout.is_empty())
    }

    fn find_worktree_by_path(&self, path: &Path) -> Result<WorktreeInfo, WorktreeError> {
        let worktrees = self.list_worktrees()?;
        let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());

        for wt in worktrees {
            let wt_canonical = wt.path.canonicalize().unwrap_or_else(|_| wt.path.clone());
            if wt_canonical == canonical {
                return Ok(wt);
            }
        }

        Err(WorktreeError::ParseError(format!(
            "worktree not found at path: {}",
            path.display()
        )))
    }

    fn cleanup_partial(&self, path: &Path) {
        if path.exists() {
            tracing::warn!(path = %path.display(), "cleaning up partial worktree directory");
            let _ = std::fs::remove_dir_all(path);
        }
        let _ = self.cleanup_stale();
    }
}

/// Parse the porcelain output of `git worktree list --porcelain`.
fn parse_porcelain_output(output: &str) -> Result<Vec<WorktreeInfo>, WorktreeError> {
    let mut worktrees = Vec::new();
    let mut current_path: Option<PathBuf> = None;
    let mut current_head: Option<String> = None;
    let mut current_branch: Option<String> = None;

    for line in output.lines() {
        if line.is_empty() {
            if let (Some(path), Some(head)) = (current_path.take(), current_head.take()) {
                worktrees.push(WorktreeInfo {
                    path,
                    branch: current_branch.take(),
                    head_commit: head,
                });
            } else {
                current_path = None;
                current_head = None;
                current_branch = None;
            }
            continue;
        }

        if let Some(rest) = line.strip_prefix("worktree ") {
            current_path = Some(PathBuf::from(rest));
        } else if let Some(rest) = line.strip_prefix("HEAD ") {
            current_head = Some(rest.to_string());
        } else if let Some(rest) = line.strip_prefix("branch ") {
            let branch = rest.strip_prefix("refs/heads/").unwrap_or(rest).to_string();
            current_branch = Some(branch);
        }
    }

    if let (Some(path), Some(head)) = (current_path, current_head) {
        worktrees.push(WorktreeInfo {
            path,
            branch: current_branch,
            head_commit: head,
        });
    }

    Ok(worktrees)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;
    use tempfile::TempDir;

    fn create_temp_repo() -> (TempDir, PathBuf) {
        let dir = TempDir::new().expect("failed to create temp dir");
        let repo_path = dir.path().to_path_buf();

        let status = Command::new("git")
            .args(["init"])
            .current_dir(&repo_path)
            .output()
            .expect("failed to run git init");
        assert!(status.status.success(), "git init failed");

        let _ = Command::new("git")
            .args(["config", "user.email", "test@wiggum.dev"])
            .current_dir(&repo_path)
            .output()
            .expect("failed to configure email");
        let _ = Command::new("git")
            .args(["config", "user.name", "Wiggum Test"])
            .current_dir(&repo_path)
            .output()
            .expect("failed to configure name");

        let readme = repo_path.join("README.md");
        std::fs::write(&readme, "# Test repo\n").expect("failed to write README");

        let _ = Command::new("git")
            .args(["add", "."])
            .current_dir(&repo_path)
            .output()
            .expect("failed to run git add");

        let status = Command::new("git")
            .args(["commit", "-m", "Initial commit"])
            .current_dir(&repo_path)
            .output()
            .expect("failed to run git commit");
        assert!(status.status.success(), "git commit failed");

        (dir, repo_path)
    }

    #[test]
    fn new_with_valid_repo() {
        let (_dir, repo_path) = create_temp_repo();
        let mgr = WorktreeManager::new(&repo_path);
        assert!(mgr.is_ok());
        assert_eq!(mgr.unwrap().repo_path(), repo_path);
    }

    #[test]
    fn new_with_invalid_repo() {
        let dir = TempDir::new().expect("failed to create temp dir");
        let result = WorktreeManager::new(dir.path());
        assert!(matches!(result, Err(WorktreeError::NotAGitRepo(_))));
    }

    #[test]
    fn branch_name_format() {
        assert_eq!(WorktreeManager::branch_name("AUTH-1", None), "wiggum/AUTH-1");
        assert_eq!(
            WorktreeManager::branch_name("AUTH-1", Some("fix-1")),
            "wiggum/AUTH-1/fix-1"
        );
    }

    #[test]
    fn create_and_list_worktree() {
        let (_dir, repo_path) = create_temp_repo();
        let mgr = WorktreeManager::new(&repo_path).unwrap();
        let base = mgr.resolve_revision("HEAD").unwrap();

        let worktree_path = repo_path.parent().unwrap().join("wt-1").join("workspace");
        let branch = WorktreeManager::branch_name("AUTH-1", None);
        let info = mgr
            .create_worktree(&worktree_path, &branch, &base)
            .expect("create_worktree failed");

        assert!(info.path.exists());
        assert_eq!(info.branch.as_deref(), Some(branch.as_str()));

        let worktrees = mgr.list_worktrees().expect("list_worktrees failed");
        assert!(worktrees.len() >= 2);

        mgr.remove_worktree(&info.path).unwrap();
    }

    #[test]
    fn create_worktree_idempotent() {
        let (_dir, repo_path) = create_temp_repo();
        let mgr = WorktreeManager::new(&repo_path).unwrap();
        let base = mgr.resolve_revision("HEAD").unwrap();

        let worktree_path = repo_path.parent().unwrap().join("wt-2").join("workspace");
        let branch = WorktreeManager::branch_name("AUTH-2", None);

        let info1 = mgr.create_worktree(&worktree_path, &branch, &base).unwrap();
        let info2 = mgr.create_worktree(&worktree_path, &branch, &base).unwrap();
        assert_eq!(info1.path, info2.path);
        assert_eq!(info1.branch, info2.branch);

        mgr.remove_worktree(&info1.path).unwrap();
    }

    #[test]
    fn remove_worktree_idempotent() {
        let (_dir, repo_path) = create_temp_repo();
        let mgr = WorktreeManager::new(&repo_path).unwrap();
        let base = mgr.resolve_revision("HEAD").unwrap();

        let worktree_path = repo_path.parent().unwrap().join("wt-3").join("workspace");
        let branch = WorktreeManager::branch_name("AUTH-3", None);
        let info = mgr.create_worktree(&worktree_path, &branch, &base).unwrap();

        mgr.remove_worktree(&info.path).unwrap();
        mgr.remove_worktree(&info.path).unwrap();
        assert!(!info.path.exists());
    }

    #[test]
    fn parse_porcelain_output_basic() {
        let input = "\
worktree /home/user/project
HEAD abc123def456
branch refs/heads/main

worktree /home/user/worktrees/feature
HEAD 789abc012def
branch refs/heads/wiggum/AUTH-1

worktree /home/user/worktrees/detached
HEAD 111222333444
detached

";
        let result = parse_porcelain_output(input).unwrap();
        assert_eq!(result.len(), 3);
        assert_eq!(result[1].branch.as_deref(), Some("wiggum/AUTH-1"));
        assert_eq!(result[2].branch, None);
    }

    #[test]
    fn parse_porcelain_output_no_trailing_newline() {
        let input = "\
worktree /home/user/project
HEAD abc123
branch refs/heads/main";
        let result = parse_porcelain_output(input).unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].branch.as_deref(), Some("main"));
    }

    #[test]
    fn parse_porcelain_output_empty() {
        assert!(parse_porcelain_output("").unwrap().is_empty());
    }

    #[test]
    fn merge_branch_success() {
        let (_dir, repo_path) = create_temp_repo();
        let mgr = WorktreeManager::new(&repo_path).unwrap();
        let base = mgr.resolve_revision("HEAD").unwrap();

        let worktree_path = repo_path.parent().unwrap().join("wt-4").join("workspace");
        let branch = WorktreeManager::branch_name("AUTH-4", None);
        let info = mgr.create_worktree(&worktree_path, &branch, &base).unwrap();

        std::fs::write(info.path.join("feature.txt"), "new feature\n").unwrap();
        let run = |args: &[&str], dir: &Path| {
            let output = Command::new("git").args(args).current_dir(dir).output().unwrap();
            assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
        };
        run(&["add", "feature.txt"], &info.path);
        run(&["commit", "-m", "Add feature"], &info.path);

        mgr.remove_worktree(&info.path).unwrap();

        let result = mgr.merge_branch(&branch).unwrap();
        assert_eq!(result, MergeResult::Success);
        assert!(repo_path.join("feature.txt").exists());
    }

    #[test]
    fn delete_branch_idempotent() {
        let (_dir, repo_path) = create_temp_repo();
        let mgr = WorktreeManager::new(&repo_path).unwrap();
        mgr.delete_branch("wiggum/nonexistent").expect("should not fail");
    }

    #[test]
    fn main_tree_is_dirty_detects_uncommitted_changes() {
        let (_dir, repo_path) = create_temp_repo();
        let mgr = WorktreeManager::new(&repo_path).unwrap();
        assert!(!mgr.main_tree_is_dirty().unwrap());

        std::fs::write(repo_path.join("stray.txt"), "oops\n").unwrap();
        assert!(mgr.main_tree_is_dirty().unwrap());
    }
}
