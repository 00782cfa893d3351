//! Worker lifecycle: create the isolated workspace, drive the pipeline, and
//! tear the worker down, translating the pipeline's outcome into a board
//! update.
//!
//! This is everything that happens around one attempted run of one task —
//! the thing the spec calls a "worker" — from directory allocation through
//! reap.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use wiggum_fs::{ActivityLog, WorkerKind};

use crate::finalize::{self, PrOutcome};
use crate::gate::GateResult;
use crate::harness::HarnessRegistry;
use crate::pipeline::{Pipeline, PipelineOutcome, PipelineRunner};
use crate::violation;
use crate::worktree::{MergeResult, WorktreeManager};

/// On-disk marker recording follow-up needs after a worker exits, read by
/// the scheduler's follow-up step.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GitState {
    pub needs_fix: bool,
    pub needs_resolve: bool,
}

/// The final, fully-resolved outcome of one worker's run, as reported back
/// to the scheduler for the board update and follow-up decisions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerOutcome {
    Success,
    Failed,
    NeedsFix,
}

/// A single worker's on-disk context: the directory, its embedded worktree
/// path, and identity used to build branch names and env vars.
pub struct WorkerContext {
    pub dir: PathBuf,
    pub workspace: PathBuf,
    pub task_id: String,
    pub kind: WorkerKind,
    pub branch: String,
}

/// **Create.** Allocate the worker directory, create its worktree pinned to
/// `base_revision`, write the PRD, record the PID, and return the context
/// the caller will pass to [`run`].
pub fn create(
    workers_root: &Path,
    worktree: &WorktreeManager,
    task_id: &str,
    kind: WorkerKind,
    suffix: Option<&str>,
    base_revision: &str,
    prd_contents: &str,
) -> Result<WorkerContext> {
    let epoch = epoch_secs();
    let dir_suffix = match kind {
        WorkerKind::Main => format!("worker-{task_id}-{epoch}"),
        WorkerKind::Fix => format!("worker-{task_id}-fix-{epoch}"),
        WorkerKind::Resolve => format!("worker-{task_id}-resolve-{epoch}"),
    };
    let dir = workers_root.join(dir_suffix);
    std::fs::create_dir_all(&dir).with_context(|| format!("failed to create worker dir {}", dir.display()))?;

    std::fs::write(dir.join("prd.md"), prd_contents)
        .with_context(|| format!("failed to write prd.md for {task_id}"))?;
    std::fs::write(dir.join("worker.pid"), std::process::id().to_string())
        .with_context(|| format!("failed to write worker.pid for {task_id}"))?;

    let branch = WorktreeManager::branch_name(task_id, suffix);
    let workspace = dir.join("workspace");
    worktree
        .create_worktree(&workspace, &branch, base_revision)
        .with_context(|| format!("failed to create worktree for {task_id}"))?;

    Ok(WorkerContext {
        dir,
        workspace,
        task_id: task_id.to_string(),
        kind,
        branch,
    })
}

/// **Running.** Start the violation monitor, then drive the pipeline to
/// completion. Returns the raw pipeline outcome plus per-step gate results;
/// [`exit_and_reap`] turns this into a [`WorkerOutcome`].
pub async fn run(
    ctx: &WorkerContext,
    worktree: &WorktreeManager,
    registry: &HarnessRegistry,
    activity: &ActivityLog,
    pipeline: &Pipeline,
    project_dir: &Path,
    violation_interval: Duration,
) -> Result<(PipelineOutcome, HashMap<String, GateResult>)> {
    let (monitor_handle, monitor_token) = violation::spawn_monitor(worktree.clone(), ctx.dir.clone(), violation_interval);

    let runner = PipelineRunner::new(registry, activity);
    let outcome = runner
        .run_all(pipeline, &ctx.dir, project_dir, &ctx.task_id, None)
        .await;

    monitor_token.cancel();
    let _ = monitor_handle.await;

    outcome
}

/// **Exit and reap.** Compute the final outcome from the pipeline result and
/// the violation sentinel; on success, push the branch and open a pull
/// request (optionally merging it); remove the worktree; write
/// `git-state.json` recording any follow-up the scheduler should spawn.
pub fn exit_and_reap(
    ctx: &WorkerContext,
    worktree: &WorktreeManager,
    outcome: &PipelineOutcome,
    step_results: &HashMap<String, GateResult>,
    auto_merge: bool,
) -> Result<WorkerOutcome> {
    let violated = violation::has_violation(&ctx.dir);

    let resolved = if violated {
        WorkerOutcome::Failed
    } else {
        match outcome {
            PipelineOutcome::CompletedAll => WorkerOutcome::Success,
            PipelineOutcome::HaltedByAgent { .. } => WorkerOutcome::Success,
            PipelineOutcome::HaltedBlocking { step_id } => {
                if step_results.get(step_id) == Some(&GateResult::Fix) {
                    WorkerOutcome::NeedsFix
                } else {
                    WorkerOutcome::Failed
                }
            }
        }
    };

    let needs_resolve = if resolved == WorkerOutcome::Success {
        finalize_success(ctx, worktree, auto_merge)
    } else {
        false
    };

    let git_state = GitState {
        needs_fix: resolved == WorkerOutcome::NeedsFix,
        needs_resolve,
    };
    let bytes = serde_json::to_vec_pretty(&git_state).context("failed to serialize git-state.json")?;
    std::fs::write(ctx.dir.join("git-state.json"), bytes).context("failed to write git-state.json")?;

    worktree
        .remove_worktree(&ctx.workspace)
        .with_context(|| format!("failed to remove worktree for {}", ctx.task_id))?;

    // Clear the liveness marker now that the worker has actually exited, so
    // `is_worker_alive` stops reporting it as live for as long as the
    // scheduler process that owns it keeps running. The rest of the
    // directory (prd.md, git-state.json, logs) stays for audit.
    let _ = std::fs::remove_file(ctx.dir.join("worker.pid"));

    Ok(resolved)
}

/// Push a successful worker's branch and open a pull request for it, best
/// effort throughout since the worker's own pipeline has already succeeded
/// and a PR-hosting hiccup shouldn't undo that. When `auto_merge` is set,
/// additionally try to merge the branch into the current base; a conflict
/// there is reported back so the scheduler can spawn a resolve worker.
fn finalize_success(ctx: &WorkerContext, worktree: &WorktreeManager, auto_merge: bool) -> bool {
    if let Err(e) = worktree.push_branch(&ctx.branch) {
        tracing::warn!(task_id = %ctx.task_id, error = %e, "failed to push worker branch, leaving it local");
        return false;
    }

    let description = std::fs::read_to_string(ctx.dir.join("prd.md")).unwrap_or_default();
    match finalize::open_pull_request(worktree.repo_path(), &ctx.branch, &ctx.task_id, &description) {
        PrOutcome::Opened => {}
        PrOutcome::Skipped { reason } => {
            tracing::warn!(task_id = %ctx.task_id, reason = %reason, "pull request not opened");
        }
    }

    if !auto_merge {
        return false;
    }

    match worktree.merge_branch(&ctx.branch) {
        Ok(MergeResult::Success) => {
            let _ = worktree.delete_branch(&ctx.branch);
            false
        }
        Ok(MergeResult::Conflict { details }) => {
            tracing::warn!(task_id = %ctx.task_id, details = %details, "merge conflict against base, flagging for a resolve worker");
            true
        }
        Err(e) => {
            tracing::warn!(task_id = %ctx.task_id, error = %e, "failed to merge worker branch");
            false
        }
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

/// Whether the recorded PID in `worker_dir/worker.pid` is still alive.
pub fn is_worker_alive(worker_dir: &Path) -> bool {
    let Ok(text) = std::fs::read_to_string(worker_dir.join("worker.pid")) else {
        return false;
    };
    let Ok(pid) = text.trim().parse::<u32>() else {
        return false;
    };
    #[cfg(unix)]
    {
        unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::{Harness, Invocation};
    use crate::gate::StepResult;
    use async_trait::async_trait;
    use serde_json::json;
    use std::process::Command;
    use tempfile::TempDir;

    struct PassHarness;

    #[async_trait]
    impl Harness for PassHarness {
        fn name(&self) -> &str {
            "agent"
        }

        async fn run_step(&self, invocation: &Invocation) -> Result<StepResult> {
            let result = StepResult {
                gate_result: GateResult::Pass,
                outputs: json!({}),
                errors: Vec::new(),
            };
            std::fs::write(&invocation.result_path, serde_json::to_vec(&result)?)?;
            Ok(result)
        }
    }

    fn create_temp_repo() -> (TempDir, PathBuf) {
        let dir = TempDir::new().unwrap();
        let repo_path = dir.path().to_path_buf();
        for args in [
            vec!["init"],
            vec!["config", "user.email", "test@wiggum.dev"],
            vec!["config", "user.name", "Wiggum Test"],
        ] {
            Command::new("git").args(&args).current_dir(&repo_path).output().unwrap();
        }
        std::fs::write(repo_path.join("README.md"), "# repo\n").unwrap();
        Command::new("git").args(["add", "."]).current_dir(&repo_path).output().unwrap();
        Command::new("git")
            .args(["commit", "-m", "init"])
            .current_dir(&repo_path)
            .output()
            .unwrap();
        (dir, repo_path)
    }

    #[tokio::test]
    async fn full_lifecycle_success() {
        let (_repo_dir, repo_path) = create_temp_repo();
        let workers_root = TempDir::new().unwrap();
        let worktree = WorktreeManager::new(&repo_path).unwrap();
        let base = worktree.resolve_revision("HEAD").unwrap();

        let ctx = create(
            workers_root.path(),
            &worktree,
            "AUTH-1",
            WorkerKind::Main,
            None,
            &base,
            "implement login",
        )
        .unwrap();

        assert!(ctx.workspace.exists());
        assert!(ctx.dir.join("prd.md").exists());
        assert!(ctx.dir.join("worker.pid").exists());

        let mut registry = HarnessRegistry::new();
        registry.register(PassHarness);
        let activity = ActivityLog::new(workers_root.path());
        let pipeline = Pipeline::parse(r#"{ "name": "p", "steps": [ { "id": "build", "agent": "agent" } ] }"#).unwrap();

        let (outcome, step_results) = run(
            &ctx,
            &worktree,
            &registry,
            &activity,
            &pipeline,
            &repo_path,
            Duration::from_secs(3600),
        )
        .await
        .unwrap();

        assert_eq!(outcome, PipelineOutcome::CompletedAll);

        let resolved = exit_and_reap(&ctx, &worktree, &outcome, &step_results, false).unwrap();
        assert_eq!(resolved, WorkerOutcome::Success);
        assert!(!ctx.workspace.exists());

        let git_state: GitState = serde_json::from_slice(&std::fs::read(ctx.dir.join("git-state.json")).unwrap()).unwrap();
        assert!(!git_state.needs_fix);
    }

    #[test]
    fn is_worker_alive_checks_recorded_pid() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("worker.pid"), std::process::id().to_string()).unwrap();
        assert!(is_worker_alive(dir.path()));

        std::fs::write(dir.path().join("worker.pid"), "999999999").unwrap();
        assert!(!is_worker_alive(dir.path()));
    }
}
