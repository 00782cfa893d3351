//! Shared fixtures for wiggum integration tests.
//!
//! Every fixture here is filesystem-only: a temp git repository, a temp
//! board file in the markdown grammar `wiggum_fs::board` parses, and a
//! scripted in-process [`Harness`] double. There is no shared external
//! service to start, unlike a container-backed fixture — each test gets
//! its own `TempDir` and tears it down on drop.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use tempfile::TempDir;

use wiggum_core::gate::{GateResult, StepResult};
use wiggum_core::harness::{Harness, Invocation};
use wiggum_core::worktree::WorktreeManager;

/// A temporary git repository with one commit, ready to back a
/// [`WorktreeManager`].
pub struct TempRepo {
    _dir: TempDir,
    pub path: PathBuf,
}

impl TempRepo {
    /// Initialize a repo at a fresh temp dir, with `user.email`/`user.name`
    /// set and a single commit on the default branch.
    pub fn new() -> Self {
        let dir = TempDir::new().expect("failed to create temp dir for repo fixture");
        let path = dir.path().to_path_buf();
        for args in [
            vec!["init"],
            vec!["config", "user.email", "test@wiggum.dev"],
            vec!["config", "user.name", "Wiggum Test"],
        ] {
            run_git(&path, &args);
        }
        std::fs::write(path.join("README.md"), "# fixture repo\n").unwrap();
        run_git(&path, &["add", "."]);
        run_git(&path, &["commit", "-m", "init"]);
        Self { _dir: dir, path }
    }

    pub fn worktree_manager(&self) -> WorktreeManager {
        WorktreeManager::new(&self.path).expect("fixture repo should open as a WorktreeManager")
    }

    pub fn head(&self) -> String {
        self.worktree_manager().resolve_revision("HEAD").unwrap()
    }
}

impl Default for TempRepo {
    fn default() -> Self {
        Self::new()
    }
}

fn run_git(repo: &Path, args: &[&str]) {
    let output = Command::new("git")
        .args(args)
        .current_dir(repo)
        .output()
        .unwrap_or_else(|e| panic!("failed to run git {args:?}: {e}"));
    assert!(output.status.success(), "git {args:?} failed: {}", String::from_utf8_lossy(&output.stderr));
}

/// A temporary board file, written from a raw markdown body you supply.
pub struct TempBoard {
    _dir: TempDir,
    pub path: PathBuf,
}

impl TempBoard {
    pub fn with_markdown(markdown: &str) -> Self {
        let dir = TempDir::new().expect("failed to create temp dir for board fixture");
        let path = dir.path().join("board.md");
        std::fs::write(&path, markdown).unwrap();
        Self { _dir: dir, path }
    }

    /// A single pending, dependency-free task, useful when a test only
    /// cares about one task draining to `Done`.
    pub fn single_task(id: &str, description: &str) -> Self {
        Self::with_markdown(&format!(
            "# Board\n\n## TASKS\n\n- [ ] [{id}]\n  Description: {description}\n  Priority: MEDIUM\n  Dependencies: none\n  Scope:\n    - src/\n  Acceptance Criteria:\n    - compiles\n"
        ))
    }
}

/// A pre-scripted verdict for one step, played back in invocation order
/// (the last entry repeats once exhausted).
#[derive(Clone)]
pub struct ScriptedStep {
    pub gate_result: GateResult,
    pub errors: Vec<String>,
}

impl ScriptedStep {
    pub fn pass() -> Self {
        Self {
            gate_result: GateResult::Pass,
            errors: Vec::new(),
        }
    }

    pub fn fail(reason: &str) -> Self {
        Self {
            gate_result: GateResult::Fail,
            errors: vec![reason.to_string()],
        }
    }

    pub fn fix(reason: &str) -> Self {
        Self {
            gate_result: GateResult::Fix,
            errors: vec![reason.to_string()],
        }
    }
}

/// A [`Harness`] double that returns scripted [`StepResult`]s instead of
/// spawning a real sub-agent process, and records every invocation it saw.
///
/// By default every step passes. Override individual steps with
/// [`ScriptedHarness::script`] to exercise fix/fail/skip paths.
pub struct ScriptedHarness {
    name: String,
    scripts: Mutex<HashMap<String, Vec<ScriptedStep>>>,
    calls: Mutex<Vec<Invocation>>,
}

impl ScriptedHarness {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            scripts: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Queue a sequence of verdicts for `step_id`. Each call to
    /// [`Harness::run_step`] for that step consumes the next entry; once
    /// the queue is drained, the last entry repeats.
    pub fn script(self, step_id: &str, steps: Vec<ScriptedStep>) -> Self {
        self.scripts.lock().unwrap().insert(step_id.to_string(), steps);
        self
    }

    pub fn invocation_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Harness for ScriptedHarness {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run_step(&self, invocation: &Invocation) -> Result<StepResult> {
        self.calls.lock().unwrap().push(invocation.clone());

        let scripted = {
            let mut scripts = self.scripts.lock().unwrap();
            match scripts.get_mut(&invocation.step_id) {
                Some(queue) if queue.len() > 1 => Some(queue.remove(0)),
                Some(queue) => queue.first().cloned(),
                None => None,
            }
        };
        let step = scripted.unwrap_or_else(ScriptedStep::pass);

        let result = StepResult {
            gate_result: step.gate_result,
            outputs: serde_json::Value::Null,
            errors: step.errors,
        };
        std::fs::write(&invocation.result_path, serde_json::to_vec(&result)?)?;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temp_repo_has_a_resolvable_head() {
        let repo = TempRepo::new();
        assert!(!repo.head().is_empty());
    }

    #[test]
    fn temp_board_single_task_parses() {
        let board = TempBoard::single_task("AUTH-1", "implement login");
        let parsed = wiggum_fs::Board::load(&board.path).unwrap();
        assert_eq!(parsed.tasks().len(), 1);
        assert_eq!(parsed.tasks()[0].id, "AUTH-1");
    }

    #[tokio::test]
    async fn scripted_harness_replays_queued_verdicts() {
        let harness = ScriptedHarness::new("agent").script(
            "build",
            vec![ScriptedStep::fix("flaky"), ScriptedStep::pass()],
        );
        let dir = TempDir::new().unwrap();
        let invocation = Invocation {
            worker_dir: dir.path().to_path_buf(),
            project_dir: dir.path().to_path_buf(),
            result_path: dir.path().join("result.json"),
            step_id: "build".to_string(),
            task_id: "AUTH-1".to_string(),
            readonly: false,
            max_wall_time: std::time::Duration::from_secs(60),
            max_turns: None,
        };

        let first = harness.run_step(&invocation).await.unwrap();
        assert_eq!(first.gate_result, GateResult::Fix);
        let second = harness.run_step(&invocation).await.unwrap();
        assert_eq!(second.gate_result, GateResult::Pass);
        assert_eq!(harness.invocation_count(), 2);
    }
}
