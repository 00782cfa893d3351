//! The pipeline runner: drives one worker's directory through a pipeline's
//! steps in order, interpreting each step's gate result to decide whether to
//! continue, skip downstream steps, retry, or halt.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use serde_json::json;

use wiggum_fs::ActivityLog;

use crate::gate::GateResult;
use crate::harness::{HarnessRegistry, Invocation};

use super::schema::{Pipeline, Step};

const DEFAULT_MAX_WALL_TIME: Duration = Duration::from_secs(30 * 60);

/// A step's state machine position, exposed for tests and worker logging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepState {
    NotStarted,
    GatedOut,
    DepBlocked,
    Running,
    Completed(GateResult),
    Retrying,
}

/// The terminal outcome of a full pipeline run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    CompletedAll,
    HaltedBlocking { step_id: String },
    HaltedByAgent { step_id: String },
}

/// Drives a [`Pipeline`] against one worker's directory.
pub struct PipelineRunner<'a> {
    registry: &'a HarnessRegistry,
    activity: &'a ActivityLog,
}

impl<'a> PipelineRunner<'a> {
    pub fn new(registry: &'a HarnessRegistry, activity: &'a ActivityLog) -> Self {
        Self { registry, activity }
    }

    /// Run every step of `pipeline` in order, starting at `start_from_step`
    /// (or the first step if `None`). Returns the final outcome and the
    /// gate result recorded for each step that actually ran.
    pub async fn run_all(
        &self,
        pipeline: &Pipeline,
        worker_dir: &Path,
        project_dir: &Path,
        task_id: &str,
        start_from_step: Option<&str>,
    ) -> Result<(PipelineOutcome, HashMap<String, GateResult>)> {
        let mut results: HashMap<String, GateResult> = HashMap::new();
        let start_index = match start_from_step {
            Some(id) => pipeline.steps.iter().position(|s| s.id == id).unwrap_or(0),
            None => 0,
        };

        for step in &pipeline.steps[start_index..] {
            let state = self
                .run_step(pipeline, step, worker_dir, project_dir, task_id, &results)
                .await?;

            match state {
                StepState::GatedOut => {
                    results.insert(step.id.clone(), GateResult::Skip);
                    self.log(step, task_id, "step.skipped", json!({"reason": "enabled_by gate"}));
                }
                StepState::DepBlocked => {
                    results.insert(step.id.clone(), GateResult::Skip);
                    self.log(step, task_id, "step.skipped", json!({"reason": "dependency not PASS"}));
                }
                StepState::Completed(GateResult::Pass) => {
                    results.insert(step.id.clone(), GateResult::Pass);
                    self.log(step, task_id, "step.completed", json!({}));
                }
                StepState::Completed(GateResult::Skip) => {
                    results.insert(step.id.clone(), GateResult::Skip);
                    self.log(step, task_id, "step.skipped", json!({}));
                }
                StepState::Completed(GateResult::Fail) => {
                    results.insert(step.id.clone(), GateResult::Fail);
                    if step.blocking {
                        self.log(step, task_id, "pipeline.halted", json!({}));
                        return Ok((PipelineOutcome::HaltedBlocking { step_id: step.id.clone() }, results));
                    }
                    self.log(step, task_id, "step.failed_soft", json!({}));
                }
                StepState::Completed(GateResult::Stop) => {
                    results.insert(step.id.clone(), GateResult::Stop);
                    self.log(step, task_id, "pipeline.halted_by_agent", json!({}));
                    return Ok((PipelineOutcome::HaltedByAgent { step_id: step.id.clone() }, results));
                }
                StepState::Completed(GateResult::Fix) | StepState::Retrying | StepState::Running | StepState::NotStarted => {
                    // run_step never returns these for a finished step; FIX
                    // is resolved internally into a terminal PASS/FAIL above.
                    unreachable!("run_step must resolve FIX before returning")
                }
            }
        }

        Ok((PipelineOutcome::CompletedAll, results))
    }

    async fn run_step(
        &self,
        pipeline: &Pipeline,
        step: &Step,
        worker_dir: &Path,
        project_dir: &Path,
        task_id: &str,
        prior_results: &HashMap<String, GateResult>,
    ) -> Result<StepState> {
        // 1. Gate check.
        if let Some(var) = &step.enabled_by {
            if std::env::var(var).as_deref() != Ok("true") {
                return Ok(StepState::GatedOut);
            }
        }

        // 2. Dependency check.
        if let Some(dep) = &step.depends_on {
            if prior_results.get(dep) != Some(&GateResult::Pass) {
                return Ok(StepState::DepBlocked);
            }
        }

        let mut attempts_left = step.retry.as_ref().map(|r| r.max).unwrap_or(0);
        let mut agent_name = step.agent.clone();

        loop {
            // 3. Prepare.
            let step_config_path = worker_dir.join("step-config.json");
            std::fs::write(&step_config_path, serde_json::to_vec_pretty(&step.config)?)
                .with_context(|| format!("failed to write step-config.json for step {:?}", step.id))?;

            let epoch = epoch_secs();
            let log_dir = worker_dir.join("logs").join(format!("{}-{epoch}", step.id));
            std::fs::create_dir_all(&log_dir)
                .with_context(|| format!("failed to create log dir for step {:?}", step.id))?;
            let results_dir = worker_dir.join("results");
            std::fs::create_dir_all(&results_dir)?;
            let result_path = results_dir.join(format!("{}-{epoch}.json", step.id));

            self.log(step, task_id, "step.started", json!({"agent": agent_name}));

            // 4. Invoke.
            let harness = self
                .registry
                .get(&agent_name)
                .with_context(|| format!("no harness registered for agent {agent_name:?}"))?;

            let invocation = Invocation {
                worker_dir: worker_dir.to_path_buf(),
                project_dir: project_dir.to_path_buf(),
                result_path: result_path.clone(),
                step_id: step.id.clone(),
                task_id: task_id.to_string(),
                readonly: step.readonly,
                max_wall_time: DEFAULT_MAX_WALL_TIME,
                max_turns: None,
            };

            let step_result = harness.run_step(&invocation).await?;

            // 5. Commit.
            if !step.readonly {
                commit_if_dirty(&worker_dir.join("workspace"), &step.id)?;
            }

            // 6. Classify result.
            if step_result.gate_result == GateResult::Fix && attempts_left > 0 {
                if let Some(retry) = &step.retry {
                    attempts_left -= 1;
                    agent_name = retry.fix_agent.clone();
                    self.log(step, task_id, "step.retrying", json!({"attempts_left": attempts_left}));
                    continue;
                }
            }

            if step_result.gate_result == GateResult::Fix {
                // Retry budget exhausted: treat per `blocking`.
                let resolved = if step.blocking { GateResult::Fail } else { GateResult::Skip };
                let _ = pipeline;
                return Ok(StepState::Completed(resolved));
            }

            return Ok(StepState::Completed(step_result.gate_result));
        }
    }

    fn log(&self, step: &Step, task_id: &str, event: &str, mut fields: serde_json::Value) {
        if let Some(obj) = fields.as_object_mut() {
            obj.insert("step_id".to_string(), json!(step.id));
        }
        let _ = self.activity.append(event, Some(task_id), fields);
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

/// Commit any uncommitted changes in `workspace` with a conventional
/// message naming the step, per the pipeline runner's commit phase.
fn commit_if_dirty(workspace: &Path, step_id: &str) -> Result<()> {
    if !workspace.exists() {
        return Ok(());
    }
    let status = run_git(workspace, &["status", "--porcelain"])?;
    if status.trim().is_empty() {
        return Ok(());
    }
    run_git(workspace, &["add", "-A"])?;
    run_git(workspace, &["commit", "-m", &format!("wiggum: step {step_id}")])?;
    Ok(())
}

fn run_git(dir: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .with_context(|| format!("failed to run git {args:?}"))?;
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn path_is_stale(path: &Path, reference: &Path) -> bool {
    let Ok(path_meta) = std::fs::metadata(path) else {
        return true;
    };
    let Ok(reference_meta) = std::fs::metadata(reference) else {
        return false;
    };
    match (path_meta.modified(), reference_meta.modified()) {
        (Ok(a), Ok(b)) => a < b,
        _ => false,
    }
}

/// Resolve which step a resumed run should start from: the earliest step
/// whose most recent result file is missing, or older than the pipeline
/// definition file itself.
pub fn resolve_resume_step(pipeline: &Pipeline, worker_dir: &Path, pipeline_file: &Path) -> Option<String> {
    let results_dir = worker_dir.join("results");
    for step in &pipeline.steps {
        let has_result = std::fs::read_dir(&results_dir)
            .ok()
            .into_iter()
            .flatten()
            .filter_map(|e| e.ok())
            .any(|e| e.file_name().to_string_lossy().starts_with(&format!("{}-", step.id)));

        if !has_result {
            return Some(step.id.clone());
        }
        let result_path: Option<PathBuf> = std::fs::read_dir(&results_dir)
            .ok()
            .into_iter()
            .flatten()
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .find(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with(&format!("{}-", step.id)))
            });
        if let Some(path) = result_path {
            if path_is_stale(&path, pipeline_file) {
                return Some(step.id.clone());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::StepResult;
    use crate::harness::Harness;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    struct ScriptedHarness {
        name: String,
        results: Vec<GateResult>,
        call_count: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Harness for ScriptedHarness {
        fn name(&self) -> &str {
            &self.name
        }

        async fn run_step(&self, invocation: &Invocation) -> Result<StepResult> {
            let idx = self.call_count.fetch_add(1, Ordering::SeqCst);
            let gate_result = self.results.get(idx).copied().unwrap_or(GateResult::Pass);
            let result = StepResult {
                gate_result,
                outputs: json!({}),
                errors: Vec::new(),
            };
            std::fs::write(&invocation.result_path, serde_json::to_vec(&result)?)?;
            Ok(result)
        }
    }

    fn setup_worker() -> (TempDir, PathBuf) {
        let dir = TempDir::new().unwrap();
        let worker_dir = dir.path().join("worker-AUTH-1-0");
        std::fs::create_dir_all(&worker_dir).unwrap();
        (dir, worker_dir)
    }

    #[tokio::test]
    async fn runs_all_steps_on_pass() {
        let (dir, worker_dir) = setup_worker();
        let activity = ActivityLog::new(dir.path());
        let mut registry = HarnessRegistry::new();
        registry.register(ScriptedHarness {
            name: "agent".into(),
            results: vec![GateResult::Pass, GateResult::Pass],
            call_count: Arc::new(AtomicUsize::new(0)),
        });

        let pipeline = Pipeline::parse(
            r#"{ "name": "p", "steps": [
                { "id": "build", "agent": "agent" },
                { "id": "validate", "agent": "agent", "depends_on": "build" }
            ] }"#,
        )
        .unwrap();

        let runner = PipelineRunner::new(&registry, &activity);
        let (outcome, results) = runner
            .run_all(&pipeline, &worker_dir, dir.path(), "AUTH-1", None)
            .await
            .unwrap();

        assert_eq!(outcome, PipelineOutcome::CompletedAll);
        assert_eq!(results.get("build"), Some(&GateResult::Pass));
        assert_eq!(results.get("validate"), Some(&GateResult::Pass));
    }

    #[tokio::test]
    async fn blocking_failure_halts_pipeline() {
        let (dir, worker_dir) = setup_worker();
        let activity = ActivityLog::new(dir.path());
        let mut registry = HarnessRegistry::new();
        registry.register(ScriptedHarness {
            name: "agent".into(),
            results: vec![GateResult::Fail],
            call_count: Arc::new(AtomicUsize::new(0)),
        });

        let pipeline = Pipeline::parse(
            r#"{ "name": "p", "steps": [
                { "id": "build", "agent": "agent" },
                { "id": "validate", "agent": "agent", "depends_on": "build" }
            ] }"#,
        )
        .unwrap();

        let runner = PipelineRunner::new(&registry, &activity);
        let (outcome, results) = runner
            .run_all(&pipeline, &worker_dir, dir.path(), "AUTH-1", None)
            .await
            .unwrap();

        assert_eq!(outcome, PipelineOutcome::HaltedBlocking { step_id: "build".into() });
        assert!(!results.contains_key("validate"));
    }

    #[tokio::test]
    async fn non_blocking_failure_skips_downstream_dependent() {
        let (dir, worker_dir) = setup_worker();
        let activity = ActivityLog::new(dir.path());
        let mut registry = HarnessRegistry::new();
        registry.register(ScriptedHarness {
            name: "agent".into(),
            results: vec![GateResult::Fail, GateResult::Pass],
            call_count: Arc::new(AtomicUsize::new(0)),
        });

        let pipeline = Pipeline::parse(
            r#"{ "name": "p", "steps": [
                { "id": "validate", "agent": "agent", "blocking": false },
                { "id": "docs", "agent": "agent", "depends_on": "validate" }
            ] }"#,
        )
        .unwrap();

        let runner = PipelineRunner::new(&registry, &activity);
        let (outcome, results) = runner
            .run_all(&pipeline, &worker_dir, dir.path(), "AUTH-1", None)
            .await
            .unwrap();

        assert_eq!(outcome, PipelineOutcome::CompletedAll);
        assert_eq!(results.get("validate"), Some(&GateResult::Fail));
        assert_eq!(results.get("docs"), Some(&GateResult::Skip));
    }

    #[tokio::test]
    async fn stop_halts_successfully() {
        let (dir, worker_dir) = setup_worker();
        let activity = ActivityLog::new(dir.path());
        let mut registry = HarnessRegistry::new();
        registry.register(ScriptedHarness {
            name: "agent".into(),
            results: vec![GateResult::Stop],
            call_count: Arc::new(AtomicUsize::new(0)),
        });

        let pipeline = Pipeline::parse(r#"{ "name": "p", "steps": [ { "id": "gate", "agent": "agent" } ] }"#).unwrap();

        let runner = PipelineRunner::new(&registry, &activity);
        let (outcome, _) = runner
            .run_all(&pipeline, &worker_dir, dir.path(), "AUTH-1", None)
            .await
            .unwrap();

        assert_eq!(outcome, PipelineOutcome::HaltedByAgent { step_id: "gate".into() });
    }

    #[tokio::test]
    async fn enabled_by_gate_skips_step() {
        let (dir, worker_dir) = setup_worker();
        let activity = ActivityLog::new(dir.path());
        let mut registry = HarnessRegistry::new();
        registry.register(ScriptedHarness {
            name: "agent".into(),
            results: vec![],
            call_count: Arc::new(AtomicUsize::new(0)),
        });

        let pipeline = Pipeline::parse(
            r#"{ "name": "p", "steps": [
                { "id": "optional", "agent": "agent", "enabled_by": "WIGGUM_TEST_UNSET_VAR_XYZ" }
            ] }"#,
        )
        .unwrap();

        let runner = PipelineRunner::new(&registry, &activity);
        let (outcome, results) = runner
            .run_all(&pipeline, &worker_dir, dir.path(), "AUTH-1", None)
            .await
            .unwrap();

        assert_eq!(outcome, PipelineOutcome::CompletedAll);
        assert_eq!(results.get("optional"), Some(&GateResult::Skip));
    }

    #[tokio::test]
    async fn fix_retries_then_resolves_to_pass() {
        let (dir, worker_dir) = setup_worker();
        let activity = ActivityLog::new(dir.path());
        let mut registry = HarnessRegistry::new();
        registry.register(ScriptedHarness {
            name: "agent".into(),
            results: vec![GateResult::Fix, GateResult::Pass],
            call_count: Arc::new(AtomicUsize::new(0)),
        });
        registry.register(ScriptedHarness {
            name: "fixer".into(),
            results: vec![GateResult::Pass],
            call_count: Arc::new(AtomicUsize::new(0)),
        });

        let pipeline = Pipeline::parse(
            r#"{ "name": "p", "steps": [
                { "id": "build", "agent": "agent", "retry": { "on": "FIX", "max": 1, "fix_agent": "fixer" } }
            ] }"#,
        )
        .unwrap();

        let runner = PipelineRunner::new(&registry, &activity);
        let (outcome, results) = runner
            .run_all(&pipeline, &worker_dir, dir.path(), "AUTH-1", None)
            .await
            .unwrap();

        assert_eq!(outcome, PipelineOutcome::CompletedAll);
        assert_eq!(results.get("build"), Some(&GateResult::Pass));
    }
}
