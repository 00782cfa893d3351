//! The scheduler: the long-running tick loop that reads the board, scores
//! and spawns ready tasks as workers, reaps exited workers, and drives
//! follow-up (fix/resolve) workers until the board is drained.

pub mod score;

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use wiggum_fs::{ActivityLog, AgingTracker, BatchStore, Board, Pool, SkipTracker, TaskMarker, WorkerKind};

use crate::batch;
use crate::error::{ConfigurationError, WiggumError};
use crate::harness::HarnessRegistry;
use crate::lifecycle::{self, WorkerContext, WorkerOutcome};
use crate::pipeline::Pipeline;
use crate::worktree::WorktreeManager;

use score::ScoreWeights;

/// Resolved runtime configuration for one scheduler run. See
/// `WiggumConfig::resolve` in [`crate::config`] for how this is assembled
/// from CLI flags, environment, and project config.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub max_workers: usize,
    pub weights: ScoreWeights,
    pub tick_interval: Duration,
    pub violation_interval: Duration,
    pub max_fix_retries: u32,
    pub max_resolve_retries: u32,
    /// Whether a successfully merged worker's branch should be merged into
    /// the current base automatically once its pull request is open, or
    /// left for a human to merge. A conflict here spawns a resolve worker.
    pub auto_merge: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            weights: ScoreWeights::default(),
            tick_interval: Duration::from_secs(2),
            violation_interval: Duration::from_secs(5),
            max_fix_retries: 2,
            max_resolve_retries: 2,
            auto_merge: false,
        }
    }
}

/// What happened when one tick's reap/spawn pass ran, surfaced mainly for
/// the `status` CLI command and tests.
#[derive(Debug, Default)]
pub struct TickReport {
    pub reaped: Vec<String>,
    pub spawned: Vec<String>,
    pub scheduling_event: bool,
}

struct RunningWorker {
    handle: JoinHandle<WorkerFinished>,
    kind: WorkerKind,
}

struct WorkerFinished {
    task_id: String,
    ctx_dir: PathBuf,
    outcome: Result<WorkerOutcome>,
    needs_resolve: bool,
}

/// The scheduler's process-lifetime state. One instance drives one project
/// to completion.
pub struct Scheduler {
    project_dir: PathBuf,
    workers_root: PathBuf,
    board_path: PathBuf,
    pipeline: Arc<Pipeline>,
    registry: Arc<HarnessRegistry>,
    worktree: WorktreeManager,
    pool: Pool,
    aging: AgingTracker,
    skip: SkipTracker,
    batches: BatchStore,
    activity: Arc<ActivityLog>,
    config: SchedulerConfig,
    cyclic: HashSet<String>,
    fix_attempts: HashMap<String, u32>,
    resolve_attempts: HashMap<String, u32>,
    active: HashMap<String, RunningWorker>,
}

impl Scheduler {
    pub fn new(
        project_dir: PathBuf,
        workers_root: PathBuf,
        board_path: PathBuf,
        pipeline: Pipeline,
        registry: HarnessRegistry,
        worktree: WorktreeManager,
        config: SchedulerConfig,
    ) -> Self {
        let aging = AgingTracker::new(&workers_root);
        let skip = SkipTracker::new(&workers_root);
        let batches = BatchStore::new(&workers_root);
        let activity = ActivityLog::new(&project_dir);
        Self {
            project_dir,
            workers_root,
            board_path,
            pipeline: Arc::new(pipeline),
            registry: Arc::new(registry),
            worktree,
            pool: Pool::new(),
            aging,
            skip,
            batches,
            activity: Arc::new(activity),
            config,
            cyclic: HashSet::new(),
            fix_attempts: HashMap::new(),
            resolve_attempts: HashMap::new(),
            active: HashMap::new(),
        }
    }

    /// Scan the workers directory for live PIDs not already known to the
    /// pool, adopting them. Run once before the first tick of a run.
    pub fn reconcile_orphans(&self) -> Result<usize> {
        let restored = self
            .pool
            .restore_from_disk(&self.workers_root)
            .context("failed to reconcile orphaned workers")?;
        for entry in self.pool.snapshot() {
            tracing::warn!(
                task_id = %entry.task_id,
                pid = entry.pid,
                kind = ?entry.kind,
                dir = %entry.dir.display(),
                "adopted orphaned worker directory from a previous run"
            );
        }
        Ok(restored)
    }

    /// Snapshot of currently-running workers, for the `status` command.
    pub fn active_workers(&self) -> Vec<(String, WorkerKind)> {
        self.active.iter().map(|(id, w)| (id.clone(), w.kind)).collect()
    }

    /// Drive ticks until the board is drained (pending empty and no active
    /// workers), sleeping `tick_interval` between iterations when idle.
    pub async fn run(&mut self) -> Result<()> {
        let shutdown = CancellationToken::new();
        self.run_until_shutdown(shutdown, Duration::from_secs(10)).await
    }

    /// Drive ticks until the board is drained or `shutdown` fires. On
    /// shutdown, stop spawning new work and wait up to `grace` for active
    /// workers to finish on their own (the harness subprocess already
    /// enforces its own step timeout); anything still running after the
    /// grace period is hard-aborted, mirroring a TERM-then-KILL sequence
    /// against a pool of OS processes.
    pub async fn run_until_shutdown(&mut self, shutdown: CancellationToken, grace: Duration) -> Result<()> {
        self.reconcile_orphans()?;

        loop {
            let board = Board::load(&self.board_path).context("failed to load task board")?;
            if self.cyclic.is_empty() {
                let cycles = board.detect_cycles();
                for cycle in &cycles {
                    let err = WiggumError::Configuration(ConfigurationError::CyclicDependency(cycle.clone()));
                    tracing::warn!(tasks = ?cycle, "{err}");
                    self.activity
                        .append(
                            "board.cyclic_dependency",
                            None,
                            serde_json::json!({ "tasks": cycle }),
                        )
                        .ok();
                }
                self.cyclic = cycles.into_iter().flatten().collect();
            }

            if shutdown.is_cancelled() {
                break;
            }

            let report = self.tick(&board).await?;

            if board.list(Some(TaskMarker::Pending)).is_empty()
                && board.list(Some(TaskMarker::InProgress)).is_empty()
                && self.active.is_empty()
            {
                break;
            }

            if !report.scheduling_event {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.tick_interval) => {}
                    _ = shutdown.cancelled() => break,
                }
            }
        }

        if shutdown.is_cancelled() && !self.active.is_empty() {
            self.shutdown_active_workers(grace).await;
        }

        Ok(())
    }

    /// Wait up to `grace` for every active worker to finish, then abort any
    /// stragglers. Called once, after the shutdown signal has already
    /// stopped the scheduler from spawning new work.
    async fn shutdown_active_workers(&mut self, grace: Duration) {
        let deadline = tokio::time::Instant::now() + grace;
        while !self.active.is_empty() && tokio::time::Instant::now() < deadline {
            let finished: Vec<String> = self
                .active
                .iter()
                .filter(|(_, w)| w.handle.is_finished())
                .map(|(id, _)| id.clone())
                .collect();
            for task_id in finished {
                if let Some(worker) = self.active.remove(&task_id) {
                    let _ = worker.handle.await;
                }
            }
            if !self.active.is_empty() {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }

        for (task_id, worker) in self.active.drain() {
            tracing::warn!(task_id = %task_id, "aborting worker past shutdown grace period");
            worker.handle.abort();
        }
    }

    /// One scheduler tick: reap, refresh, score, spawn, follow-up, age.
    pub async fn tick(&mut self, board: &Board) -> Result<TickReport> {
        let mut report = TickReport::default();

        self.reap(board, &mut report).await?;
        self.skip.decay_all().ok();

        let board = Board::load(&self.board_path).context("failed to reload board after reap")?;
        batch::ensure_batches(&self.batches, &board);
        let ready = board.ready();

        let candidates: Vec<_> = ready
            .iter()
            .filter(|t| !self.cyclic.contains(&t.id))
            .copied()
            .collect();
        let ranked = score::rank(&candidates, &board, &self.aging, &self.project_dir, self.config.weights);

        for task in ranked {
            if self.live_worker_count() >= self.config.max_workers {
                break;
            }
            if self.skip.is_backing_off(&task.id) {
                continue;
            }
            if self.has_claim_conflict(&task.id, &board) {
                continue;
            }
            if !batch::may_run(&self.batches, &task.id) {
                continue;
            }

            self.aging.clear(&task.id).ok();
            self.apply_status(&task.id, TaskMarker::InProgress)?;
            self.spawn_worker(&task.id, WorkerKind::Main, None, &board).await?;
            report.spawned.push(task.id.clone());
            report.scheduling_event = true;
        }

        if report.scheduling_event {
            for task in board.ready() {
                if !report.spawned.contains(&task.id) {
                    self.aging.bump(&task.id).ok();
                }
            }
        }

        Ok(report)
    }

    /// Workers counted against `max_workers`: in-process tokio tasks plus
    /// any orphans adopted from a previous crashed run whose owning process
    /// is still alive.
    fn live_worker_count(&self) -> usize {
        self.active.len() + self.pool.count()
    }

    /// Conservative file-claim overlap check: a task's scope bullets (and
    /// any plan-document paths, once plan parsing is wired in) are treated
    /// as path-prefix claims; reject if any live worker's task shares a
    /// claim prefix.
    fn has_claim_conflict(&self, task_id: &str, board: &Board) -> bool {
        let Some(task) = board.get(task_id) else {
            return false;
        };
        let claims = predicted_claims(task);
        if claims.is_empty() {
            return false;
        }

        for active_id in self.active.keys() {
            let Some(active_task) = board.get(active_id) else {
                continue;
            };
            let active_claims = predicted_claims(active_task);
            if claims.iter().any(|c| active_claims.iter().any(|a| paths_overlap(c, a))) {
                return true;
            }
        }
        false
    }

    async fn spawn_worker(
        &mut self,
        task_id: &str,
        kind: WorkerKind,
        suffix: Option<&str>,
        board: &Board,
    ) -> Result<()> {
        let task = board
            .get(task_id)
            .with_context(|| format!("task {task_id} disappeared from board before spawn"))?;

        let base_revision = self.worktree.resolve_revision("HEAD")?;
        let prd = render_prd(task);

        let ctx = lifecycle::create(
            &self.workers_root,
            &self.worktree,
            task_id,
            kind,
            suffix,
            &base_revision,
            &prd,
        )?;

        if let Some(record) = batch::context_for(&self.batches, task_id) {
            if let Ok(bytes) = serde_json::to_vec_pretty(&record) {
                let _ = std::fs::write(ctx.dir.join("batch-context.json"), bytes);
            }
        }

        self.activity
            .append("worker.spawned", Some(task_id), serde_json::json!({ "kind": format!("{kind:?}") }))
            .ok();

        let worktree = self.worktree.clone();
        let registry = Arc::clone(&self.registry);
        let activity = Arc::clone(&self.activity);
        let pipeline = Arc::clone(&self.pipeline);
        let project_dir = self.project_dir.clone();
        let violation_interval = self.config.violation_interval;
        let auto_merge = self.config.auto_merge;
        let owned_ctx = WorkerContext {
            dir: ctx.dir.clone(),
            workspace: ctx.workspace.clone(),
            task_id: ctx.task_id.clone(),
            kind: ctx.kind,
            branch: ctx.branch.clone(),
        };

        let handle = tokio::spawn(async move {
            let run_result = lifecycle::run(
                &owned_ctx,
                &worktree,
                &registry,
                &activity,
                &pipeline,
                &project_dir,
                violation_interval,
            )
            .await;

            let outcome = match run_result {
                Ok((pipeline_outcome, step_results)) => {
                    lifecycle::exit_and_reap(&owned_ctx, &worktree, &pipeline_outcome, &step_results, auto_merge)
                }
                Err(e) => Err(e),
            };

            let needs_resolve = std::fs::read(owned_ctx.dir.join("git-state.json"))
                .ok()
                .and_then(|bytes| serde_json::from_slice::<lifecycle::GitState>(&bytes).ok())
                .is_some_and(|state| state.needs_resolve);

            WorkerFinished {
                task_id: owned_ctx.task_id.clone(),
                ctx_dir: owned_ctx.dir.clone(),
                outcome,
                needs_resolve,
            }
        });

        self.active.insert(task_id.to_string(), RunningWorker { handle, kind });

        Ok(())
    }

    /// Poll active workers for completion without blocking the tick;
    /// apply board updates and follow-up spawns for any that finished.
    async fn reap(&mut self, board: &Board, report: &mut TickReport) -> Result<()> {
        let finished_tasks: Vec<String> = self
            .active
            .iter()
            .filter(|(_, w)| w.handle.is_finished())
            .map(|(id, _)| id.clone())
            .collect();

        for task_id in finished_tasks {
            let worker = self.active.remove(&task_id).expect("just filtered as present");
            let finished = match worker.handle.await {
                Ok(f) => f,
                Err(join_err) => {
                    tracing::warn!(task_id = %task_id, error = %join_err, "worker task panicked");
                    self.skip.record_failure(&task_id).ok();
                    continue;
                }
            };

            self.activity
                .append("worker.reaped", Some(&task_id), serde_json::json!({ "dir": finished.ctx_dir.to_string_lossy() }))
                .ok();

            match finished.outcome {
                Ok(WorkerOutcome::Success) => {
                    self.apply_status(&task_id, TaskMarker::Done)?;
                    batch::advance(&self.batches, &task_id);
                    if finished.needs_resolve {
                        let attempts = self.resolve_attempts.entry(task_id.clone()).or_insert(0);
                        if *attempts < self.config.max_resolve_retries {
                            *attempts += 1;
                            self.apply_status(&task_id, TaskMarker::InProgress)?;
                            self.spawn_worker(&task_id, WorkerKind::Resolve, Some("resolve"), board).await?;
                            report.scheduling_event = true;
                        } else {
                            tracing::warn!(task_id = %task_id, "merge conflict unresolved after retry budget, leaving PR open for manual resolution");
                        }
                    }
                }
                Ok(WorkerOutcome::Failed) => {
                    self.apply_status(&task_id, TaskMarker::Failed)?;
                    batch::fail(&self.batches, &task_id);
                }
                Ok(WorkerOutcome::NeedsFix) => {
                    self.apply_status(&task_id, TaskMarker::Failed)?;
                    let attempts = self.fix_attempts.entry(task_id.clone()).or_insert(0);
                    if *attempts < self.config.max_fix_retries {
                        *attempts += 1;
                        self.apply_status(&task_id, TaskMarker::InProgress)?;
                        self.spawn_worker(&task_id, WorkerKind::Fix, Some("fix"), board).await?;
                        report.scheduling_event = true;
                    } else {
                        batch::fail(&self.batches, &task_id);
                    }
                }
                Err(e) => {
                    tracing::warn!(task_id = %task_id, error = %e, "worker lifecycle failed");
                    self.skip.record_failure(&task_id).ok();
                    batch::fail(&self.batches, &task_id);
                }
            }

            report.reaped.push(task_id);
            report.scheduling_event = true;
        }

        for orphan in self.pool.reap_dead() {
            tracing::warn!(
                task_id = %orphan.task_id,
                dir = %orphan.dir.display(),
                "orphaned worker's owning process has exited; marking failed"
            );
            self.apply_status(&orphan.task_id, TaskMarker::Failed)?;
            batch::fail(&self.batches, &orphan.task_id);
            self.activity
                .append(
                    "worker.orphan_reaped",
                    Some(&orphan.task_id),
                    serde_json::json!({ "dir": orphan.dir.to_string_lossy(), "kind": format!("{:?}", orphan.kind) }),
                )
                .ok();
            report.reaped.push(orphan.task_id);
            report.scheduling_event = true;
        }

        Ok(())
    }

    fn apply_status(&self, task_id: &str, marker: TaskMarker) -> Result<()> {
        let mut board = Board::load(&self.board_path)?;
        match board.set_status(&self.board_path, task_id, marker) {
            Ok(()) => Ok(()),
            Err(wiggum_fs::BoardError::ConcurrentEdit) => {
                self.skip.record_failure(task_id).ok();
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn render_prd(task: &wiggum_fs::Task) -> String {
    let mut out = format!("# {}\n\n{}\n", task.id, task.description);
    if !task.scope.is_empty() {
        out.push_str("\n## Scope\n");
        for s in &task.scope {
            out.push_str(&format!("- {s}\n"));
        }
    }
    if !task.acceptance_criteria.is_empty() {
        out.push_str("\n## Acceptance Criteria\n");
        for a in &task.acceptance_criteria {
            out.push_str(&format!("- {a}\n"));
        }
    }
    out
}

fn predicted_claims(task: &wiggum_fs::Task) -> Vec<String> {
    task.scope.clone()
}

fn paths_overlap(a: &str, b: &str) -> bool {
    a.starts_with(b) || b.starts_with(a)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;
    use tempfile::TempDir;

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

    #[test]
    fn claim_conflict_detects_shared_prefix() {
        assert!(paths_overlap("src/auth/", "src/auth/login.rs"));
        assert!(!paths_overlap("src/auth/", "src/billing/"));
    }

    #[tokio::test]
    async fn drains_a_single_ready_task_to_done() {
        use crate::gate::{GateResult, StepResult};
        use crate::harness::{Harness, Invocation};
        use async_trait::async_trait;

        struct PassHarness;
        #[async_trait]
        impl Harness for PassHarness {
            fn name(&self) -> &str {
                "agent"
            }
            async fn run_step(&self, invocation: &Invocation) -> Result<StepResult> {
                let result = StepResult {
                    gate_result: GateResult::Pass,
                    outputs: serde_json::json!({}),
                    errors: Vec::new(),
                };
                std::fs::write(&invocation.result_path, serde_json::to_vec(&result)?)?;
                Ok(result)
            }
        }

        let (_repo_dir, repo_path) = create_temp_repo();
        let workers_root = repo_path.join(".ralph").join("workers");
        std::fs::create_dir_all(&workers_root).unwrap();
        let board_path = repo_path.join("board.md");
        std::fs::write(
            &board_path,
            "## TASKS\n- [ ] [AUTH-1]\n  Description: add login\n  Priority: high\n",
        )
        .unwrap();

        let mut registry = HarnessRegistry::new();
        registry.register(PassHarness);
        let pipeline = Pipeline::parse(r#"{ "name": "p", "steps": [ { "id": "build", "agent": "agent" } ] }"#).unwrap();
        let worktree = WorktreeManager::new(&repo_path).unwrap();

        let mut config = SchedulerConfig::default();
        config.tick_interval = Duration::from_millis(10);
        config.violation_interval = Duration::from_secs(3600);

        let mut scheduler = Scheduler::new(
            repo_path.clone(),
            workers_root,
            board_path.clone(),
            pipeline,
            registry,
            worktree,
            config,
        );

        scheduler.run().await.unwrap();

        let board = Board::load(&board_path).unwrap();
        assert_eq!(board.get("AUTH-1").unwrap().status, TaskMarker::Done);
    }
}
