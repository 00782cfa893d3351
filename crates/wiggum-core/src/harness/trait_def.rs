//! The `Harness` trait — the adapter interface for sub-agent invocations.
//!
//! Each concrete harness (Claude Code, Codex CLI, etc.) implements this
//! trait. The trait is intentionally object-safe so it can be stored as
//! `Box<dyn Harness>` in the [`super::HarnessRegistry`].

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use crate::gate::StepResult;

/// Everything a harness needs to invoke an agent for one pipeline step.
///
/// The harness's only contract obligation is: run the agent against
/// `worker_dir`/`project_dir` with the given environment, then either the
/// agent writes `result_path` itself or the harness classifies a missing
/// file as [`crate::gate::StepResult::missing_output`].
#[derive(Debug, Clone)]
pub struct Invocation {
    pub worker_dir: PathBuf,
    pub project_dir: PathBuf,
    pub result_path: PathBuf,
    pub step_id: String,
    pub task_id: String,
    pub readonly: bool,
    pub max_wall_time: Duration,
    pub max_turns: Option<u32>,
}

/// Adapter interface for running one sub-agent invocation to completion.
///
/// Unlike a long-lived streaming session, this contract is one-shot: spawn
/// the agent process, wait for it to exit (or time out), then read back its
/// result file. There is no mid-run messaging.
///
/// # Object Safety
///
/// Every method returns a concrete or boxed-future type, so `Box<dyn
/// Harness>` can be stored in collections such as [`super::HarnessRegistry`].
#[async_trait]
pub trait Harness: Send + Sync {
    /// Human-readable name for this harness (e.g. "claude-code").
    fn name(&self) -> &str;

    /// Run the agent against `invocation` to completion, returning the
    /// parsed step result. Implementations must enforce
    /// `invocation.max_wall_time` themselves and kill the process
    /// (TERM, then KILL after a grace period) on timeout.
    async fn run_step(&self, invocation: &Invocation) -> Result<StepResult>;
}

const _: () = {
    fn _assert_object_safe(_: &dyn Harness) {}
};
