//! A harness that runs an arbitrary agent CLI as a one-shot subprocess.
//!
//! Command-line shape is configurable per harness instance (different agent
//! CLIs take different flags), but the invocation contract is fixed: spawn
//! with `invocation.worker_dir` as the working directory, `WIGGUM_STEP_ID` /
//! `WIGGUM_STEP_READONLY` / `WIGGUM_TASK_ID` in the environment, wait up to
//! `invocation.max_wall_time`, then read back `invocation.result_path`.

use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::time::timeout;

use crate::gate::{read_result_file, StepResult};

use super::trait_def::{Harness, Invocation};

/// A harness backed by a single agent binary invoked with a fixed argument
/// template. `{prd}` in `args_template` is substituted with the path to the
/// worker's `prd.md`.
pub struct SubprocessHarness {
    name: String,
    binary_path: String,
    args_template: Vec<String>,
    shutdown_grace: Duration,
}

impl SubprocessHarness {
    pub fn new(name: impl Into<String>, binary_path: impl Into<String>, args_template: Vec<String>) -> Self {
        Self {
            name: name.into(),
            binary_path: binary_path.into(),
            args_template,
            shutdown_grace: Duration::from_secs(10),
        }
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    fn build_args(&self, invocation: &Invocation) -> Vec<String> {
        let prd = invocation.worker_dir.join("prd.md");
        self.args_template
            .iter()
            .map(|arg| arg.replace("{prd}", &prd.display().to_string()))
            .collect()
    }
}

#[async_trait]
impl Harness for SubprocessHarness {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run_step(&self, invocation: &Invocation) -> Result<StepResult> {
        let mut command = Command::new(&self.binary_path);
        command
            .args(self.build_args(invocation))
            .current_dir(&invocation.worker_dir)
            .env("WIGGUM_STEP_ID", &invocation.step_id)
            .env("WIGGUM_STEP_READONLY", invocation.readonly.to_string())
            .env("WIGGUM_TASK_ID", &invocation.task_id)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command
            .spawn()
            .with_context(|| format!("failed to spawn harness {:?}", self.name))?;

        let timed_out = match timeout(invocation.max_wall_time, child.wait()).await {
            Ok(status) => {
                status.with_context(|| format!("failed to wait on harness {:?}", self.name))?;
                false
            }
            Err(_) => {
                kill_with_grace(&mut child, self.shutdown_grace).await;
                true
            }
        };

        if timed_out {
            let mut result = StepResult::missing_output();
            result.errors = vec!["step exceeded max wall time".to_string()];
            return Ok(result);
        }

        if invocation.result_path.exists() {
            Ok(read_result_file(&invocation.result_path)?)
        } else {
            Ok(StepResult::missing_output())
        }
    }
}

/// Send `SIGTERM`, wait up to `grace`, then `SIGKILL` if the process is
/// still alive. Mirrors the termination sequence the scheduler uses for a
/// global shutdown (§5).
async fn kill_with_grace(child: &mut Child, grace: Duration) {
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }

    if timeout(grace, child.wait()).await.is_err() {
        let _ = child.kill().await;
        let _ = child.wait().await;
    }
}
