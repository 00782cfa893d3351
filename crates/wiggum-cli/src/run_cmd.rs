//! `wiggum run` command: resolve configuration, build the scheduler, and
//! drive it to completion (or until a shutdown signal arrives).

use std::path::Path;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use wiggum_core::harness::{HarnessRegistry, SubprocessHarness};
use wiggum_core::pipeline::Pipeline;
use wiggum_core::worktree::WorktreeManager;
use wiggum_core::{CliOverrides, ConfigurationError, Scheduler, WiggumConfig, WiggumError};
use wiggum_fs::{Board, TaskMarker};

/// Build a registry with one [`SubprocessHarness`] per distinct agent name
/// the pipeline's steps reference. Each harness's binary defaults to the
/// agent name itself (resolved on `$PATH`), overridable per-agent via
/// `WIGGUM_HARNESS_<NAME>` (name upper-cased, non-alphanumerics replaced
/// with `_`).
fn build_registry(pipeline: &Pipeline) -> HarnessRegistry {
    let mut registry = HarnessRegistry::new();
    let mut seen = std::collections::HashSet::new();

    let mut agent_names: Vec<&str> = pipeline.steps.iter().map(|s| s.agent.as_str()).collect();
    for step in &pipeline.steps {
        if let Some(retry) = &step.retry {
            agent_names.push(retry.fix_agent.as_str());
        }
    }

    for name in agent_names {
        if !seen.insert(name.to_string()) {
            continue;
        }
        let env_key = format!(
            "WIGGUM_HARNESS_{}",
            name.to_ascii_uppercase().replace(|c: char| !c.is_ascii_alphanumeric(), "_")
        );
        let binary = std::env::var(&env_key).unwrap_or_else(|_| name.to_string());
        registry.register(SubprocessHarness::new(name, binary, Vec::new()));
    }

    registry
}

pub async fn run_run(project_dir: &Path, max_workers: Option<usize>) -> Result<i32> {
    let config = WiggumConfig::resolve(project_dir, CliOverrides { max_workers })
        .context("failed to resolve wiggum configuration")?;

    let pipeline = Pipeline::load(&config.pipeline_path).map_err(|source| {
        WiggumError::Configuration(ConfigurationError::Pipeline {
            path: config.pipeline_path.clone(),
            source,
        })
    })?;

    let registry = build_registry(&pipeline);
    let worktree = WorktreeManager::new(project_dir).context("failed to open project repository")?;

    let mut scheduler = Scheduler::new(
        project_dir.to_path_buf(),
        config.workers_root.clone(),
        config.board_path.clone(),
        pipeline,
        registry,
        worktree,
        config.scheduler.clone(),
    );

    let shutdown = CancellationToken::new();
    install_signal_handlers(shutdown.clone());

    scheduler.run_until_shutdown(shutdown, config.shutdown_grace).await?;

    let board = Board::load(&config.board_path).context("failed to reload board after run")?;
    let any_failed = !board.list(Some(TaskMarker::Failed)).is_empty();

    Ok(if any_failed { 1 } else { 0 })
}

#[cfg(unix)]
fn install_signal_handlers(shutdown: CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let mut term = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "failed to install SIGTERM handler");
                return;
            }
        };
        let mut int = match signal(SignalKind::interrupt()) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "failed to install SIGINT handler");
                return;
            }
        };

        tokio::select! {
            _ = term.recv() => tracing::info!("received SIGTERM, starting shutdown sequence"),
            _ = int.recv() => tracing::info!("received SIGINT, starting shutdown sequence"),
        }
        shutdown.cancel();
    });
}

#[cfg(not(unix))]
fn install_signal_handlers(shutdown: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("received ctrl-c, starting shutdown sequence");
            shutdown.cancel();
        }
    });
}
