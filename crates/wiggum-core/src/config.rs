//! Project configuration: a layered resolution of CLI flags, `WIGGUM_*`
//! environment variables, a project-level `wiggum.toml` (or
//! `.ralph/config.toml`), and built-in defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::{ConfigurationError, WiggumError};
use crate::scheduler::score::{
    DEFAULT_AGING_FACTOR, DEFAULT_DEP_BONUS_PER_TASK, DEFAULT_PLAN_BONUS, DEFAULT_SIBLING_WIP_PENALTY,
};
use crate::scheduler::SchedulerConfig;

/// On-disk project config file, either `wiggum.toml` at the repo root or
/// `.ralph/config.toml`.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub max_workers: Option<usize>,
    #[serde(default)]
    pub aging_factor: Option<i64>,
    #[serde(default)]
    pub sibling_wip_penalty: Option<i64>,
    #[serde(default)]
    pub plan_bonus: Option<i64>,
    #[serde(default)]
    pub dep_bonus_per_task: Option<i64>,
    #[serde(default)]
    pub tick_interval_ms: Option<u64>,
    #[serde(default)]
    pub violation_interval_secs: Option<u64>,
    #[serde(default)]
    pub shutdown_grace_secs: Option<u64>,
    #[serde(default)]
    pub board_path: Option<PathBuf>,
    #[serde(default)]
    pub workers_root: Option<PathBuf>,
    #[serde(default)]
    pub pipeline_path: Option<PathBuf>,
    #[serde(default)]
    pub max_fix_retries: Option<u32>,
    #[serde(default)]
    pub max_resolve_retries: Option<u32>,
    #[serde(default)]
    pub auto_merge: Option<bool>,
}

/// Override values supplied on the command line; `None` means "not passed",
/// falling through to the next resolution tier.
#[derive(Debug, Default, Clone)]
pub struct CliOverrides {
    pub max_workers: Option<usize>,
}

/// Fully resolved configuration for one project, ready to drive a
/// [`crate::scheduler::Scheduler`].
#[derive(Debug)]
pub struct WiggumConfig {
    pub project_dir: PathBuf,
    pub board_path: PathBuf,
    pub workers_root: PathBuf,
    pub pipeline_path: PathBuf,
    pub scheduler: SchedulerConfig,
    pub shutdown_grace: Duration,
}

const DEFAULT_MAX_WORKERS: usize = 4;
const DEFAULT_TICK_INTERVAL_MS: u64 = 1500;
const DEFAULT_VIOLATION_INTERVAL_SECS: u64 = 5;
const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 10;
const DEFAULT_MAX_FIX_RETRIES: u32 = 2;
const DEFAULT_MAX_RESOLVE_RETRIES: u32 = 2;
const DEFAULT_AUTO_MERGE: bool = false;

fn config_file_path(project_dir: &Path) -> PathBuf {
    let root_level = project_dir.join("wiggum.toml");
    if root_level.exists() {
        return root_level;
    }
    project_dir.join(".ralph").join("config.toml")
}

/// Load the project config file, if one exists. `Ok(None)` means no config
/// file is present (defaults apply); `Err` means one exists but failed to
/// parse, which is a configuration-category error surfaced to the CLI.
fn load_config_file(project_dir: &Path) -> Result<Option<ConfigFile>, ConfigurationError> {
    let path = config_file_path(project_dir);
    let Ok(contents) = std::fs::read_to_string(&path) else {
        return Ok(None);
    };
    toml::from_str(&contents)
        .map(Some)
        .map_err(|source| ConfigurationError::ProjectConfig { path, source })
}

fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

fn env_i64(name: &str) -> Option<i64> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

fn env_u32(name: &str) -> Option<u32> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

fn env_bool(name: &str) -> Option<bool> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

impl WiggumConfig {
    /// Resolve configuration for `project_dir` using the chain: CLI flag >
    /// `WIGGUM_*` environment variable > project config file > built-in
    /// default.
    pub fn resolve(project_dir: impl Into<PathBuf>, cli: CliOverrides) -> Result<Self> {
        let project_dir = project_dir.into();
        let file = load_config_file(&project_dir).map_err(WiggumError::Configuration)?;

        let max_workers = cli
            .max_workers
            .or_else(|| env_usize("WIGGUM_MAX_WORKERS"))
            .or_else(|| file.as_ref().and_then(|f| f.max_workers))
            .unwrap_or(DEFAULT_MAX_WORKERS);

        let aging_factor = env_i64("WIGGUM_AGING_FACTOR")
            .or_else(|| file.as_ref().and_then(|f| f.aging_factor))
            .unwrap_or(DEFAULT_AGING_FACTOR);

        let sibling_wip_penalty = env_i64("WIGGUM_SIBLING_WIP_PENALTY")
            .or_else(|| file.as_ref().and_then(|f| f.sibling_wip_penalty))
            .unwrap_or(DEFAULT_SIBLING_WIP_PENALTY);

        let plan_bonus = env_i64("WIGGUM_PLAN_BONUS")
            .or_else(|| file.as_ref().and_then(|f| f.plan_bonus))
            .unwrap_or(DEFAULT_PLAN_BONUS);

        let dep_bonus_per_task = env_i64("WIGGUM_DEP_BONUS_PER_TASK")
            .or_else(|| file.as_ref().and_then(|f| f.dep_bonus_per_task))
            .unwrap_or(DEFAULT_DEP_BONUS_PER_TASK);

        let tick_interval_ms = env_u64("WIGGUM_TICK_INTERVAL_MS")
            .or_else(|| file.as_ref().and_then(|f| f.tick_interval_ms))
            .unwrap_or(DEFAULT_TICK_INTERVAL_MS);

        let violation_interval_secs = env_u64("WIGGUM_VIOLATION_INTERVAL_SECS")
            .or_else(|| file.as_ref().and_then(|f| f.violation_interval_secs))
            .unwrap_or(DEFAULT_VIOLATION_INTERVAL_SECS);

        let shutdown_grace_secs = env_u64("WIGGUM_SHUTDOWN_GRACE_SECS")
            .or_else(|| file.as_ref().and_then(|f| f.shutdown_grace_secs))
            .unwrap_or(DEFAULT_SHUTDOWN_GRACE_SECS);

        let board_path = std::env::var("WIGGUM_BOARD_PATH")
            .ok()
            .map(PathBuf::from)
            .or_else(|| file.as_ref().and_then(|f| f.board_path.clone()))
            .unwrap_or_else(|| project_dir.join("board.md"));

        let workers_root = std::env::var("WIGGUM_WORKERS_ROOT")
            .ok()
            .map(PathBuf::from)
            .or_else(|| file.as_ref().and_then(|f| f.workers_root.clone()))
            .unwrap_or_else(|| project_dir.join(".ralph").join("workers"));

        let pipeline_path = std::env::var("WIGGUM_PIPELINE_PATH")
            .ok()
            .map(PathBuf::from)
            .or_else(|| file.as_ref().and_then(|f| f.pipeline_path.clone()))
            .unwrap_or_else(|| project_dir.join("wiggum-pipeline.json"));

        let max_fix_retries = env_u32("WIGGUM_MAX_FIX_RETRIES")
            .or_else(|| file.as_ref().and_then(|f| f.max_fix_retries))
            .unwrap_or(DEFAULT_MAX_FIX_RETRIES);

        let max_resolve_retries = env_u32("WIGGUM_MAX_RESOLVE_RETRIES")
            .or_else(|| file.as_ref().and_then(|f| f.max_resolve_retries))
            .unwrap_or(DEFAULT_MAX_RESOLVE_RETRIES);

        let auto_merge = env_bool("WIGGUM_AUTO_MERGE")
            .or_else(|| file.as_ref().and_then(|f| f.auto_merge))
            .unwrap_or(DEFAULT_AUTO_MERGE);

        Ok(Self {
            project_dir,
            board_path,
            workers_root,
            pipeline_path,
            scheduler: SchedulerConfig {
                max_workers,
                weights: crate::scheduler::score::ScoreWeights {
                    aging_factor,
                    plan_bonus,
                    dep_bonus_per_task,
                    sibling_wip_penalty,
                },
                tick_interval: Duration::from_millis(tick_interval_ms),
                violation_interval: Duration::from_secs(violation_interval_secs),
                max_fix_retries,
                max_resolve_retries,
                auto_merge,
            },
            shutdown_grace: Duration::from_secs(shutdown_grace_secs),
        })
    }

    /// Write a default `wiggum.toml` and the `.ralph/` directory layout
    /// (`.ralph/logs/`, `.ralph/state/`) next to the board file. Used by the
    /// `init` CLI command.
    pub fn scaffold(project_dir: &Path, force: bool) -> Result<()> {
        let config_path = project_dir.join("wiggum.toml");
        if config_path.exists() && !force {
            anyhow::bail!(
                "{} already exists; pass --force to overwrite",
                config_path.display()
            );
        }

        let default_file = ConfigFile::default();
        let contents = toml::to_string_pretty(&default_file).context("failed to serialize default wiggum.toml")?;
        std::fs::write(&config_path, contents)
            .with_context(|| format!("failed to write {}", config_path.display()))?;

        for dir in [".ralph/logs", ".ralph/state", ".ralph/workers", ".ralph/plans"] {
            std::fs::create_dir_all(project_dir.join(dir))
                .with_context(|| format!("failed to create {dir}"))?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn resolve_uses_defaults_when_nothing_set() {
        let dir = TempDir::new().unwrap();
        let config = WiggumConfig::resolve(dir.path(), CliOverrides::default()).unwrap();
        assert_eq!(config.scheduler.max_workers, DEFAULT_MAX_WORKERS);
    }

    #[test]
    fn cli_override_beats_config_file() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("wiggum.toml"), "max_workers = 9\n").unwrap();
        let config = WiggumConfig::resolve(
            dir.path(),
            CliOverrides {
                max_workers: Some(2),
            },
        )
        .unwrap();
        assert_eq!(config.scheduler.max_workers, 2);
    }

    #[test]
    fn config_file_beats_default() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("wiggum.toml"), "max_workers = 9\n").unwrap();
        let config = WiggumConfig::resolve(dir.path(), CliOverrides::default()).unwrap();
        assert_eq!(config.scheduler.max_workers, 9);
    }

    #[test]
    fn scaffold_writes_config_and_directories() {
        let dir = TempDir::new().unwrap();
        WiggumConfig::scaffold(dir.path(), false).unwrap();
        assert!(dir.path().join("wiggum.toml").exists());
        assert!(dir.path().join(".ralph/logs").is_dir());
        assert!(dir.path().join(".ralph/workers").is_dir());
    }

    #[test]
    fn malformed_config_file_surfaces_configuration_error() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("wiggum.toml"), "max_workers = [this is not valid toml").unwrap();
        let err = WiggumConfig::resolve(dir.path(), CliOverrides::default()).unwrap_err();
        let wiggum_err = err.downcast_ref::<WiggumError>().expect("expected a WiggumError");
        assert!(matches!(wiggum_err, WiggumError::Configuration(ConfigurationError::ProjectConfig { .. })));
        assert_eq!(wiggum_err.exit_code(), 2);
    }

    #[test]
    fn scaffold_refuses_to_overwrite_without_force() {
        let dir = TempDir::new().unwrap();
        WiggumConfig::scaffold(dir.path(), false).unwrap();
        let err = WiggumConfig::scaffold(dir.path(), false).unwrap_err();
        assert!(err.to_string().contains("--force"));
    }
}
