//! Orchestration engine: git worktree isolation, pluggable sub-agent
//! harnesses, the pipeline runner, worker lifecycle, and the scheduler that
//! ties them together against a filesystem-backed task board.

pub mod batch;
pub mod config;
pub mod error;
pub mod finalize;
pub mod gate;
pub mod harness;
pub mod lifecycle;
pub mod pipeline;
pub mod scheduler;
pub mod violation;
pub mod worktree;

pub use config::{CliOverrides, ConfigFile, WiggumConfig};
pub use error::{ConfigurationError, WiggumError};
pub use scheduler::{Scheduler, SchedulerConfig, TickReport};
