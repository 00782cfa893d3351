mod clean_cmd;
mod init_cmd;
mod run_cmd;
mod status_cmd;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "wiggum", about = "Autonomous task orchestrator for a fleet of isolated code-writing agents")]
struct Cli {
    /// Project root (defaults to the current directory)
    #[arg(long, global = true)]
    project_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default wiggum.toml and .ralph/ directory layout
    Init {
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },
    /// Resolve configuration and drive the scheduler's tick loop to completion
    Run {
        /// Cap on concurrently running workers (overrides config/env)
        #[arg(long)]
        max_workers: Option<usize>,
    },
    /// Print a per-task summary table and live worker count
    Status,
    /// Force-remove worktrees and stale worker directories
    Clean,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let project_dir = cli
        .project_dir
        .unwrap_or_else(|| std::env::current_dir().expect("failed to read current directory"));

    let result = dispatch(&project_dir, cli.command).await;

    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            let code = e
                .downcast_ref::<wiggum_core::WiggumError>()
                .map(|w| w.exit_code())
                .unwrap_or(2);
            eprintln!("{e:#}");
            std::process::exit(code);
        }
    }
}

async fn dispatch(project_dir: &std::path::Path, command: Commands) -> anyhow::Result<i32> {
    match command {
        Commands::Init { force } => {
            init_cmd::run_init(project_dir, force)?;
            Ok(0)
        }
        Commands::Run { max_workers } => run_cmd::run_run(project_dir, max_workers).await,
        Commands::Status => {
            let config = wiggum_core::WiggumConfig::resolve(project_dir, wiggum_core::CliOverrides::default())?;
            status_cmd::run_status(&config.board_path, &config.workers_root)?;
            Ok(0)
        }
        Commands::Clean => {
            let config = wiggum_core::WiggumConfig::resolve(project_dir, wiggum_core::CliOverrides::default())?;
            clean_cmd::run_clean(project_dir, &config.workers_root)?;
            Ok(0)
        }
    }
}
