//! `wiggum init` command: scaffold a project config, no running agents
//! required.

use std::path::Path;

use anyhow::Result;
use wiggum_core::WiggumConfig;

pub fn run_init(project_dir: &Path, force: bool) -> Result<()> {
    WiggumConfig::scaffold(project_dir, force)?;
    println!("wiggum.toml written to {}", project_dir.join("wiggum.toml").display());
    println!("Created .ralph/{{logs,state,workers,plans}}");
    println!();
    println!("Next: add task entries to board.md, then run `wiggum run`.");
    Ok(())
}
