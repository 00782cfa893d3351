//! `wiggum status` command: print a per-task summary table plus a live
//! worker count read straight off disk.

use std::path::Path;

use anyhow::{Context, Result};

use wiggum_core::lifecycle::is_worker_alive;
use wiggum_fs::{Board, TaskMarker};

fn status_icon(marker: TaskMarker) -> &'static str {
    match marker {
        TaskMarker::Pending => ".",
        TaskMarker::InProgress => "*",
        TaskMarker::Done => "+",
        TaskMarker::Failed => "!",
        TaskMarker::PendingApproval => "?",
    }
}

pub fn run_status(board_path: &Path, workers_root: &Path) -> Result<()> {
    let board = Board::load(board_path).with_context(|| format!("failed to load board at {}", board_path.display()))?;

    if !board.issues().is_empty() {
        println!("Parse issues:");
        for issue in board.issues() {
            println!("  line {}: {}", issue.line, issue.message);
        }
        println!();
    }

    println!("Tasks:");
    for task in board.tasks() {
        println!(
            "  [{}] {:<10} {:<8} deps={:<2} {}",
            status_icon(task.status),
            task.id,
            format!("{:?}", task.priority).to_uppercase(),
            task.dependencies.len(),
            task.description,
        );
    }

    let live_workers = count_live_workers(workers_root);
    println!("\n{} task(s), {live_workers} live worker(s).", board.tasks().len());

    Ok(())
}

fn count_live_workers(workers_root: &Path) -> usize {
    let Ok(entries) = std::fs::read_dir(workers_root) else {
        return 0;
    };
    entries
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .filter(|e| is_worker_alive(&e.path()))
        .count()
}
