//! Priority scoring for ready tasks.

use std::path::Path;

use wiggum_fs::{AgingTracker, Board, Priority, Task};

pub const DEFAULT_AGING_FACTOR: i64 = 7;
pub const DEFAULT_PLAN_BONUS: i64 = 15_000;
pub const DEFAULT_DEP_BONUS_PER_TASK: i64 = 7_000;
pub const DEFAULT_SIBLING_WIP_PENALTY: i64 = 20_000;

#[derive(Debug, Clone, Copy)]
pub struct ScoreWeights {
    pub aging_factor: i64,
    pub plan_bonus: i64,
    pub dep_bonus_per_task: i64,
    pub sibling_wip_penalty: i64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            aging_factor: DEFAULT_AGING_FACTOR,
            plan_bonus: DEFAULT_PLAN_BONUS,
            dep_bonus_per_task: DEFAULT_DEP_BONUS_PER_TASK,
            sibling_wip_penalty: DEFAULT_SIBLING_WIP_PENALTY,
        }
    }
}

/// Task identifier prefix: the alphabetic run before the dash, used for
/// sibling-in-progress affinity.
pub fn prefix_of(task_id: &str) -> &str {
    task_id.split('-').next().unwrap_or(task_id)
}

fn plan_document_path(project_dir: &Path, task_id: &str) -> std::path::PathBuf {
    project_dir.join(".ralph").join("plans").join(format!("{task_id}.md"))
}

pub fn has_plan_document(project_dir: &Path, task_id: &str) -> bool {
    plan_document_path(project_dir, task_id).exists()
}

fn dep_fanin(board: &Board, task_id: &str) -> usize {
    board
        .tasks()
        .iter()
        .filter(|t| matches!(t.status, wiggum_fs::TaskMarker::Pending))
        .filter(|t| t.dependencies.iter().any(|d| d == task_id))
        .count()
}

fn sibling_in_progress(board: &Board, task: &Task) -> bool {
    let prefix = prefix_of(&task.id);
    board.tasks().iter().any(|t| {
        t.id != task.id
            && prefix_of(&t.id) == prefix
            && matches!(t.status, wiggum_fs::TaskMarker::InProgress)
    })
}

/// `score = base_priority*1000 + aging_bonus + plan_bonus + dep_fanin_bonus - sibling_wip_penalty`
pub fn score(task: &Task, board: &Board, aging: &AgingTracker, project_dir: &Path, weights: ScoreWeights) -> i64 {
    let base_priority = match task.priority {
        Priority::Low => 1,
        Priority::Medium => 2,
        Priority::High => 3,
        Priority::Critical => 4,
    };

    let ticks_ready = aging.get(&task.id) as i64;
    let aging_bonus = ticks_ready * weights.aging_factor;

    let plan_bonus = if has_plan_document(project_dir, &task.id) {
        weights.plan_bonus
    } else {
        0
    };

    let dep_fanin_bonus = dep_fanin(board, &task.id) as i64 * weights.dep_bonus_per_task;

    let sibling_penalty = if sibling_in_progress(board, task) {
        weights.sibling_wip_penalty
    } else {
        0
    };

    base_priority * 1000 + aging_bonus + plan_bonus + dep_fanin_bonus - sibling_penalty
}

/// Order candidates by descending score, tie-broken by ascending task identifier.
pub fn rank<'a>(tasks: &[&'a Task], board: &Board, aging: &AgingTracker, project_dir: &Path, weights: ScoreWeights) -> Vec<&'a Task> {
    let mut scored: Vec<(&Task, i64)> = tasks
        .iter()
        .map(|t| (*t, score(t, board, aging, project_dir, weights)))
        .collect();
    scored.sort_by(|(a, a_score), (b, b_score)| b_score.cmp(a_score).then_with(|| a.id.cmp(&b.id)));
    scored.into_iter().map(|(t, _)| t).collect()
}
