//! Sibling batch coordination: tasks sharing a board-identifier prefix
//! (`AUTH-1`, `AUTH-2`, ...) but no declared dependency on each other must
//! still never run concurrently. Rather than re-deriving that rule from
//! scope-prefix overlap on every tick, the scheduler groups them into a
//! [`wiggum_fs::BatchRecord`] the first time it sees more than one open
//! task for a prefix, and consults that record's `position` to decide whose
//! turn it is — the same on-disk, lock-guarded mechanism a serially
//! dependent chain would use, applied to siblings the board doesn't
//! otherwise order.

use wiggum_fs::{Board, BatchRecord, BatchStore, TaskMarker};

fn prefix_of(task_id: &str) -> Option<&str> {
    task_id.split_once('-').map(|(prefix, _)| prefix)
}

/// The batch a task belongs to, keyed by its identifier prefix. Every task
/// has a nominal batch id; whether that batch actually has more than one
/// member (and therefore a record worth consulting) is decided separately.
fn batch_id_for(task_id: &str) -> Option<String> {
    prefix_of(task_id).map(|prefix| format!("sibling-{prefix}"))
}

/// Group every still-open (not `Done`) task by identifier prefix, in
/// ascending lexicographic order — the same tie-break the scheduler's own
/// ranking uses — keeping only groups with more than one member.
pub fn detect_batches(board: &Board) -> Vec<(String, Vec<String>)> {
    let mut by_prefix: std::collections::BTreeMap<&str, Vec<&str>> = std::collections::BTreeMap::new();
    for task in board.tasks() {
        if task.status == TaskMarker::Done {
            continue;
        }
        if let Some(prefix) = prefix_of(&task.id) {
            by_prefix.entry(prefix).or_default().push(task.id.as_str());
        }
    }

    by_prefix
        .into_iter()
        .filter(|(_, members)| members.len() > 1)
        .map(|(prefix, mut members)| {
            members.sort_unstable();
            (format!("sibling-{prefix}"), members.into_iter().map(String::from).collect())
        })
        .collect()
}

/// Create a batch record for every detected group that doesn't already have
/// one. Idempotent: an existing record (with whatever position it has
/// already advanced to) is left untouched.
pub fn ensure_batches(store: &BatchStore, board: &Board) {
    for (batch_id, members) in detect_batches(board) {
        if store.load(&batch_id).ok().flatten().is_none() {
            let _ = store.create(&BatchRecord::new(batch_id, members));
        }
    }
}

/// Whether `task_id` may spawn right now. Tasks whose prefix is not shared
/// by any other open task are unconstrained; a task in a batch may run only
/// once its position has arrived, and never once the batch is failed.
pub fn may_run(store: &BatchStore, task_id: &str) -> bool {
    let Some(batch_id) = batch_id_for(task_id) else {
        return true;
    };
    match store.load(&batch_id) {
        Ok(Some(record)) => record.may_run(task_id),
        Ok(None) | Err(_) => true,
    }
}

/// The batch record `task_id` belongs to, if one has been created, for
/// embedding as `batch-context.json` alongside a spawned worker.
pub fn context_for(store: &BatchStore, task_id: &str) -> Option<BatchRecord> {
    let batch_id = batch_id_for(task_id)?;
    store.load(&batch_id).ok().flatten()
}

/// Advance the batch `task_id` belongs to, letting the next member run.
/// No-op for tasks outside a batch.
pub fn advance(store: &BatchStore, task_id: &str) {
    if let Some(batch_id) = batch_id_for(task_id) {
        if store.load(&batch_id).ok().flatten().is_some() {
            let _ = store.advance(&batch_id);
        }
    }
}

/// Mark the batch `task_id` belongs to as failed, so every other member
/// aborts with `FAIL` on its next `may_run` check instead of being spawned.
pub fn fail(store: &BatchStore, task_id: &str) {
    if let Some(batch_id) = batch_id_for(task_id) {
        if store.load(&batch_id).ok().flatten().is_some() {
            let _ = store.fail(&batch_id, task_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BOARD: &str = "\
# Board

## TASKS

- [ ] [AUTH-2]
  Description: second auth task
  Priority: MEDIUM
  Dependencies: none

- [ ] [AUTH-1]
  Description: first auth task
  Priority: MEDIUM
  Dependencies: none

- [ ] [UI-1]
  Description: unrelated ui task
  Priority: MEDIUM
  Dependencies: none
";

    fn load_board() -> Board {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("board.md");
        std::fs::write(&path, BOARD).unwrap();
        Board::load(&path).unwrap()
    }

    #[test]
    fn detect_batches_groups_by_prefix_and_drops_singletons() {
        let board = load_board();
        let batches = detect_batches(&board);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].0, "sibling-AUTH");
        assert_eq!(batches[0].1, vec!["AUTH-1".to_string(), "AUTH-2".to_string()]);
    }

    #[test]
    fn may_run_true_for_task_outside_any_batch() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = BatchStore::new(dir.path());
        assert!(may_run(&store, "UI-1"));
    }

    #[test]
    fn ensure_batches_then_may_run_respects_position() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = BatchStore::new(dir.path());
        let board = load_board();

        ensure_batches(&store, &board);

        assert!(may_run(&store, "AUTH-1"));
        assert!(!may_run(&store, "AUTH-2"));

        advance(&store, "AUTH-1");
        assert!(may_run(&store, "AUTH-2"));

        fail(&store, "AUTH-2");
        assert!(!may_run(&store, "AUTH-2"));
    }
}
