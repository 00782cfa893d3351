//! Sidecar counter file implementing skip backoff: when a kanban status
//! update fails (e.g. a concurrent-edit collision), a task's skip counter is
//! bumped and the task is excluded from spawning until the counter decays
//! back to zero, one tick at a time.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::lock::{atomic_write, ExclusiveLock};

const DEFAULT_BACKOFF: u32 = 3;

pub struct SkipTracker {
    path: PathBuf,
}

impl SkipTracker {
    pub fn new(workers_root: &Path) -> Self {
        Self {
            path: workers_root.join(".skip.json"),
        }
    }

    fn load(&self) -> HashMap<String, u32> {
        std::fs::read(&self.path)
            .ok()
            .and_then(|b| serde_json::from_slice(&b).ok())
            .unwrap_or_default()
    }

    fn save(&self, counters: &HashMap<String, u32>) -> std::io::Result<()> {
        let bytes = serde_json::to_vec_pretty(counters).expect("counters map is always serializable");
        atomic_write(&self.path, &bytes)
    }

    /// Record a transient failure for `task_id`, setting its backoff counter
    /// to [`DEFAULT_BACKOFF`] ticks.
    pub fn record_failure(&self, task_id: &str) -> std::io::Result<()> {
        let _lock = ExclusiveLock::acquire(&self.path)?;
        let mut counters = self.load();
        counters.insert(task_id.to_string(), DEFAULT_BACKOFF);
        self.save(&counters)
    }

    /// Whether `task_id` is currently excluded from spawning.
    pub fn is_backing_off(&self, task_id: &str) -> bool {
        self.load().get(task_id).copied().unwrap_or(0) > 0
    }

    /// Decay every counter in the tracker by one tick, dropping entries that
    /// reach zero. Call once per scheduler tick.
    pub fn decay_all(&self) -> std::io::Result<()> {
        let _lock = ExclusiveLock::acquire(&self.path)?;
        let mut counters = self.load();
        counters.retain(|_, v| {
            *v = v.saturating_sub(1);
            *v > 0
        });
        self.save(&counters)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn backoff_excludes_until_decayed() {
        let dir = TempDir::new().unwrap();
        let tracker = SkipTracker::new(dir.path());
        tracker.record_failure("AUTH-1").unwrap();
        assert!(tracker.is_backing_off("AUTH-1"));

        for _ in 0..DEFAULT_BACKOFF {
            tracker.decay_all().unwrap();
        }
        assert!(!tracker.is_backing_off("AUTH-1"));
    }

    #[test]
    fn untracked_task_never_backs_off() {
        let dir = TempDir::new().unwrap();
        let tracker = SkipTracker::new(dir.path());
        assert!(!tracker.is_backing_off("AUTH-9"));
    }
}
