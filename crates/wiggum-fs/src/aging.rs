//! Sidecar counter file tracking how many scheduler ticks a task has been
//! continuously ready without being spawned, used to compute its aging bonus.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::lock::{atomic_write, ExclusiveLock};

/// A counters file keyed by task identifier, persisted as JSON at
/// `<workers_root>/.aging.json`.
pub struct AgingTracker {
    path: PathBuf,
}

impl AgingTracker {
    pub fn new(workers_root: &Path) -> Self {
        Self {
            path: workers_root.join(".aging.json"),
        }
    }

    fn load(&self) -> HashMap<String, u64> {
        std::fs::read(&self.path)
            .ok()
            .and_then(|b| serde_json::from_slice(&b).ok())
            .unwrap_or_default()
    }

    fn save(&self, counters: &HashMap<String, u64>) -> std::io::Result<()> {
        let bytes = serde_json::to_vec_pretty(counters).expect("counters map is always serializable");
        atomic_write(&self.path, &bytes)
    }

    /// Increment the tick counter for `task_id` by one and return the new value.
    pub fn bump(&self, task_id: &str) -> std::io::Result<u64> {
        let _lock = ExclusiveLock::acquire(&self.path)?;
        let mut counters = self.load();
        let entry = counters.entry(task_id.to_string()).or_insert(0);
        *entry += 1;
        let value = *entry;
        self.save(&counters)?;
        Ok(value)
    }

    /// Current tick count for `task_id`, or 0 if untracked.
    pub fn get(&self, task_id: &str) -> u64 {
        self.load().get(task_id).copied().unwrap_or(0)
    }

    /// Remove `task_id`'s counter entirely, used once it is spawned.
    pub fn clear(&self, task_id: &str) -> std::io::Result<()> {
        let _lock = ExclusiveLock::acquire(&self.path)?;
        let mut counters = self.load();
        counters.remove(task_id);
        self.save(&counters)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn bump_increments_and_persists() {
        let dir = TempDir::new().unwrap();
        let tracker = AgingTracker::new(dir.path());
        assert_eq!(tracker.bump("AUTH-1").unwrap(), 1);
        assert_eq!(tracker.bump("AUTH-1").unwrap(), 2);
        assert_eq!(tracker.get("AUTH-1"), 2);
        assert_eq!(tracker.get("AUTH-2"), 0);
    }

    #[test]
    fn clear_resets_counter() {
        let dir = TempDir::new().unwrap();
        let tracker = AgingTracker::new(dir.path());
        tracker.bump("AUTH-1").unwrap();
        tracker.clear("AUTH-1").unwrap();
        assert_eq!(tracker.get("AUTH-1"), 0);
    }
}
