//! Batch Coordination Record: shared state for a group of tasks that must
//! run serially because later members depend on earlier ones in sequence.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::lock::{atomic_write, ExclusiveLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Active,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRecord {
    pub batch_id: String,
    pub members: Vec<String>,
    /// Index into `members` of the task currently allowed to run.
    pub position: usize,
    pub status: BatchStatus,
    pub failing_task: Option<String>,
}

impl BatchRecord {
    pub fn new(batch_id: impl Into<String>, members: Vec<String>) -> Self {
        Self {
            batch_id: batch_id.into(),
            members,
            position: 0,
            status: BatchStatus::Active,
            failing_task: None,
        }
    }

    /// Whether `task_id` is allowed to run right now: the batch must be
    /// active and the task's position must have arrived.
    pub fn may_run(&self, task_id: &str) -> bool {
        self.status == BatchStatus::Active
            && self
                .members
                .get(self.position)
                .is_some_and(|current| current == task_id)
    }
}

/// Filesystem-backed store for batch records, one JSON file per batch under
/// `<workers_root>/.batches/<batch_id>.json`.
pub struct BatchStore {
    dir: PathBuf,
}

impl BatchStore {
    pub fn new(workers_root: &Path) -> Self {
        Self {
            dir: workers_root.join(".batches"),
        }
    }

    fn path(&self, batch_id: &str) -> PathBuf {
        self.dir.join(format!("{batch_id}.json"))
    }

    pub fn create(&self, record: &BatchRecord) -> std::io::Result<()> {
        let path = self.path(&record.batch_id);
        let bytes = serde_json::to_vec_pretty(record).expect("batch record is always serializable");
        atomic_write(&path, &bytes)
    }

    pub fn load(&self, batch_id: &str) -> std::io::Result<Option<BatchRecord>> {
        let path = self.path(batch_id);
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Advance `batch_id` to the next member, under an exclusive lock.
    pub fn advance(&self, batch_id: &str) -> std::io::Result<()> {
        let path = self.path(batch_id);
        let _lock = ExclusiveLock::acquire(&path)?;
        let mut record: BatchRecord = serde_json::from_slice(&std::fs::read(&path)?)?;
        record.position = (record.position + 1).min(record.members.len());
        let bytes = serde_json::to_vec_pretty(&record).expect("batch record is always serializable");
        atomic_write(&path, &bytes)
    }

    /// Mark `batch_id` failed, recording which task caused the failure.
    /// Every other worker in the batch observes this on its next `may_run`
    /// check and aborts.
    pub fn fail(&self, batch_id: &str, failing_task: &str) -> std::io::Result<()> {
        let path = self.path(batch_id);
        let _lock = ExclusiveLock::acquire(&path)?;
        let mut record: BatchRecord = serde_json::from_slice(&std::fs::read(&path)?)?;
        record.status = BatchStatus::Failed;
        record.failing_task = Some(failing_task.to_string());
        let bytes = serde_json::to_vec_pretty(&record).expect("batch record is always serializable");
        atomic_write(&path, &bytes)
    }
}
