//! Newline-delimited JSON activity log: a secondary, append-only sink of
//! domain events for machine consumption, independent of the human-facing
//! `tracing` subscriber output.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::lock::ExclusiveLock;

/// One record in `activity.jsonl`.
#[derive(Debug, Clone, Serialize)]
pub struct ActivityRecord {
    pub ts: DateTime<Utc>,
    pub event: String,
    pub task_id: Option<String>,
    #[serde(flatten)]
    pub fields: Value,
}

/// Appends records to `<project>/.ralph/logs/activity.jsonl`.
pub struct ActivityLog {
    path: PathBuf,
    append_lock: Mutex<()>,
}

impl ActivityLog {
    pub fn new(project_root: &Path) -> Self {
        Self {
            path: project_root.join(".ralph").join("logs").join("activity.jsonl"),
            append_lock: Mutex::new(()),
        }
    }

    /// Append one record. Appends are length-bounded single `write` calls
    /// under both an in-process mutex and a cross-process advisory lock, so
    /// concurrent writers never interleave partial lines.
    pub fn append(&self, event: &str, task_id: Option<&str>, fields: Value) -> std::io::Result<()> {
        let record = ActivityRecord {
            ts: now(),
            event: event.to_string(),
            task_id: task_id.map(str::to_string),
            fields,
        };
        let mut line = serde_json::to_vec(&record).expect("activity record is always serializable");
        line.push(b'\n');

        let _guard = self.append_lock.lock().unwrap();
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let _file_lock = ExclusiveLock::acquire(&self.path)?;
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        file.write_all(&line)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn now() -> DateTime<Utc> {
    Utc::now()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn append_writes_one_json_line_per_call() {
        let dir = TempDir::new().unwrap();
        let log = ActivityLog::new(dir.path());
        log.append("step.started", Some("AUTH-1"), json!({"step": "build"})).unwrap();
        log.append("step.completed", Some("AUTH-1"), json!({"step": "build"})).unwrap();

        let contents = std::fs::read_to_string(log.path()).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["event"], "step.started");
        assert_eq!(first["task_id"], "AUTH-1");
        assert_eq!(first["step"], "build");
    }
}
