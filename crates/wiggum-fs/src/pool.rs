//! In-memory worker pool: the live index of running worker processes, with
//! reconstruction from the workers directory after a restart.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Which kind of attempt a pool entry represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerKind {
    Main,
    Fix,
    Resolve,
}

impl WorkerKind {
    /// Infer the kind from a worker directory name of the form
    /// `worker-<ID>-*`, `worker-<ID>-fix-*`, or `worker-<ID>-resolve-*`.
    fn from_dir_name(name: &str) -> Self {
        if name.contains("-fix-") || name.ends_with("-fix") {
            Self::Fix
        } else if name.contains("-resolve-") || name.ends_with("-resolve") {
            Self::Resolve
        } else {
            Self::Main
        }
    }
}

#[derive(Debug, Clone)]
pub struct PoolEntry {
    pub pid: u32,
    pub task_id: String,
    pub kind: WorkerKind,
    pub dir: PathBuf,
}

/// Live index of worker processes, keyed by PID.
///
/// Mutation is serialized through an internal mutex; [`Pool::snapshot`]
/// returns a point-in-time copy so callers iterating do not hold the lock.
pub struct Pool {
    entries: Mutex<HashMap<u32, PoolEntry>>,
}

impl Default for Pool {
    fn default() -> Self {
        Self::new()
    }
}

impl Pool {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn add(&self, entry: PoolEntry) {
        self.entries.lock().unwrap().insert(entry.pid, entry);
    }

    pub fn remove(&self, pid: u32) -> Option<PoolEntry> {
        self.entries.lock().unwrap().remove(&pid)
    }

    pub fn get(&self, pid: u32) -> Option<PoolEntry> {
        self.entries.lock().unwrap().get(&pid).cloned()
    }

    pub fn count(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    /// Count of entries of a given kind, or of all kinds combined when `kind`
    /// is `None`. The scheduler's capacity check uses the combined count
    /// (fix/resolve workers count against `max_workers` too).
    pub fn count_kind(&self, kind: Option<WorkerKind>) -> usize {
        let entries = self.entries.lock().unwrap();
        match kind {
            Some(k) => entries.values().filter(|e| e.kind == k).count(),
            None => entries.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }

    /// A point-in-time copy of all entries, safe to iterate without holding
    /// the pool's lock.
    pub fn snapshot(&self) -> Vec<PoolEntry> {
        self.entries.lock().unwrap().values().cloned().collect()
    }

    /// Scan `root` for worker directories and re-register any whose recorded
    /// PID is still alive. Used both at startup (crash recovery) and for
    /// orphan reconciliation before the first scheduler tick.
    pub fn restore_from_disk(&self, root: &Path) -> std::io::Result<usize> {
        let mut restored = 0;
        if !root.exists() {
            return Ok(0);
        }
        for entry in std::fs::read_dir(root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let dir = entry.path();
            let name = entry.file_name();
            let name = name.to_string_lossy();

            let Some(task_id) = task_id_from_dir_name(&name) else {
                continue;
            };
            let pid_path = dir.join("worker.pid");
            let Ok(pid_text) = std::fs::read_to_string(&pid_path) else {
                continue;
            };
            let Ok(pid) = pid_text.trim().parse::<u32>() else {
                continue;
            };
            if !pid_is_alive(pid) {
                continue;
            }
            self.add(PoolEntry {
                pid,
                task_id,
                kind: WorkerKind::from_dir_name(&name),
                dir,
            });
            restored += 1;
        }
        Ok(restored)
    }

    /// Remove and return every entry whose recorded PID is no longer alive.
    /// Used each tick to notice that an adopted orphan's owning process has
    /// since exited, so its task can be reaped even without a join handle.
    pub fn reap_dead(&self) -> Vec<PoolEntry> {
        let mut entries = self.entries.lock().unwrap();
        let dead: Vec<u32> = entries
            .iter()
            .filter(|(pid, _)| !pid_is_alive(**pid))
            .map(|(pid, _)| *pid)
            .collect();
        dead.into_iter().filter_map(|pid| entries.remove(&pid)).collect()
    }
}

fn task_id_from_dir_name(name: &str) -> Option<String> {
    let rest = name.strip_prefix("worker-")?;
    let id = rest.split('-').next()?;
    if id.is_empty() {
        None
    } else {
        Some(id.to_string())
    }
}

#[cfg(unix)]
fn pid_is_alive(pid: u32) -> bool {
    // Signal 0 performs no-op error checking: it tells us whether a process
    // with this PID exists and is signalable by us.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(not(unix))]
fn pid_is_alive(_pid: u32) -> bool {
    false
}
