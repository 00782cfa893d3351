//! Filesystem-backed persistence primitives: the task board, the worker
//! pool, advisory locking, sidecar counters, batch coordination records, and
//! the activity log. No database — every piece of orchestrator state that
//! outlives a process is a file under the project or workers root.

pub mod activity;
pub mod aging;
pub mod batch;
pub mod board;
pub mod error;
pub mod lock;
pub mod pool;
pub mod skip;

pub use activity::{ActivityLog, ActivityRecord};
pub use aging::AgingTracker;
pub use batch::{BatchRecord, BatchStatus, BatchStore};
pub use board::{Board, BoardError, ParseIssue, Priority, Task, TaskMarker};
pub use error::FsError;
pub use lock::{atomic_write, ExclusiveLock};
pub use pool::{Pool, PoolEntry, WorkerKind};
pub use skip::SkipTracker;
