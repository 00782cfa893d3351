//! The task board: parsing, querying, and locked status updates for the
//! kanban-style markdown file that is the orchestrator's single source of
//! truth for work items.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::lock::{atomic_write, ExclusiveLock};

/// On-disk status marker for a task entry.
///
/// `blocked` is deliberately absent here: it is never stored, only computed
/// from dependency state at query time (see [`Board::blocked`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskMarker {
    Pending,
    InProgress,
    Done,
    Failed,
    PendingApproval,
}

impl TaskMarker {
    fn glyph(self) -> &'static str {
        match self {
            Self::Pending => " ",
            Self::InProgress => "=",
            Self::Done => "x",
            Self::Failed => "*",
            Self::PendingApproval => "P",
        }
    }

    fn from_glyph(glyph: &str) -> Option<Self> {
        match glyph {
            " " => Some(Self::Pending),
            "=" => Some(Self::InProgress),
            "x" | "X" => Some(Self::Done),
            "*" => Some(Self::Failed),
            "P" => Some(Self::PendingApproval),
            _ => None,
        }
    }
}

impl fmt::Display for TaskMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::InProgress => "in-progress",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::PendingApproval => "pending-approval",
        };
        f.write_str(s)
    }
}

/// Task priority, ordered `LOW < MEDIUM < HIGH < CRITICAL`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

impl Priority {
    /// Numeric weight used by the scheduler's scoring formula.
    pub fn weight(self) -> i64 {
        match self {
            Self::Low => 1,
            Self::Medium => 2,
            Self::High => 3,
            Self::Critical => 4,
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "LOW" => Some(Self::Low),
            "MEDIUM" => Some(Self::Medium),
            "HIGH" => Some(Self::High),
            "CRITICAL" => Some(Self::Critical),
            _ => None,
        }
    }
}

/// A single work item on the board.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub status: TaskMarker,
    pub priority: Priority,
    pub description: String,
    pub dependencies: Vec<String>,
    pub scope: Vec<String>,
    pub acceptance_criteria: Vec<String>,
}

impl Task {
    /// A task is ready iff it is pending and every dependency is `Done`.
    pub fn is_ready(&self, by_id: &HashMap<String, &Task>) -> bool {
        self.status == TaskMarker::Pending
            && self
                .dependencies
                .iter()
                .all(|dep| by_id.get(dep).is_some_and(|t| t.status == TaskMarker::Done))
    }

    /// A task is blocked iff at least one dependency is not `Done` (and the
    /// task itself has not already terminated).
    pub fn is_blocked(&self, by_id: &HashMap<String, &Task>) -> bool {
        self.status == TaskMarker::Pending
            && self
                .dependencies
                .iter()
                .any(|dep| !by_id.get(dep).is_some_and(|t| t.status == TaskMarker::Done))
    }
}

/// Validates the identifier grammar: 2-8 uppercase letters, a dash, 1-4 digits.
pub fn valid_identifier(id: &str) -> bool {
    let Some((prefix, num)) = id.split_once('-') else {
        return false;
    };
    let prefix_ok = (2..=8).contains(&prefix.len()) && prefix.chars().all(|c| c.is_ascii_uppercase());
    let num_ok = (1..=4).contains(&num.len()) && num.chars().all(|c| c.is_ascii_digit());
    prefix_ok && num_ok
}

#[derive(Debug, Error)]
pub enum BoardError {
    #[error("io error reading/writing board: {0}")]
    Io(#[from] std::io::Error),
    #[error("task {0:?} not found on board")]
    NotFound(String),
    #[error("board changed on disk since it was last read (concurrent edit)")]
    ConcurrentEdit,
    #[error("dependency {dep:?} of task {task:?} does not exist")]
    UnknownDependency { task: String, dep: String },
}

/// A single malformed entry found while parsing, reported but excluded.
#[derive(Debug, Clone)]
pub struct ParseIssue {
    pub line: usize,
    pub message: String,
}

/// The parsed contents of a board file at a point in time.
#[derive(Debug, Clone)]
pub struct Board {
    tasks: Vec<Task>,
    issues: Vec<ParseIssue>,
    /// Raw file bytes as read, used to detect concurrent edits on write-back.
    snapshot: Vec<u8>,
}

impl Board {
    /// Load and parse the board file at `path`.
    pub fn load(path: &Path) -> Result<Self, BoardError> {
        let bytes = std::fs::read(path)?;
        Ok(Self::parse(bytes))
    }

    fn parse(bytes: Vec<u8>) -> Self {
        let text = String::from_utf8_lossy(&bytes).into_owned();
        let (tasks, issues) = parse_tasks(&text);
        Self {
            tasks,
            issues,
            snapshot: bytes,
        }
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn issues(&self) -> &[ParseIssue] {
        &self.issues
    }

    pub fn get(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn list(&self, status: Option<TaskMarker>) -> Vec<&Task> {
        self.tasks
            .iter()
            .filter(|t| status.is_none_or(|s| t.status == s))
            .collect()
    }

    fn by_id_map(&self) -> HashMap<String, &Task> {
        self.tasks.iter().map(|t| (t.id.clone(), t)).collect()
    }

    pub fn ready(&self) -> Vec<&Task> {
        let by_id = self.by_id_map();
        self.tasks.iter().filter(|t| t.is_ready(&by_id)).collect()
    }

    pub fn blocked(&self) -> Vec<&Task> {
        let by_id = self.by_id_map();
        self.tasks.iter().filter(|t| t.is_blocked(&by_id)).collect()
    }

    /// Detect dependency cycles via Tarjan-style strongly-connected-component
    /// discovery. Returns one `Vec<String>` (task identifiers) per cycle of
    /// size >= 2, plus one singleton `Vec` per self-loop.
    pub fn detect_cycles(&self) -> Vec<Vec<String>> {
        detect_cycles(&self.tasks)
    }

    /// Validate that every dependency identifier refers to an existing task.
    pub fn validate_dependencies(&self) -> Result<(), BoardError> {
        let known: HashSet<&str> = self.tasks.iter().map(|t| t.id.as_str()).collect();
        for task in &self.tasks {
            for dep in &task.dependencies {
                if !known.contains(dep.as_str()) {
                    return Err(BoardError::UnknownDependency {
                        task: task.id.clone(),
                        dep: dep.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Atomically set `id`'s status marker, failing with
    /// [`BoardError::ConcurrentEdit`] if the file has changed on disk since
    /// this `Board` was loaded.
    pub fn set_status(&mut self, path: &Path, id: &str, marker: TaskMarker) -> Result<(), BoardError> {
        let _lock = ExclusiveLock::acquire(path)?;
        let on_disk = std::fs::read(path)?;
        if on_disk != self.snapshot {
            return Err(BoardError::ConcurrentEdit);
        }

        let text = String::from_utf8_lossy(&on_disk).into_owned();
        let new_text = rewrite_status(&text, id, marker).ok_or_else(|| BoardError::NotFound(id.to_string()))?;

        atomic_write(path, new_text.as_bytes())?;

        if let Some(task) = self.tasks.iter_mut().find(|t| t.id == id) {
            task.status = marker;
        }
        self.snapshot = new_text.into_bytes();
        Ok(())
    }
}

/// Rewrite the checkbox glyph for task `id` within `text` to `marker`,
/// returning the full new text, or `None` if `id` was not found.
fn rewrite_status(text: &str, id: &str, marker: TaskMarker) -> Option<String> {
    let needle = format!("[{id}]");
    let mut found = false;
    let mut out = String::with_capacity(text.len());
    for line in text.lines() {
        if !found {
            if let Some(rest) = line.trim_start().strip_prefix("- [") {
                if let Some(close) = rest.find(']') {
                    let glyph = &rest[..close];
                    let after = &rest[close + 1..];
                    if after.trim_start().starts_with(&needle) {
                        let indent_len = line.len() - line.trim_start().len();
                        let indent = &line[..indent_len];
                        out.push_str(indent);
                        out.push_str("- [");
                        out.push_str(marker.glyph());
                        out.push(']');
                        out.push_str(after);
                        out.push('\n');
                        found = true;
                        continue;
                    }
                    let _ = glyph;
                }
            }
        }
        out.push_str(line);
        out.push('\n');
    }
    found.then_some(out)
}

/// Parse the `## TASKS` section of a board file into task entries.
fn parse_tasks(text: &str) -> (Vec<Task>, Vec<ParseIssue>) {
    let mut tasks = Vec::new();
    let mut issues = Vec::new();

    let lines: Vec<&str> = text.lines().collect();
    let mut i = 0;
    // Skip to the `## TASKS` section if present; otherwise scan the whole file.
    while i < lines.len() && !lines[i].trim_start().starts_with("## TASKS") {
        i += 1;
    }

    while i < lines.len() {
        let line = lines[i];
        let trimmed = line.trim_start();

        if let Some(rest) = trimmed.strip_prefix("- [") {
            if let Some(close) = rest.find(']') {
                let glyph = &rest[..close];
                let after_glyph = rest[close + 1..].trim_start();

                let Some(marker) = TaskMarker::from_glyph(glyph) else {
                    issues.push(ParseIssue {
                        line: i + 1,
                        message: format!("unrecognised status glyph {glyph:?}"),
                    });
                    i += 1;
                    continue;
                };

                let Some(id) = after_glyph
                    .strip_prefix('[')
                    .and_then(|s| s.find(']').map(|end| s[..end].to_string()))
                else {
                    issues.push(ParseIssue {
                        line: i + 1,
                        message: "missing bracketed task identifier".to_string(),
                    });
                    i += 1;
                    continue;
                };

                if !valid_identifier(&id) {
                    issues.push(ParseIssue {
                        line: i + 1,
                        message: format!("invalid task identifier {id:?}"),
                    });
                    i += 1;
                    continue;
                }

                let mut description = String::new();
                let mut priority = Priority::Medium;
                let mut dependencies = Vec::new();
                let mut scope = Vec::new();
                let mut acceptance_criteria = Vec::new();

                i += 1;
                let mut section: Option<&str> = None;
                while i < lines.len() {
                    let body = lines[i];
                    let body_trimmed = body.trim();
                    if body_trimmed.is_empty() {
                        i += 1;
                        continue;
                    }
                    // A new top-level entry or section header ends this one.
                    if body.trim_start().starts_with("- [") || body.trim_start().starts_with("## ") {
                        break;
                    }
                    if let Some(v) = body_trimmed.strip_prefix("Description:") {
                        description = v.trim().to_string();
                        section = None;
                    } else if let Some(v) = body_trimmed.strip_prefix("Priority:") {
                        priority = Priority::parse(v).unwrap_or(Priority::Medium);
                        section = None;
                    } else if let Some(v) = body_trimmed.strip_prefix("Dependencies:") {
                        let v = v.trim();
                        dependencies = if v.eq_ignore_ascii_case("none") || v.is_empty() {
                            Vec::new()
                        } else {
                            v.split(',').map(|s| s.trim().to_string()).collect()
                        };
                        section = None;
                    } else if body_trimmed.starts_with("Scope:") {
                        section = Some("scope");
                    } else if body_trimmed.starts_with("Acceptance Criteria:") {
                        section = Some("acceptance");
                    } else if let Some(item) = body_trimmed.strip_prefix("- ") {
                        match section {
                            Some("scope") => scope.push(item.trim().to_string()),
                            Some("acceptance") => acceptance_criteria.push(item.trim().to_string()),
                            _ => {}
                        }
                    }
                    i += 1;
                }

                tasks.push(Task {
                    id,
                    status: marker,
                    priority,
                    description,
                    dependencies,
                    scope,
                    acceptance_criteria,
                });
                continue;
            }
        }
        i += 1;
    }

    (tasks, issues)
}

/// Tarjan's strongly-connected-components algorithm restricted to the
/// dependency graph, reporting cycles (SCCs of size > 1) and self-loops.
fn detect_cycles(tasks: &[Task]) -> Vec<Vec<String>> {
    let ids: Vec<&str> = tasks.iter().map(|t| t.id.as_str()).collect();
    let index_of: HashMap<&str, usize> = ids.iter().enumerate().map(|(i, id)| (*id, i)).collect();
    let adj: Vec<Vec<usize>> = tasks
        .iter()
        .map(|t| {
            t.dependencies
                .iter()
                .filter_map(|d| index_of.get(d.as_str()).copied())
                .collect()
        })
        .collect();

    let n = tasks.len();
    let mut index = vec![None; n];
    let mut lowlink = vec![0usize; n];
    let mut on_stack = vec![false; n];
    let mut stack = Vec::new();
    let mut counter = 0usize;
    let mut sccs = Vec::new();

    struct Frame {
        node: usize,
        child_idx: usize,
    }

    for start in 0..n {
        if index[start].is_some() {
            continue;
        }
        let mut call_stack = vec![Frame { node: start, child_idx: 0 }];
        index[start] = Some(counter);
        lowlink[start] = counter;
        counter += 1;
        stack.push(start);
        on_stack[start] = true;

        while let Some(frame) = call_stack.last_mut() {
            let v = frame.node;
            if frame.child_idx < adj[v].len() {
                let w = adj[v][frame.child_idx];
                frame.child_idx += 1;
                if index[w].is_none() {
                    index[w] = Some(counter);
                    lowlink[w] = counter;
                    counter += 1;
                    stack.push(w);
                    on_stack[w] = true;
                    call_stack.push(Frame { node: w, child_idx: 0 });
                } else if on_stack[w] {
                    lowlink[v] = lowlink[v].min(index[w].unwrap());
                }
            } else {
                call_stack.pop();
                if let Some(parent) = call_stack.last() {
                    lowlink[parent.node] = lowlink[parent.node].min(lowlink[v]);
                }
                if lowlink[v] == index[v].unwrap() {
                    let mut scc = Vec::new();
                    loop {
                        let w = stack.pop().unwrap();
                        on_stack[w] = false;
                        scc.push(ids[w].to_string());
                        if w == v {
                            break;
                        }
                    }
                    let is_cycle = scc.len() > 1 || adj[v].contains(&v);
                    if is_cycle {
                        sccs.push(scc);
                    }
                }
            }
        }
    }

    sccs
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SAMPLE: &str = "\
# Board

## TASKS

- [ ] [AUTH-1]
  Description: Implement login
  Priority: HIGH
  Dependencies: none
  Scope:
    - src/auth/
  Acceptance Criteria:
    - returns 200 on success

- [ ] [AUTH-2]
  Description: Implement logout
  Priority: MEDIUM
  Dependencies: AUTH-1

- [x] [UI-1]
  Description: Landing page
  Priority: LOW
  Dependencies: none
";

    #[test]
    fn parses_three_tasks() {
        let (tasks, issues) = parse_tasks(SAMPLE);
        assert!(issues.is_empty(), "unexpected issues: {issues:?}");
        assert_eq!(tasks.len(), 3);
        assert_eq!(tasks[0].id, "AUTH-1");
        assert_eq!(tasks[0].priority, Priority::High);
        assert_eq!(tasks[0].scope, vec!["src/auth/".to_string()]);
        assert_eq!(tasks[1].dependencies, vec!["AUTH-1".to_string()]);
        assert_eq!(tasks[2].status, TaskMarker::Done);
    }

    #[test]
    fn ready_and_blocked_reflect_dependency_state() {
        let board = Board::parse(SAMPLE.as_bytes().to_vec());
        let ready_ids: Vec<&str> = board.ready().iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ready_ids, vec!["AUTH-1"]);
        let blocked_ids: Vec<&str> = board.blocked().iter().map(|t| t.id.as_str()).collect();
        assert_eq!(blocked_ids, vec!["AUTH-2"]);
    }

    #[test]
    fn identifier_validation() {
        assert!(valid_identifier("AUTH-1"));
        assert!(valid_identifier("AB-12"));
        assert!(!valid_identifier("auth-1"));
        assert!(!valid_identifier("A-1"));
        assert!(!valid_identifier("TOOLONGPREFIX-1"));
        assert!(!valid_identifier("AUTH-12345"));
        assert!(!valid_identifier("AUTH1"));
    }

    #[test]
    fn detect_cycles_finds_mutual_dependency() {
        let text = "\
## TASKS

- [ ] [XX-1]
  Description: x
  Priority: LOW
  Dependencies: YY-1

- [ ] [YY-1]
  Description: y
  Priority: LOW
  Dependencies: XX-1
";
        let board = Board::parse(text.as_bytes().to_vec());
        let cycles = board.detect_cycles();
        assert_eq!(cycles.len(), 1);
        let mut members = cycles[0].clone();
        members.sort();
        assert_eq!(members, vec!["XX-1".to_string(), "YY-1".to_string()]);
    }

    #[test]
    fn detect_cycles_empty_for_dag() {
        let board = Board::parse(SAMPLE.as_bytes().to_vec());
        assert!(board.detect_cycles().is_empty());
    }

    #[test]
    fn set_status_updates_glyph_in_place() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("board.md");
        std::fs::write(&path, SAMPLE).unwrap();

        let mut board = Board::load(&path).unwrap();
        board.set_status(&path, "AUTH-1", TaskMarker::InProgress).unwrap();

        let reloaded = Board::load(&path).unwrap();
        assert_eq!(reloaded.get("AUTH-1").unwrap().status, TaskMarker::InProgress);
        // Other tasks are untouched.
        assert_eq!(reloaded.get("AUTH-2").unwrap().status, TaskMarker::Pending);
    }

    #[test]
    fn set_status_detects_concurrent_edit() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("board.md");
        std::fs::write(&path, SAMPLE).unwrap();

        let mut board = Board::load(&path).unwrap();
        // Simulate a concurrent external edit.
        std::fs::write(&path, format!("{SAMPLE}\nextra")).unwrap();

        let err = board.set_status(&path, "AUTH-1", TaskMarker::Done).unwrap_err();
        assert!(matches!(err, BoardError::ConcurrentEdit));
    }

    #[test]
    fn validate_dependencies_rejects_unknown_dep() {
        let text = "\
## TASKS

- [ ] [AA-1]
  Description: x
  Priority: LOW
  Dependencies: BB-9
";
        let board = Board::parse(text.as_bytes().to_vec());
        let err = board.validate_dependencies().unwrap_err();
        assert!(matches!(err, BoardError::UnknownDependency { .. }));
    }
}
