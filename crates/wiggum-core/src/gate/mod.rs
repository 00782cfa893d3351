//! Gate results: the verdict an agent self-reports for one pipeline step,
//! and the result-file (de)serialization that carries it between the
//! sub-agent's process and the pipeline runner.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// The verdict a step produced, reported by the agent itself in its result
/// file rather than computed by the orchestrator running a test command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum GateResult {
    Pass,
    Fail,
    Fix,
    Skip,
    Stop,
}

impl fmt::Display for GateResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pass => "PASS",
            Self::Fail => "FAIL",
            Self::Fix => "FIX",
            Self::Skip => "SKIP",
            Self::Stop => "STOP",
        };
        f.write_str(s)
    }
}

/// The full contents of `<worker>/results/<step-id>-<epoch>.json`, as the
/// sub-agent invocation contract requires the agent to write it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub gate_result: GateResult,
    #[serde(default)]
    pub outputs: Value,
    #[serde(default)]
    pub errors: Vec<String>,
}

impl StepResult {
    /// The synthetic result substituted when the agent exits non-zero
    /// without writing a result file.
    pub fn missing_output() -> Self {
        Self {
            gate_result: GateResult::Fail,
            outputs: Value::Null,
            errors: vec!["missing output".to_string()],
        }
    }

    /// The synthetic result substituted when a step is auto-skipped because
    /// an upstream non-blocking dependency failed.
    pub fn auto_skip(reason: &str) -> Self {
        Self {
            gate_result: GateResult::Skip,
            outputs: Value::Null,
            errors: vec![reason.to_string()],
        }
    }
}

#[derive(Debug, Error)]
pub enum ResultFileError {
    #[error("io error reading result file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed result file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Read and parse a step result file written by a sub-agent.
pub fn read_result_file(path: &Path) -> Result<StepResult, ResultFileError> {
    let bytes = std::fs::read(path).map_err(|e| ResultFileError::Io {
        path: path.display().to_string(),
        source: e,
    })?;
    serde_json::from_slice(&bytes).map_err(|e| ResultFileError::Parse {
        path: path.display().to_string(),
        source: e,
    })
}

/// Truncate a string to at most `max_bytes` bytes, appending "..." if
/// truncated, used to bound error snippets stored in the worker log.
pub fn truncate_snippet(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_owned();
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    let mut truncated = s[..end].to_owned();
    truncated.push_str("...");
    truncated
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn truncate_short_string_unchanged() {
        assert_eq!(truncate_snippet("hello", 10), "hello");
    }

    #[test]
    fn truncate_long_string_with_ellipsis() {
        assert_eq!(truncate_snippet("abcdefghij", 5), "abcde...");
    }

    #[test]
    fn gate_result_round_trips_through_json() {
        let result = StepResult {
            gate_result: GateResult::Fix,
            outputs: json!({"attempted": true}),
            errors: vec!["flaky test".into()],
        };
        let text = serde_json::to_string(&result).unwrap();
        assert!(text.contains("\"FIX\""));
        let parsed: StepResult = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed.gate_result, GateResult::Fix);
    }

    #[test]
    fn read_result_file_parses_disk_contents() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("build-0.json");
        std::fs::write(&path, r#"{"gate_result":"PASS","outputs":{},"errors":[]}"#).unwrap();
        let result = read_result_file(&path).unwrap();
        assert_eq!(result.gate_result, GateResult::Pass);
    }

    #[test]
    fn read_result_file_missing_is_io_error() {
        let dir = TempDir::new().unwrap();
        let err = read_result_file(&dir.path().join("absent.json")).unwrap_err();
        assert!(matches!(err, ResultFileError::Io { .. }));
    }
}
