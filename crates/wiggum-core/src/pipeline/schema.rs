//! JSON schema for the pipeline definition file.

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::gate::GateResult;

fn default_false() -> bool {
    false
}

fn default_true() -> bool {
    true
}

fn default_config() -> Value {
    Value::Object(serde_json::Map::new())
}

/// A step's retry policy: when its gate result matches `on`, the step may
/// be re-run (after invoking `fix_agent`) up to `max` times.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub on: GateResult,
    pub max: u32,
    pub fix_agent: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    pub agent: String,
    #[serde(default = "default_false")]
    pub readonly: bool,
    #[serde(default = "default_true")]
    pub blocking: bool,
    #[serde(default)]
    pub enabled_by: Option<String>,
    #[serde(default)]
    pub depends_on: Option<String>,
    #[serde(default = "default_config")]
    pub config: Value,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    pub name: String,
    pub steps: Vec<Step>,
}

#[derive(Debug, Error)]
pub enum PipelineParseError {
    #[error("io error reading pipeline file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed pipeline json at {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("step {step:?} depends_on unknown step {depends_on:?}")]
    UnknownDependsOn { step: String, depends_on: String },
    #[error("duplicate step id {0:?}")]
    DuplicateStepId(String),
}

impl Pipeline {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn load(path: &Path) -> Result<Self, PipelineParseError> {
        let text = std::fs::read_to_string(path).map_err(|e| PipelineParseError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        let pipeline: Pipeline = serde_json::from_str(&text).map_err(|e| PipelineParseError::Json {
            path: path.display().to_string(),
            source: e,
        })?;
        pipeline.validate()?;
        Ok(pipeline)
    }

    /// Validate that `depends_on` edges reference real, earlier steps and
    /// that step identifiers are unique.
    pub fn validate(&self) -> Result<(), PipelineParseError> {
        let mut seen = std::collections::HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.id.as_str()) {
                return Err(PipelineParseError::DuplicateStepId(step.id.clone()));
            }
        }
        for step in &self.steps {
            if let Some(dep) = &step.depends_on {
                if !seen.contains(dep.as_str()) {
                    return Err(PipelineParseError::UnknownDependsOn {
                        step: step.id.clone(),
                        depends_on: dep.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }
}
