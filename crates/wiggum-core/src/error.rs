//! Error category taxonomy used by the top-level CLI error handler to pick
//! an exit code: a configuration-category error exits 2, anything else that
//! escapes the scheduler loop exits 1.

use thiserror::Error;

/// The broad category an error falls into, per the error-handling design:
/// configuration errors are reported and the scheduler continues with the
/// remainder of the board; every other category is handled inline by the
/// scheduler tick body and should not normally reach the CLI boundary.
#[derive(Debug, Error)]
pub enum WiggumError {
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Configuration-category errors: bad pipeline JSON, cyclic dependencies,
/// unparseable project config. Reported once; does not abort the whole run.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("malformed pipeline definition at {path}: {source}")]
    Pipeline {
        path: std::path::PathBuf,
        #[source]
        source: crate::pipeline::PipelineParseError,
    },

    #[error("cyclic dependency detected among tasks: {0:?}")]
    CyclicDependency(Vec<String>),

    #[error("project config at {path} could not be parsed: {source}")]
    ProjectConfig {
        path: std::path::PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

impl WiggumError {
    /// Configuration errors exit 2; everything else exits 1.
    pub fn exit_code(&self) -> i32 {
        match self {
            WiggumError::Configuration(_) => 2,
            WiggumError::Other(_) => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_errors_exit_2() {
        let err = WiggumError::Configuration(ConfigurationError::CyclicDependency(vec!["AUTH-1".into(), "AUTH-2".into()]));
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn other_errors_exit_1() {
        let err = WiggumError::Other(anyhow::anyhow!("boom"));
        assert_eq!(err.exit_code(), 1);
    }
}
