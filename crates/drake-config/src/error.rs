//! Configuration loading errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error(
        "pipeline \"{pipeline}\" stage {stage} (zero-indexed) depends on \
         undefined target \"{target}\""
    )]
    UndefinedTarget {
        pipeline: String,
        stage: usize,
        target: String,
    },

    #[error("target \"{0}\" not found")]
    TargetNotFound(String),

    #[error("pipeline \"{0}\" not found")]
    PipelineNotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ConfigError> for drake_core::Error {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::TargetNotFound(name) => {
                drake_core::Error::NotFound(format!("target \"{name}\""))
            }
            ConfigError::PipelineNotFound(name) => {
                drake_core::Error::NotFound(format!("pipeline \"{name}\""))
            }
            other => drake_core::Error::Config(other.to_string()),
        }
    }
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;
