use std::{fmt, path::PathBuf};

use thiserror::Error;

pub type Result<T> = std::result::Result<T, TrainingError>;

/// A single configuration problem, tied to the dotted field that caused it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigIssue {
    pub field: String,
    pub message: String,
}

impl ConfigIssue {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

#[derive(Error, Debug)]
pub enum TrainingError {
    #[error("invalid configuration: {}", join_issues(.0))]
    Configuration(Vec<ConfigIssue>),

    #[error("checkpoint not found at {}", .path.display())]
    CheckpointNotFound { path: PathBuf },

    #[error("incompatible checkpoint: {0}")]
    IncompatibleCheckpoint(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    ConfigFormat(String),

    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    #[error("training failed: {0}")]
    Runtime(String),
}

impl TrainingError {
    pub fn configuration(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Configuration(vec![ConfigIssue::new(field, message)])
    }

    pub fn incompatible(message: impl Into<String>) -> Self {
        Self::IncompatibleCheckpoint(message.into())
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }

    /// Issues carried by a configuration error, empty for every other kind.
    pub fn issues(&self) -> &[ConfigIssue] {
        match self {
            TrainingError::Configuration(issues) => issues,
            _ => &[],
        }
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, TrainingError::Configuration(_))
    }
}

impl From<toml::de::Error> for TrainingError {
    fn from(value: toml::de::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

impl From<serde_json::Error> for TrainingError {
    fn from(value: serde_json::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

fn join_issues(issues: &[ConfigIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
