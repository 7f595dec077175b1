//! Error types for slurm-node-setup

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Main error type for node setup operations
#[derive(Error, Debug)]
pub enum SetupError {
    /// The config store is reachable but holds no usable document yet
    #[error("Configuration not ready: {0}")]
    ConfigNotReady(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Command '{command}' did not complete within {}s", timeout.as_secs())]
    CommandTimeout {
        command: String,
        timeout: Duration,
        stdout: String,
        stderr: String,
    },

    #[error("Command '{command}' failed with return code {}", code.map_or_else(|| "none".to_string(), |c| c.to_string()))]
    CommandFailed {
        command: String,
        code: Option<i32>,
        stdout: String,
        stderr: String,
    },

    #[error("Resource error at {}: {message}", path.display())]
    Resource { path: PathBuf, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Template error: {0}")]
    Template(#[from] minijinja::Error),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),
}

impl SetupError {
    /// Create a resource error for a path
    pub fn resource(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Resource {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl From<reqwest::Error> for SetupError {
    fn from(e: reqwest::Error) -> Self {
        Self::Http(e.to_string())
    }
}
