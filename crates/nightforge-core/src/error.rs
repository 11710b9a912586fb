use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Configuration defects, surfaced eagerly at load time so a bad document
/// aborts the run before any pipeline starts.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config from {path}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config at {path}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("duplicate application name '{name}'")]
    DuplicateApp { name: String },

    #[error("application '{app}': {field} must not be empty")]
    EmptyField { app: String, field: &'static str },

    #[error("application '{app}': mode is nightly but version_cmd is not set")]
    MissingVersionCmd { app: String },

    #[error("application '{app}': port and inner_port must be set together")]
    IncompletePortPair { app: String },

    #[error("invalid port forward '{value}': expected host:hostPort:containerPort")]
    InvalidPortForward { value: String },

    #[error("invalid volume '{value}': expected hostPath:containerPath:mode with mode ro|rw")]
    InvalidVolume { value: String },

    #[error("options.tries must be at least 1")]
    ZeroTries,
}
