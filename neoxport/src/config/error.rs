use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse YAML config {path}: {source}")]
    Yaml {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error("Failed to parse JSON config {path}: {source}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("YAML config {0} is not a mapping")]
    NotAMapping(PathBuf),
    #[error("Missing required field: {0}")]
    MissingField(String),
    #[error("Field {field} must be a non-negative integer")]
    InvalidInteger {
        field: String,
    },
    #[error("Unsupported torch_dtype {0:?}")]
    UnsupportedDtype(String),
}
