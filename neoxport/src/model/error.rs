use thiserror::Error;

use crate::{config::ConfigError, parameters::SafetensorsWriteError};

#[derive(Debug, Error)]
pub enum ModelError {
    #[error(
        "Size mismatch for {key}: copying a param with shape {supplied:?} from checkpoint, \
        the shape in current model is {expected:?}."
    )]
    ShapeMismatch {
        key: String,
        supplied: Box<[usize]>,
        expected: Box<[usize]>,
    },
    #[error(
        "Error(s) in loading state_dict: missing keys {missing_keys:?}, unexpected keys {unexpected_keys:?}"
    )]
    StrictLoad {
        missing_keys: Vec<String>,
        unexpected_keys: Vec<String>,
    },
    #[error("Config dimensions are too large: {0} overflows")]
    OversizedConfig(&'static str),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to serialize config: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Write(#[from] SafetensorsWriteError),
}
