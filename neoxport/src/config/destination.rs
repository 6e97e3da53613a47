use std::{fs, path::Path};

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use super::ConfigError;
use crate::DataType;

/// Hyperparameters of the destination causal LM that decide which
/// parameters it owns and their shapes.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
pub struct DestinationModelConfig {
    #[serde(alias = "n_layer")]
    pub num_hidden_layers: usize,
    #[serde(alias = "n_embd")]
    pub hidden_size: usize,
    pub vocab_size: usize,
    #[serde(default, alias = "n_inner")]
    pub intermediate_size: Option<usize>,
    #[serde(default)]
    pub torch_dtype: Option<String>,
}

impl DestinationModelConfig {
    /// `None` when the default `4 * hidden_size` overflows.
    pub fn intermediate_size(&self) -> Option<usize> {
        self.intermediate_size.or_else(|| self.hidden_size.checked_mul(4))
    }

    /// Element type used for parameters the checkpoint does not supply.
    pub fn parameter_dtype(&self) -> Result<DataType, ConfigError> {
        match &self.torch_dtype {
            None => Ok(DataType::F32),
            Some(name) => DataType::from_torch_name(name)
                .ok_or_else(|| ConfigError::UnsupportedDtype(name.clone())),
        }
    }
}

/// The destination configuration file, parsed and kept verbatim so that it
/// can be written next to the converted weights.
#[derive(Debug, Clone, PartialEq)]
pub struct DestinationConfig {
    pub model: DestinationModelConfig,
    pub raw: Json,
}

impl DestinationConfig {
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&text).map_err(|source| ConfigError::Json {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_json_str(text: &str) -> Result<Self, serde_json::Error> {
        let raw: Json = serde_json::from_str(text)?;
        let model = DestinationModelConfig::deserialize(&raw)?;
        Ok(Self {
            model,
            raw,
        })
    }

    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&self.raw)
    }
}
