use std::{
    fs,
    path::{Path, PathBuf},
};

use serde_yaml::{Mapping, Value};

use super::ConfigError;

pub const CONFIGS_DIR_NAME: &str = "configs";
pub const CONFIG_EXTENSION: &str = "yml";
pub const NUM_LAYERS_KEY: &str = "num-layers";

/// Training configuration saved next to the checkpoint shards.
///
/// The training run splits its configuration over several YAML files; their
/// top-level keys are merged into one mapping.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SourceConfig {
    values: Mapping,
}

impl SourceConfig {
    /// Loads `<checkpoint_dir>/configs/*.yml`.
    pub fn load_from_checkpoint_dir(checkpoint_dir: &Path) -> Result<Self, ConfigError> {
        Self::load_dir(&checkpoint_dir.join(CONFIGS_DIR_NAME))
    }

    /// Files are merged in file-name order; on a key collision the later
    /// file wins.
    pub fn load_dir(config_dir: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        for path in config_files(config_dir)? {
            tracing::debug!("Merging source config {}", path.display());
            let text = fs::read_to_string(&path).map_err(|source| ConfigError::Io {
                path: path.clone(),
                source,
            })?;
            config.merge_yaml(&path, &text)?;
        }
        Ok(config)
    }

    fn merge_yaml(
        &mut self,
        path: &Path,
        text: &str,
    ) -> Result<(), ConfigError> {
        let value: Value = serde_yaml::from_str(text).map_err(|source| ConfigError::Yaml {
            path: path.to_path_buf(),
            source,
        })?;
        match value {
            Value::Mapping(mapping) => {
                self.values.extend(mapping);
                Ok(())
            },
            // An empty file parses as null and contributes nothing.
            Value::Null => Ok(()),
            _ => Err(ConfigError::NotAMapping(path.to_path_buf())),
        }
    }

    pub fn get(
        &self,
        key: &str,
    ) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// The number of transformer blocks, `num-layers`.
    pub fn num_layers(&self) -> Result<usize, ConfigError> {
        let value = self
            .get(NUM_LAYERS_KEY)
            .ok_or_else(|| ConfigError::MissingField(NUM_LAYERS_KEY.to_string()))?;
        value
            .as_u64()
            .and_then(|n| usize::try_from(n).ok())
            .ok_or_else(|| ConfigError::InvalidInteger {
                field: NUM_LAYERS_KEY.to_string(),
            })
    }
}

fn config_files(config_dir: &Path) -> Result<Vec<PathBuf>, ConfigError> {
    let entries = fs::read_dir(config_dir).map_err(|source| ConfigError::Io {
        path: config_dir.to_path_buf(),
        source,
    })?;
    let mut files = Vec::new();
    for entry in entries {
        let path = entry
            .map_err(|source| ConfigError::Io {
                path: config_dir.to_path_buf(),
                source,
            })?
            .path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == CONFIG_EXTENSION) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}
