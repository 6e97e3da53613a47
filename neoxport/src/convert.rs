//! End-to-end conversion of a pipeline-parallel checkpoint directory into a
//! single-file model directory.

use std::path::PathBuf;

use thiserror::Error;

use crate::{
    config::{ConfigError, DestinationConfig, SourceConfig},
    model::{GptNeoxForCausalLm, LoadReport, ModelError},
    remapper::{RemapError, Remapper, ShardKind, ShardLayout, TorchShardDirectory},
};

#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
    #[error("Remap error: {0}")]
    Remap(#[from] RemapError),
    #[error("Model error: {0}")]
    Model(#[from] ModelError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionRequest {
    /// Directory with the shard files and the `configs/` subdirectory.
    pub checkpoint_dir: PathBuf,
    /// JSON config of the destination model.
    pub destination_config_path: PathBuf,
    /// Output directory; created if missing.
    pub save_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionReport {
    pub num_layers: usize,
    /// Number of tensors in the remapped state mapping.
    pub num_tensors: usize,
    pub load_report: LoadReport,
}

/// Runs the whole conversion. Nothing is written to `save_dir` unless every
/// shard was remapped and the destination model accepted the result.
pub fn convert<F>(
    request: &ConversionRequest,
    on_shard: F,
) -> Result<ConversionReport, ConvertError>
where
    F: FnMut(ShardKind),
{
    let source_config = SourceConfig::load_from_checkpoint_dir(&request.checkpoint_dir)?;
    let num_layers = source_config.num_layers()?;
    tracing::info!("Source checkpoint has {num_layers} layers");

    let layout = ShardLayout::new(num_layers);
    let remapper = Remapper::new(TorchShardDirectory::new(&request.checkpoint_dir));
    let mapping = remapper.remap_with(&layout, on_shard)?;
    let num_tensors = mapping.len();

    let destination_config = DestinationConfig::from_json_file(&request.destination_config_path)?;
    let mut model = GptNeoxForCausalLm::from_config(destination_config)?;
    let load_report = model.load_state_dict(mapping, false)?;
    if !load_report.is_exact() {
        tracing::warn!(
            "Loaded with {} missing and {} unexpected keys",
            load_report.missing_keys.len(),
            load_report.unexpected_keys.len()
        );
    }

    model.save_pretrained(&request.save_dir)?;

    Ok(ConversionReport {
        num_layers,
        num_tensors,
        load_report,
    })
}
