use std::path::PathBuf;

use thiserror::Error;

use super::layout::ShardKind;
use crate::torch_checkpoint::TorchCheckpointError;

#[derive(Debug, Error)]
pub enum RemapError {
    #[error("Failed to read shard {index} ({path}): {source}")]
    Shard {
        index: usize,
        path: PathBuf,
        source: TorchCheckpointError,
    },
    #[error("Shard {index} not found")]
    ShardNotFound {
        index: usize,
    },
    #[error("Tensor \"{key}\" missing from {kind} shard {index}")]
    MissingKey {
        kind: ShardKind,
        index: usize,
        key: String,
    },
    #[error("Unexpected tensor \"{key}\" in {kind} shard {index}")]
    UnexpectedSourceKey {
        kind: ShardKind,
        index: usize,
        key: String,
    },
    #[error("Destination key \"{0}\" written twice")]
    DuplicateKey(String),
}
