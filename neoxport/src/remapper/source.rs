use std::{
    cell::RefCell,
    collections::HashMap,
    path::{Path, PathBuf},
};

use indexmap::IndexMap;

use super::{RemapError, layout::shard_file_name};
use crate::{
    Tensor,
    torch_checkpoint::{TorchCheckpoint, TorchCheckpointError},
};

/// Every tensor of one shard, by source name.
pub type ShardTensors = IndexMap<String, Tensor>;

/// Something that can hand out the full contents of a shard by index.
pub trait ShardSource {
    fn read_shard(
        &self,
        index: usize,
    ) -> Result<ShardTensors, RemapError>;
}

/// Shard files `layer_NN-model_00-model_states.pt` in one directory.
#[derive(Debug, Clone)]
pub struct TorchShardDirectory {
    dir: PathBuf,
}

impl TorchShardDirectory {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
        }
    }

    pub fn shard_path(
        &self,
        index: usize,
    ) -> PathBuf {
        self.dir.join(shard_file_name(index))
    }
}

impl ShardSource for TorchShardDirectory {
    fn read_shard(
        &self,
        index: usize,
    ) -> Result<ShardTensors, RemapError> {
        let path = self.shard_path(index);
        tracing::debug!("Reading shard {}", path.display());
        read_torch_shard(&path).map_err(|source| RemapError::Shard {
            index,
            path,
            source,
        })
    }
}

fn read_torch_shard(path: &Path) -> Result<ShardTensors, TorchCheckpointError> {
    let mut checkpoint = TorchCheckpoint::open_from_path(path)?;
    checkpoint.load_all()
}

/// Shards held in memory, mostly for tests and for callers that already
/// decoded the checkpoint some other way.
#[derive(Debug, Default)]
pub struct MemoryShards {
    shards: RefCell<HashMap<usize, ShardTensors>>,
}

impl MemoryShards {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &mut self,
        index: usize,
        tensors: ShardTensors,
    ) {
        self.shards.get_mut().insert(index, tensors);
    }
}

impl ShardSource for MemoryShards {
    /// Hands the shard out by move; reading it twice fails like a missing file.
    fn read_shard(
        &self,
        index: usize,
    ) -> Result<ShardTensors, RemapError> {
        self.shards.borrow_mut().remove(&index).ok_or(RemapError::ShardNotFound {
            index,
        })
    }
}
