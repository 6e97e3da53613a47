//! Pipeline-stage numbering of the shard files.
//!
//! The training framework numbers every pipeline stage, including stages
//! that own no parameters, so the numbering has holes:
//!
//! | shard     | content                          |
//! |-----------|----------------------------------|
//! | 0         | word embedding                   |
//! | 1         | reserved, never read             |
//! | 2 ..= L+1 | transformer blocks 0 ..= L-1     |
//! | L+2       | reserved, never read             |
//! | L+3       | final layer norm                 |
//! | L+4       | output head                      |
//!
//! The reserved slots belong to parameter-free stages. They are part of the
//! on-disk contract and must stay skipped.

use std::fmt;

pub const EMBEDDING_SHARD: usize = 0;
pub const FIRST_BLOCK_SHARD: usize = 2;
/// Offset from the layer count to the final norm shard.
pub const FINAL_NORM_OFFSET: usize = 3;
/// Offset from the layer count to the output head shard.
pub const HEAD_OFFSET: usize = 4;

/// Reserved slot between the embedding and the first block.
pub const PRE_BLOCKS_RESERVED_SHARD: usize = 1;
/// Offset from the layer count to the reserved slot after the last block.
pub const POST_BLOCKS_RESERVED_OFFSET: usize = 2;

pub fn shard_file_name(index: usize) -> String {
    format!("layer_{index:02}-model_00-model_states.pt")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShardKind {
    Embedding,
    Block(usize),
    FinalNorm,
    Head,
}

impl fmt::Display for ShardKind {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        match self {
            ShardKind::Embedding => write!(f, "embedding"),
            ShardKind::Block(block) => write!(f, "block {block}"),
            ShardKind::FinalNorm => write!(f, "final norm"),
            ShardKind::Head => write!(f, "head"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardLayout {
    num_layers: usize,
}

impl ShardLayout {
    pub fn new(num_layers: usize) -> Self {
        Self {
            num_layers,
        }
    }

    pub fn num_layers(&self) -> usize {
        self.num_layers
    }

    /// Number of shards read for a conversion.
    pub fn num_shards(&self) -> usize {
        self.num_layers + 3
    }

    pub fn shard_index(
        &self,
        kind: ShardKind,
    ) -> usize {
        match kind {
            ShardKind::Embedding => EMBEDDING_SHARD,
            ShardKind::Block(block) => FIRST_BLOCK_SHARD + block,
            ShardKind::FinalNorm => self.num_layers + FINAL_NORM_OFFSET,
            ShardKind::Head => self.num_layers + HEAD_OFFSET,
        }
    }

    pub fn reserved_shards(&self) -> [usize; 2] {
        [PRE_BLOCKS_RESERVED_SHARD, self.num_layers + POST_BLOCKS_RESERVED_OFFSET]
    }

    /// Shards in the order they are consumed.
    pub fn plan(&self) -> impl Iterator<Item = ShardKind> + use<> {
        std::iter::once(ShardKind::Embedding)
            .chain((0..self.num_layers).map(ShardKind::Block))
            .chain([ShardKind::FinalNorm, ShardKind::Head])
    }
}
