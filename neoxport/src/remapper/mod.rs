//! Rewrites a pipeline-parallel GPT-NeoX checkpoint into flat destination
//! parameter names.

mod error;
pub mod layout;
pub mod rename_table;
mod source;
mod state;

pub use error::RemapError;
pub use layout::{ShardKind, ShardLayout};
pub use source::{MemoryShards, ShardSource, ShardTensors, TorchShardDirectory};
pub use state::StateMapping;

use rename_table::{destination_key, is_dropped_buffer, rules_for};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemapOptions {
    /// Fail on source tensors the rename table does not know about instead
    /// of skipping them. Off by default.
    pub strict: bool,
}

pub struct Remapper<S: ShardSource> {
    source: S,
    options: RemapOptions,
}

impl<S: ShardSource> Remapper<S> {
    pub fn new(source: S) -> Self {
        Self::with_options(source, RemapOptions::default())
    }

    pub fn with_options(
        source: S,
        options: RemapOptions,
    ) -> Self {
        Self {
            source,
            options,
        }
    }

    pub fn remap(
        &self,
        layout: &ShardLayout,
    ) -> Result<StateMapping, RemapError> {
        self.remap_with(layout, |_| {})
    }

    /// Same as [`Remapper::remap`], calling `on_shard` after each shard has
    /// been consumed.
    pub fn remap_with<F>(
        &self,
        layout: &ShardLayout,
        mut on_shard: F,
    ) -> Result<StateMapping, RemapError>
    where
        F: FnMut(ShardKind),
    {
        let mut mapping = StateMapping::new();
        for kind in layout.plan() {
            self.remap_shard(layout, kind, &mut mapping)?;
            on_shard(kind);
        }
        tracing::info!(
            "Remapped {} tensors from {} shards",
            mapping.len(),
            layout.num_shards()
        );
        Ok(mapping)
    }

    /// Reads one shard and moves its tensors into `mapping` under their
    /// destination names.
    pub fn remap_shard(
        &self,
        layout: &ShardLayout,
        kind: ShardKind,
        mapping: &mut StateMapping,
    ) -> Result<(), RemapError> {
        let index = layout.shard_index(kind);
        let mut tensors = self.source.read_shard(index)?;

        for rule in rules_for(kind) {
            let tensor = tensors.shift_remove(rule.source).ok_or_else(|| RemapError::MissingKey {
                kind,
                index,
                key: rule.source.to_string(),
            })?;
            mapping.insert(destination_key(kind, rule), tensor)?;
        }

        for key in tensors.keys() {
            if is_dropped_buffer(kind, key) {
                tracing::debug!("Dropping buffer \"{key}\" of {kind} shard {index}");
            } else if self.options.strict {
                return Err(RemapError::UnexpectedSourceKey {
                    kind,
                    index,
                    key: key.clone(),
                });
            } else {
                tracing::debug!("Ignoring unmapped tensor \"{key}\" of {kind} shard {index}");
            }
        }
        Ok(())
    }
}
