use indexmap::{IndexMap, map::Entry};

use super::RemapError;
use crate::Tensor;

/// Destination parameter name to tensor, in insertion order.
///
/// A key can be written once; the remapper relies on this to never lose a
/// shard's contribution to a later overwrite.
#[derive(Debug, Default)]
pub struct StateMapping {
    tensors: IndexMap<String, Tensor>,
}

impl StateMapping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &mut self,
        key: String,
        tensor: Tensor,
    ) -> Result<(), RemapError> {
        match self.tensors.entry(key) {
            Entry::Occupied(entry) => Err(RemapError::DuplicateKey(entry.key().clone())),
            Entry::Vacant(entry) => {
                entry.insert(tensor);
                Ok(())
            },
        }
    }

    pub fn get(
        &self,
        key: &str,
    ) -> Option<&Tensor> {
        self.tensors.get(key)
    }

    pub fn contains_key(
        &self,
        key: &str,
    ) -> bool {
        self.tensors.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Tensor)> {
        self.tensors.iter().map(|(key, tensor)| (key.as_str(), tensor))
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }
}

impl IntoIterator for StateMapping {
    type Item = (String, Tensor);
    type IntoIter = indexmap::map::IntoIter<String, Tensor>;

    fn into_iter(self) -> Self::IntoIter {
        self.tensors.into_iter()
    }
}
