use std::{collections::BTreeMap, fs::File, os::unix::fs::FileExt};

use thiserror::Error;

use super::header::{HeaderError, SafetensorsHeader, TensorEntry};
use crate::{Tensor, TensorError};

#[derive(Debug, Error)]
pub enum ParameterLoaderError {
    #[error("Array with key \"{0}\" not found.")]
    KeyNotFound(String),
    #[error(transparent)]
    Header(#[from] HeaderError),
    #[error(transparent)]
    Tensor(#[from] TensorError),
    #[error("Failed to read data: {0}")]
    Io(#[from] std::io::Error),
}

/// Random-access reader over a safetensors file. Tensors are read one at a
/// time, on request.
pub struct ParameterLoader<'file> {
    file: &'file File,
    data_start: usize,
    header: SafetensorsHeader,
}

impl<'file> ParameterLoader<'file> {
    pub fn new(file: &'file File) -> Result<Self, ParameterLoaderError> {
        let (header, data_start) = SafetensorsHeader::read(file)?;
        Ok(Self {
            file,
            data_start,
            header,
        })
    }

    /// Tensor names in lexicographic order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.header.tensors.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.header.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.header.tensors.is_empty()
    }

    pub fn metadata(&self) -> Option<&BTreeMap<String, String>> {
        self.header.metadata.as_ref()
    }

    pub fn entry(
        &self,
        key: &str,
    ) -> Option<&TensorEntry> {
        self.header.tensors.get(key)
    }

    pub fn get(
        &self,
        key: &str,
    ) -> Result<Tensor, ParameterLoaderError> {
        let entry = self.entry(key).ok_or_else(|| ParameterLoaderError::KeyNotFound(key.to_string()))?;
        let mut data = vec![0u8; entry.byte_len()];
        self.file.read_exact_at(&mut data, (self.data_start + entry.data_offsets.0) as u64)?;
        Ok(Tensor::new(entry.dtype, entry.shape.clone(), data)?)
    }
}
