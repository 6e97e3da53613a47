//! The header at the front of a safetensors file: a little-endian `u64`
//! length followed by that many bytes of JSON, space-padded so that tensor
//! data starts 8-byte aligned.

use std::{collections::BTreeMap, fs::File, os::unix::fs::FileExt};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::DataType;

const LENGTH_PREFIX_SIZE: usize = size_of::<u64>();
const ALIGNMENT: usize = 8;
const MAX_HEADER_SIZE: u64 = 100_000_000;

#[derive(Debug, Error)]
pub enum HeaderError {
    #[error("Failed to read header: {0}")]
    Io(#[from] std::io::Error),
    #[error("Header length {0} exceeds the {MAX_HEADER_SIZE} byte limit")]
    TooLarge(u64),
    #[error("Header is not valid UTF-8")]
    NotUtf8,
    #[error("Header is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Where one tensor's bytes live, relative to the end of the header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorEntry {
    pub dtype: DataType,
    pub shape: Vec<usize>,
    pub data_offsets: (usize, usize),
}

impl TensorEntry {
    pub fn byte_len(&self) -> usize {
        self.data_offsets.1.saturating_sub(self.data_offsets.0)
    }
}

/// Tensors are keyed by name in a `BTreeMap`, which makes the serialized
/// header independent of insertion order.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetensorsHeader {
    #[serde(rename = "__metadata__", default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<BTreeMap<String, String>>,
    #[serde(flatten)]
    pub tensors: BTreeMap<String, TensorEntry>,
}

impl SafetensorsHeader {
    /// Reads the header of `file`. Also returns the file offset at which
    /// tensor data begins.
    pub fn read(file: &File) -> Result<(Self, usize), HeaderError> {
        let mut length_bytes = [0u8; LENGTH_PREFIX_SIZE];
        file.read_exact_at(&mut length_bytes, 0)?;
        let length = u64::from_le_bytes(length_bytes);
        if length > MAX_HEADER_SIZE {
            return Err(HeaderError::TooLarge(length));
        }

        let mut json = vec![0u8; length as usize];
        file.read_exact_at(&mut json, LENGTH_PREFIX_SIZE as u64)?;
        let text = std::str::from_utf8(&json).map_err(|_| HeaderError::NotUtf8)?;
        let header = serde_json::from_str(text)?;
        Ok((header, LENGTH_PREFIX_SIZE + json.len()))
    }

    /// JSON bytes padded with trailing spaces to the data alignment.
    pub fn to_padded_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        let mut bytes = serde_json::to_vec(self)?;
        let padding = bytes.len().next_multiple_of(ALIGNMENT) - bytes.len();
        bytes.extend(std::iter::repeat_n(b' ', padding));
        Ok(bytes)
    }
}
