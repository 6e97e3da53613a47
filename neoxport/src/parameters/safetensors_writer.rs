use std::{
    collections::BTreeMap,
    fs::File,
    io::{BufWriter, Write},
    path::Path,
};

use thiserror::Error;

use super::header::{SafetensorsHeader, TensorEntry};
use crate::DataType;

#[derive(Debug, Error)]
pub enum SafetensorsWriteError {
    #[error("Failed to write safetensors file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Tensor \"{name}\" has {actual} data bytes but its shape and dtype need {expected}")]
    InvalidTensorData {
        name: String,
        expected: usize,
        actual: usize,
    },
    #[error("Tensor \"{0}\" appears more than once")]
    DuplicateTensor(String),
    #[error("Header could not be encoded as JSON: {0}")]
    HeaderJson(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy)]
pub struct SafetensorView<'a> {
    pub name: &'a str,
    pub dtype: DataType,
    pub shape: &'a [usize],
    pub data: &'a [u8],
}

/// Writes `tensors` into a single safetensors file.
///
/// Data is laid out in the order given; the header is keyed by name. The same
/// input always produces the same bytes.
pub fn write_safetensors(
    path: &Path,
    tensors: &[SafetensorView<'_>],
    metadata: Option<BTreeMap<String, String>>,
) -> Result<(), SafetensorsWriteError> {
    let header = build_header(tensors, metadata)?;

    let mut writer = BufWriter::new(File::create(path)?);
    writer.write_all(&(header.len() as u64).to_le_bytes())?;
    writer.write_all(&header)?;
    for tensor in tensors {
        writer.write_all(tensor.data)?;
    }
    writer.flush()?;
    Ok(())
}

fn build_header(
    tensors: &[SafetensorView<'_>],
    metadata: Option<BTreeMap<String, String>>,
) -> Result<Vec<u8>, SafetensorsWriteError> {
    let mut header = SafetensorsHeader {
        metadata,
        tensors: BTreeMap::new(),
    };

    let mut offset = 0;
    for tensor in tensors {
        let numel: usize = tensor.shape.iter().product();
        let expected = numel * tensor.dtype.size_in_bytes();
        if tensor.data.len() != expected {
            return Err(SafetensorsWriteError::InvalidTensorData {
                name: tensor.name.to_string(),
                expected,
                actual: tensor.data.len(),
            });
        }

        let entry = TensorEntry {
            dtype: tensor.dtype,
            shape: tensor.shape.to_vec(),
            data_offsets: (offset, offset + expected),
        };
        offset += expected;
        if header.tensors.insert(tensor.name.to_string(), entry).is_some() {
            return Err(SafetensorsWriteError::DuplicateTensor(tensor.name.to_string()));
        }
    }

    Ok(header.to_padded_json()?)
}
