//! Reader for checkpoints written by `torch.save` in the zip container format.
//!
//! An archive holds `<root>/data.pkl`, one `<root>/data/<key>` member per
//! storage and usually a `<root>/byteorder` marker. `<root>` is `archive` in
//! recent torch versions and the file stem in older ones.

mod pickle;

use std::{
    collections::{HashMap, hash_map::Entry},
    fs::File,
    io::{self, Read, Seek},
    ops::Range,
    path::Path,
};

use indexmap::IndexMap;
use thiserror::Error;
use zip::{ZipArchive, result::ZipError};

pub use self::pickle::{PickleError, storage_data_type};
use crate::{DataType, Tensor, TensorError};

const ZIP_MAGIC: [u8; 4] = *b"PK\x03\x04";
const DATA_PKL: &str = "data.pkl";
const BYTE_ORDER: &str = "byteorder";

#[derive(Debug, Error)]
pub enum TorchCheckpointError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Zip error: {0}")]
    Zip(#[from] ZipError),
    #[error("Invalid {DATA_PKL}: {0}")]
    Pickle(#[from] PickleError),
    #[error("Not a zip checkpoint; the legacy torch serialization format is not supported")]
    LegacyFormat,
    #[error("Archive has no <root>/{DATA_PKL} member")]
    MissingDataPickle,
    #[error("Checkpoint byte order is {0:?}, only \"little\" is supported")]
    UnsupportedByteOrder(String),
    #[error("Tensor \"{0}\" not found in checkpoint")]
    TensorNotFound(String),
    #[error("Tensor \"{name}\" is a strided view (shape {shape:?}, stride {stride:?})")]
    NonContiguousTensor {
        name: String,
        shape: Box<[usize]>,
        stride: Box<[usize]>,
    },
    #[error("Tensor \"{name}\" needs bytes {range:?} of a {storage_len} byte storage")]
    TensorOutOfBounds {
        name: String,
        range: Range<usize>,
        storage_len: usize,
    },
    #[error("Tensor \"{name}\": {source}")]
    Tensor {
        name: String,
        source: TensorError,
    },
}

/// Where a tensor lives inside the archive, as described by the pickle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorchTensorSpec {
    pub dtype: DataType,
    pub shape: Box<[usize]>,
    pub stride: Box<[usize]>,
    pub storage_key: String,
    pub storage_offset_elems: usize,
}

impl TorchTensorSpec {
    pub fn num_elements(&self) -> usize {
        self.shape.iter().product()
    }

    /// Strides of size-one axes never address a second element, so they
    /// are not compared.
    fn is_contiguous(&self) -> bool {
        if self.num_elements() <= 1 {
            return true;
        }
        self.stride.len() == self.shape.len()
            && contiguous_stride(&self.shape)
                .iter()
                .zip(self.shape.iter().zip(self.stride.iter()))
                .all(|(expected, (&dim, actual))| dim == 1 || actual == expected)
    }
}

/// Tensor specs keyed by parameter name, in pickle order.
pub type TorchStateDict = IndexMap<String, TorchTensorSpec>;

pub struct TorchCheckpoint<R: Read + Seek> {
    archive: ZipArchive<R>,
    root: String,
    pub state_dict: TorchStateDict,
}

impl TorchCheckpoint<File> {
    pub fn open_from_path(path: &Path) -> Result<Self, TorchCheckpointError> {
        let mut file = File::open(path)?;
        if !starts_with_zip_magic(&mut file)? {
            return Err(TorchCheckpointError::LegacyFormat);
        }
        Self::open_from_archive(ZipArchive::new(file)?)
    }
}

impl<R: Read + Seek> TorchCheckpoint<R> {
    pub fn open_from_archive(mut archive: ZipArchive<R>) -> Result<Self, TorchCheckpointError> {
        let root = archive
            .file_names()
            .filter_map(|name| name.strip_suffix(DATA_PKL))
            .find(|root| root.ends_with('/'))
            .map(str::to_owned)
            .ok_or(TorchCheckpointError::MissingDataPickle)?;

        match read_member(&mut archive, &format!("{root}{BYTE_ORDER}")) {
            Ok(bytes) => {
                let order = String::from_utf8_lossy(&bytes);
                if order.trim() != "little" {
                    return Err(TorchCheckpointError::UnsupportedByteOrder(order.trim().to_string()));
                }
            },
            Err(TorchCheckpointError::Zip(ZipError::FileNotFound)) => {},
            Err(error) => return Err(error),
        }

        let pickle_bytes = read_member(&mut archive, &format!("{root}{DATA_PKL}"))?;
        let state_dict = pickle::load_state_dict(&pickle_bytes)?;
        tracing::trace!(root = %root, tensors = state_dict.len(), "parsed torch checkpoint");

        Ok(Self {
            archive,
            root,
            state_dict,
        })
    }

    pub fn load_tensor(
        &mut self,
        name: &str,
    ) -> Result<Tensor, TorchCheckpointError> {
        let spec = self
            .state_dict
            .get(name)
            .cloned()
            .ok_or_else(|| TorchCheckpointError::TensorNotFound(name.to_string()))?;
        self.load_tensor_from_spec(name, &spec)
    }

    pub fn load_tensor_from_spec(
        &mut self,
        name: &str,
        spec: &TorchTensorSpec,
    ) -> Result<Tensor, TorchCheckpointError> {
        let storage = self.read_storage(&spec.storage_key)?;
        let range = tensor_byte_range(name, spec, storage.len())?;
        let data = if range == (0..storage.len()) {
            storage
        } else {
            storage[range].to_vec()
        };
        build_tensor(name, spec, data)
    }

    /// Reads every tensor of the state dict, in pickle order.
    ///
    /// Each storage member is read once, however many tensors view it.
    pub fn load_all(&mut self) -> Result<IndexMap<String, Tensor>, TorchCheckpointError> {
        let specs = self.state_dict.clone();
        let mut storages: HashMap<String, Vec<u8>> = HashMap::new();
        let mut tensors = IndexMap::with_capacity(specs.len());
        for (name, spec) in specs {
            let storage = match storages.entry(spec.storage_key.clone()) {
                Entry::Occupied(entry) => entry.into_mut(),
                Entry::Vacant(entry) => entry.insert(self.read_storage(&spec.storage_key)?),
            };
            let range = tensor_byte_range(&name, &spec, storage.len())?;
            let tensor = build_tensor(&name, &spec, storage[range].to_vec())?;
            tensors.insert(name, tensor);
        }
        tracing::trace!(tensors = tensors.len(), storages = storages.len(), "loaded torch checkpoint");
        Ok(tensors)
    }

    fn read_storage(
        &mut self,
        key: &str,
    ) -> Result<Vec<u8>, TorchCheckpointError> {
        read_member(&mut self.archive, &format!("{}data/{key}", self.root))
    }
}

fn build_tensor(
    name: &str,
    spec: &TorchTensorSpec,
    data: Vec<u8>,
) -> Result<Tensor, TorchCheckpointError> {
    Tensor::new(spec.dtype, spec.shape.clone(), data).map_err(|source| TorchCheckpointError::Tensor {
        name: name.to_string(),
        source,
    })
}

fn starts_with_zip_magic(file: &mut File) -> io::Result<bool> {
    let mut magic = [0u8; ZIP_MAGIC.len()];
    let matches = match file.read_exact(&mut magic) {
        Ok(()) => magic == ZIP_MAGIC,
        Err(error) if error.kind() == io::ErrorKind::UnexpectedEof => false,
        Err(error) => return Err(error),
    };
    file.rewind()?;
    Ok(matches)
}

fn read_member<R: Read + Seek>(
    archive: &mut ZipArchive<R>,
    name: &str,
) -> Result<Vec<u8>, TorchCheckpointError> {
    let mut member = archive.by_name(name)?;
    let mut bytes = Vec::with_capacity(member.size() as usize);
    member.read_to_end(&mut bytes)?;
    Ok(bytes)
}

/// Byte range of a contiguous tensor inside its storage.
fn tensor_byte_range(
    name: &str,
    spec: &TorchTensorSpec,
    storage_len: usize,
) -> Result<Range<usize>, TorchCheckpointError> {
    if !spec.is_contiguous() {
        return Err(TorchCheckpointError::NonContiguousTensor {
            name: name.to_string(),
            shape: spec.shape.clone(),
            stride: spec.stride.clone(),
        });
    }
    let element_size = spec.dtype.size_in_bytes();
    let start = spec.storage_offset_elems.saturating_mul(element_size);
    let range = start..start.saturating_add(spec.num_elements().saturating_mul(element_size));
    if range.end > storage_len {
        return Err(TorchCheckpointError::TensorOutOfBounds {
            name: name.to_string(),
            range,
            storage_len,
        });
    }
    Ok(range)
}

fn contiguous_stride(shape: &[usize]) -> Box<[usize]> {
    let mut stride = vec![1usize; shape.len()];
    for axis in (0..shape.len().saturating_sub(1)).rev() {
        stride[axis] = stride[axis + 1].saturating_mul(shape[axis + 1].max(1));
    }
    stride.into_boxed_slice()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(
        shape: &[usize],
        stride: &[usize],
        offset: usize,
    ) -> TorchTensorSpec {
        TorchTensorSpec {
            dtype: DataType::F32,
            shape: shape.into(),
            stride: stride.into(),
            storage_key: "0".to_string(),
            storage_offset_elems: offset,
        }
    }

    #[test]
    fn contiguous_strides() {
        assert_eq!(*contiguous_stride(&[2, 3, 4]), [12, 4, 1]);
        assert_eq!(*contiguous_stride(&[5]), [1]);
        assert!(contiguous_stride(&[]).is_empty());
        assert_eq!(*contiguous_stride(&[0, 3]), [3, 1]);
    }

    #[test]
    fn byte_range_of_offset_view() {
        assert_eq!(tensor_byte_range("w", &spec(&[2, 2], &[2, 1], 2), 24).unwrap(), 8..24);
        assert_eq!(tensor_byte_range("s", &spec(&[], &[], 0), 4).unwrap(), 0..4);
    }

    #[test]
    fn strided_views_are_rejected() {
        assert!(matches!(
            tensor_byte_range("t", &spec(&[2, 3], &[1, 2], 0), 24),
            Err(TorchCheckpointError::NonContiguousTensor { .. })
        ));
    }

    #[test]
    fn size_one_axes_ignore_stride() {
        assert_eq!(tensor_byte_range("t", &spec(&[1, 4], &[1, 1], 0), 16).unwrap(), 0..16);
        assert_eq!(tensor_byte_range("c", &spec(&[4, 1], &[1, 9], 1), 20).unwrap(), 4..20);
        assert!(matches!(
            tensor_byte_range("r", &spec(&[2, 1, 3], &[1, 1, 2], 0), 24),
            Err(TorchCheckpointError::NonContiguousTensor { .. })
        ));
        assert!(matches!(
            tensor_byte_range("d", &spec(&[1, 4], &[4], 0), 16),
            Err(TorchCheckpointError::NonContiguousTensor { .. })
        ));
    }

    #[test]
    fn out_of_bounds_view_is_rejected() {
        let error = tensor_byte_range("w", &spec(&[4], &[1], 1), 16).unwrap_err();
        assert!(matches!(
            error,
            TorchCheckpointError::TensorOutOfBounds {
                range: Range { start: 4, end: 20 },
                storage_len: 16,
                ..
            }
        ));
    }
}
