use half::{bf16, f16};
use num_traits::NumCast;
use thiserror::Error;

use crate::{ArrayElement, DataType};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TensorError {
    #[error(
        "Size mismatch: tensor of shape {shape:?} and data type \
        {data_type:?} expected to be {expected_size} bytes, got {actual_size} bytes."
    )]
    SizeMismatch {
        data_type: DataType,
        shape: Box<[usize]>,
        expected_size: usize,
        actual_size: usize,
    },
    #[error("Tensor holds {actual:?}, requested {requested:?}")]
    DataTypeMismatch {
        actual: DataType,
        requested: DataType,
    },
}

/// An owned host tensor: element type, shape and raw little-endian bytes.
///
/// The converter never looks inside `data`; tensors travel from a shard to
/// the destination file by move.
#[derive(Debug, PartialEq, Eq)]
pub struct Tensor {
    dtype: DataType,
    shape: Box<[usize]>,
    data: Vec<u8>,
}

impl Tensor {
    pub fn new(
        dtype: DataType,
        shape: impl Into<Box<[usize]>>,
        data: Vec<u8>,
    ) -> Result<Self, TensorError> {
        let shape = shape.into();
        let expected_size = expected_size_in_bytes(dtype, &shape);
        if expected_size != data.len() {
            return Err(TensorError::SizeMismatch {
                data_type: dtype,
                shape,
                expected_size,
                actual_size: data.len(),
            });
        }
        Ok(Self {
            dtype,
            shape,
            data,
        })
    }

    pub fn from_values<T: ArrayElement>(
        shape: impl Into<Box<[usize]>>,
        values: &[T],
    ) -> Result<Self, TensorError> {
        Self::new(T::data_type(), shape, bytemuck::cast_slice(values).to_vec())
    }

    pub fn zeros(
        dtype: DataType,
        shape: impl Into<Box<[usize]>>,
    ) -> Self {
        let shape = shape.into();
        let data = vec![0u8; expected_size_in_bytes(dtype, &shape)];
        Self {
            dtype,
            shape,
            data,
        }
    }

    /// Every element set to one. Integer types get the integer one.
    pub fn ones(
        dtype: DataType,
        shape: impl Into<Box<[usize]>>,
    ) -> Self {
        let shape: Box<[usize]> = shape.into();
        let numel = shape.iter().product();
        let data = match dtype {
            DataType::BF16 => repeat_one::<bf16>(numel),
            DataType::F16 => repeat_one::<f16>(numel),
            DataType::F32 => repeat_one::<f32>(numel),
            DataType::F64 => repeat_one::<f64>(numel),
            DataType::I8 => repeat_one::<i8>(numel),
            DataType::U8 | DataType::Bool => repeat_one::<u8>(numel),
            DataType::I16 => repeat_one::<i16>(numel),
            DataType::U16 => repeat_one::<u16>(numel),
            DataType::I32 => repeat_one::<i32>(numel),
            DataType::U32 => repeat_one::<u32>(numel),
            DataType::I64 => repeat_one::<i64>(numel),
            DataType::U64 => repeat_one::<u64>(numel),
        };
        Self {
            dtype,
            shape,
            data,
        }
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn num_elements(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Copies the elements out as `T`. The bytes may be unaligned.
    pub fn to_vec<T: ArrayElement>(&self) -> Result<Vec<T>, TensorError> {
        if T::data_type() != self.dtype {
            return Err(TensorError::DataTypeMismatch {
                actual: self.dtype,
                requested: T::data_type(),
            });
        }
        Ok(self
            .data
            .chunks_exact(self.dtype.size_in_bytes())
            .map(bytemuck::pod_read_unaligned::<T>)
            .collect())
    }
}

fn expected_size_in_bytes(
    dtype: DataType,
    shape: &[usize],
) -> usize {
    shape.iter().product::<usize>().saturating_mul(dtype.size_in_bytes())
}

fn repeat_one<T: ArrayElement>(numel: usize) -> Vec<u8> {
    let one: T = NumCast::from(1u8).unwrap_or_else(<T as bytemuck::Zeroable>::zeroed);
    bytemuck::cast_slice(&vec![one; numel]).to_vec()
}
