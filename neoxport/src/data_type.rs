use bytemuck::Pod;
use half::{bf16, f16};
use num_traits::NumCast;
use serde::{Deserialize, Serialize};

/// Element type of a tensor. Serializes as the safetensors dtype string.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Copy, Clone, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DataType {
    // Floating point
    BF16,
    F16,
    F32,
    F64,
    // Integers
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    // One byte per element, as torch stores it
    Bool,
}

impl DataType {
    pub const fn size_in_bits(&self) -> usize {
        match self {
            DataType::I8 | DataType::U8 | DataType::Bool => 8,
            DataType::I16 | DataType::U16 => 16,
            DataType::BF16 | DataType::F16 => 16,
            DataType::F32 | DataType::I32 | DataType::U32 => 32,
            DataType::F64 | DataType::I64 | DataType::U64 => 64,
        }
    }

    pub const fn size_in_bytes(&self) -> usize {
        self.size_in_bits().div_ceil(8)
    }

    /// Parses the `torch_dtype` spelling used in model configuration files.
    pub fn from_torch_name(name: &str) -> Option<Self> {
        let name = name.strip_prefix("torch.").unwrap_or(name);
        match name {
            "float32" | "float" => Some(DataType::F32),
            "float16" | "half" => Some(DataType::F16),
            "bfloat16" => Some(DataType::BF16),
            "float64" | "double" => Some(DataType::F64),
            _ => None,
        }
    }
}

pub trait ArrayElement: NumCast + Pod {
    fn data_type() -> DataType;
}

macro_rules! impl_array_element {
    ($($type:ty => $variant:ident),+ $(,)?) => {
        $(
            impl ArrayElement for $type {
                fn data_type() -> DataType {
                    DataType::$variant
                }
            }
        )+
    };
}

impl_array_element! {
    f16 => F16,
    bf16 => BF16,
    f32 => F32,
    f64 => F64,
    i8 => I8,
    u8 => U8,
    i16 => I16,
    u16 => U16,
    i32 => I32,
    u32 => U32,
    i64 => I64,
    u64 => U64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn element_sizes() {
        assert_eq!(DataType::BF16.size_in_bytes(), 2);
        assert_eq!(DataType::F32.size_in_bytes(), 4);
        assert_eq!(DataType::I64.size_in_bytes(), 8);
        assert_eq!(DataType::Bool.size_in_bytes(), 1);
    }

    #[test]
    fn torch_dtype_names() {
        assert_eq!(DataType::from_torch_name("float16"), Some(DataType::F16));
        assert_eq!(DataType::from_torch_name("torch.bfloat16"), Some(DataType::BF16));
        assert_eq!(DataType::from_torch_name("int8"), None);
    }

    #[test]
    fn serializes_as_safetensors_dtype() {
        assert_eq!(serde_json::to_string(&DataType::BF16).unwrap(), "\"BF16\"");
        assert_eq!(serde_json::to_string(&DataType::Bool).unwrap(), "\"BOOL\"");
        assert_eq!(serde_json::from_str::<DataType>("\"I64\"").unwrap(), DataType::I64);
    }
}
