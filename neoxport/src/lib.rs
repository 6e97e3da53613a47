pub mod config;
pub mod convert;
mod data_type;
pub mod model;
pub mod parameters;
pub mod remapper;
mod tensor;
pub mod torch_checkpoint;

pub use data_type::{ArrayElement, DataType};
pub use tensor::{Tensor, TensorError};
