//! Reading and writing the safetensors container.

mod header;
mod loader;
mod safetensors_writer;

pub use header::{HeaderError, SafetensorsHeader, TensorEntry};
pub use loader::{ParameterLoader, ParameterLoaderError};
pub use safetensors_writer::{SafetensorView, SafetensorsWriteError, write_safetensors};
