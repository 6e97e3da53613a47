mod destination;
mod error;
mod source;

pub use destination::{DestinationConfig, DestinationModelConfig};
pub use error::ConfigError;
pub use source::{CONFIG_EXTENSION, CONFIGS_DIR_NAME, NUM_LAYERS_KEY, SourceConfig};
