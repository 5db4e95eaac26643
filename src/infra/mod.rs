pub mod config;
pub mod format;
pub mod quantize;
pub mod store;

pub use config::EngineConfig;
pub use format::{read_model, read_model_file, write_model, write_model_file, ProgressFn, ProgressReader};
pub use quantize::{QuantizeConfig, Quantization};
pub use store::{DefinedModel, ModelStore};
