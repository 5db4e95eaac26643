pub mod error;
pub mod cancel;
pub mod tensor;
pub mod weights;
pub mod cache;
pub mod tokenizer;
pub mod sampler;
pub mod model;

pub use error::Error;
pub use cancel::Cancellable;
pub use tensor::{Tensor, TensorOps, Shape, DType};
pub use weights::{WeightNode, WeightTree, WeightRegistry, TensorDesc, ModelDesc};
pub use cache::KvCache;
pub use tokenizer::{TokenDictionary, TokenId};
pub use sampler::{Sampler, ArgmaxSampler, TopKTopPSampler, FnSampler, SamplerConfig};
pub use model::{Hyperparameters, LanguageModel};

pub type Result<T> = std::result::Result<T, Error>;
