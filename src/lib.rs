pub mod core;
pub mod infra;
pub mod app;

pub use crate::core::{
    Cancellable, DType, Error, Hyperparameters, KvCache, LanguageModel, Result, Sampler, SamplerConfig, Shape, Tensor,
    TokenDictionary, TokenId, WeightRegistry,
};

pub use infra::{DefinedModel, EngineConfig, ModelStore, QuantizeConfig, Quantization};

pub use app::{
    create_completion, CompletionCursor, CursorManager, CursorRetention, FileModelSource, ModelKey, ModelLoader,
    ModelSource, Session, SessionCommand, SessionEvent, SessionState, StreamChunk,
};
