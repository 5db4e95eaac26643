use crate::core::SamplerConfig;
use std::env;
use std::path::PathBuf;

pub const DEFAULT_CHUNK_SIZE: usize = 128;
pub const DEFAULT_TOP_K: usize = 500;
pub const DEFAULT_TOP_P: f32 = 1.0;
pub const DEFAULT_MAX_TOKENS: usize = 256;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub models_dir: PathBuf,
    pub chunk_size: usize,
    pub top_k: usize,
    pub top_p: f32,
    pub seed: Option<u64>,
    pub retain_cursor: bool,
    pub max_tokens: usize,
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

pub fn default_models_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("gpt2-complete")
        .join("0")
        .join("models")
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::builtin();
        Self {
            models_dir: env::var("GPT2_COMPLETE_MODELS")
                .map(|p| expand_home(&p))
                .unwrap_or(defaults.models_dir),
            chunk_size: parse_env("GPT2_COMPLETE_CHUNK_SIZE")
                .filter(|&n| n > 0)
                .unwrap_or(defaults.chunk_size),
            top_k: parse_env("GPT2_COMPLETE_TOP_K")
                .filter(|&k| k > 0)
                .unwrap_or(defaults.top_k),
            top_p: parse_env("GPT2_COMPLETE_TOP_P")
                .filter(|&p: &f32| p > 0.0 && p <= 1.0)
                .unwrap_or(defaults.top_p),
            seed: parse_env("GPT2_COMPLETE_SEED"),
            retain_cursor: parse_env("GPT2_COMPLETE_RETAIN_CURSOR").unwrap_or(defaults.retain_cursor),
            max_tokens: parse_env("GPT2_COMPLETE_MAX_TOKENS")
                .filter(|&n| n > 0)
                .unwrap_or(defaults.max_tokens),
        }
    }

    fn builtin() -> Self {
        Self {
            models_dir: default_models_dir(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            top_k: DEFAULT_TOP_K,
            top_p: DEFAULT_TOP_P,
            seed: None,
            retain_cursor: true,
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }

    pub fn models_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.models_dir = dir.into();
        self
    }

    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    pub fn top_p(mut self, top_p: f32) -> Self {
        self.top_p = top_p;
        self
    }

    pub fn seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }

    pub fn retain_cursor(mut self, retain: bool) -> Self {
        self.retain_cursor = retain;
        self
    }

    pub fn max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn sampler(&self) -> SamplerConfig {
        SamplerConfig::TopKTopP {
            top_k: self.top_k,
            top_p: self.top_p,
            seed: self.seed,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from_env()
    }
}
