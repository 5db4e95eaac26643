use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Operation was cancelled")]
    Cancelled,

    #[error("Tensor {0} not found")]
    NotFound(String),

    #[error("Write of {n_tokens} tokens at offset {offset} exceeds context length {n_ctx}")]
    OutOfBounds {
        offset: usize,
        n_tokens: usize,
        n_ctx: usize,
    },

    #[error("{0}")]
    Format(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    #[error("Shape error: {0}")]
    Shape(String),

    #[error("Already executing on this cursor")]
    Busy,

    #[error("Download failed: {0}")]
    Download(String),
}

impl Error {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    pub fn format(msg: impl Into<String>) -> Self {
        Error::Format(msg.into())
    }

    pub fn shape(msg: impl Into<String>) -> Self {
        Error::Shape(msg.into())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Download(e.to_string())
    }
}
