use crate::core::{DType, Error, Result};
use serde::Serialize;

// Newer ggml files fold a quantization version into ftype as `version * 1000 + ftype`.
const QNT_VERSION_FACTOR: i32 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Hyperparameters {
    pub n_vocab: usize,
    pub n_ctx: usize,
    pub n_embd: usize,
    pub n_head: usize,
    pub n_layer: usize,
    pub ftype: i32,
}

impl Hyperparameters {
    pub fn new(n_vocab: usize, n_ctx: usize, n_embd: usize, n_head: usize, n_layer: usize) -> Self {
        Self {
            n_vocab,
            n_ctx,
            n_embd,
            n_head,
            n_layer,
            ftype: 1,
        }
    }

    pub fn ftype(mut self, ftype: i32) -> Self {
        self.ftype = ftype;
        self
    }

    pub fn d_model(&self) -> usize {
        self.n_embd
    }

    pub fn d_ff(&self) -> usize {
        4 * self.n_embd
    }

    pub fn head_dim(&self) -> usize {
        self.n_embd / self.n_head.max(1)
    }

    pub fn validate(&self) -> Result<()> {
        if self.n_vocab == 0 || self.n_ctx == 0 || self.n_embd == 0 || self.n_head == 0 || self.n_layer == 0 {
            return Err(Error::format(format!("Invalid hyperparameters {:?}", self)));
        }
        if self.n_embd % self.n_head != 0 {
            return Err(Error::format(format!(
                "n_embd {} is not divisible by n_head {}",
                self.n_embd, self.n_head
            )));
        }
        Ok(())
    }

    /// Storage type of the 2-D weight matrices implied by `ftype`.
    pub fn weight_dtype(&self) -> Result<DType> {
        match self.ftype % QNT_VERSION_FACTOR {
            0 => Ok(DType::F32),
            1 => Ok(DType::F16),
            2 => Ok(DType::Q4_0),
            3 => Ok(DType::Q4_1),
            7 => Ok(DType::Q8_0),
            8 => Ok(DType::Q5_0),
            9 => Ok(DType::Q5_1),
            other => Err(Error::format(format!("Unsupported file type {}", other))),
        }
    }

    pub fn ftype_for(dtype: DType) -> i32 {
        match dtype {
            DType::F32 => 0,
            DType::F16 => 1,
            DType::Q4_0 => 2,
            DType::Q4_1 => 3,
            DType::Q8_0 => 7,
            DType::Q5_0 => 8,
            DType::Q5_1 => 9,
        }
    }
}
