use crate::core::{Error, Result, Shape, Tensor};

/// Per-cursor key/value memory (`memory/k`, `memory/v`), laid out as
/// `n_layer × n_ctx × d_model` flat f32 buffers.
#[derive(Debug, Clone)]
pub struct KvCache {
    keys: Tensor,
    values: Tensor,
    n_layer: usize,
    n_ctx: usize,
    d_model: usize,
}

impl KvCache {
    pub fn new(n_layer: usize, n_ctx: usize, d_model: usize) -> Result<Self> {
        let numel = n_layer
            .checked_mul(n_ctx)
            .and_then(|n| n.checked_mul(d_model))
            .ok_or_else(|| Error::OutOfMemory(format!("KV cache {}x{}x{}", n_layer, n_ctx, d_model)))?;

        let mut storage = Vec::new();
        storage
            .try_reserve_exact(numel)
            .map_err(|e| Error::OutOfMemory(format!("KV cache of {} elements: {}", numel, e)))?;
        storage.resize(numel, 0.0);

        Ok(Self {
            keys: Tensor::new(storage.clone(), Shape::new(vec![numel])),
            values: Tensor::new(storage, Shape::new(vec![numel])),
            n_layer,
            n_ctx,
            d_model,
        })
    }

    pub fn n_ctx(&self) -> usize {
        self.n_ctx
    }

    pub fn n_layer(&self) -> usize {
        self.n_layer
    }

    pub fn d_model(&self) -> usize {
        self.d_model
    }

    fn offset(&self, layer: usize, time_offset: usize) -> usize {
        self.d_model * (layer * self.n_ctx + time_offset)
    }

    fn check_layer(&self, layer: usize) -> Result<()> {
        if layer >= self.n_layer {
            return Err(Error::shape(format!("layer {} out of range ({} layers)", layer, self.n_layer)));
        }
        Ok(())
    }

    /// Stores `n_tokens` rows of keys and values for `layer` starting at `time_offset`.
    /// Nothing is written unless the whole range fits.
    pub fn write(&mut self, layer: usize, time_offset: usize, n_tokens: usize, k: &[f32], v: &[f32]) -> Result<()> {
        self.check_layer(layer)?;
        if time_offset + n_tokens > self.n_ctx {
            return Err(Error::OutOfBounds {
                offset: time_offset,
                n_tokens,
                n_ctx: self.n_ctx,
            });
        }

        let len = n_tokens * self.d_model;
        if k.len() != len || v.len() != len {
            return Err(Error::shape(format!(
                "expected {} key/value elements, got {}/{}",
                len,
                k.len(),
                v.len()
            )));
        }

        let start = self.offset(layer, time_offset);
        self.keys.f32_data_mut()?[start..start + len].copy_from_slice(k);
        self.values.f32_data_mut()?[start..start + len].copy_from_slice(v);
        Ok(())
    }

    /// Keys and values for positions `start..start + len` of `layer`.
    pub fn read_view(&self, layer: usize, start: usize, len: usize) -> Result<(&[f32], &[f32])> {
        self.check_layer(layer)?;
        if start + len > self.n_ctx {
            return Err(Error::OutOfBounds {
                offset: start,
                n_tokens: len,
                n_ctx: self.n_ctx,
            });
        }

        let from = self.offset(layer, start);
        let to = from + len * self.d_model;
        Ok((&self.keys.f32_data()?[from..to], &self.values.f32_data()?[from..to]))
    }
}
