pub mod hparams;
pub mod gpt2;

#[cfg(test)]
pub(crate) mod testing;

pub use hparams::Hyperparameters;

use crate::core::{
    Cancellable, Error, KvCache, ModelDesc, Result, Tensor, TensorDesc, TokenDictionary, TokenId, WeightRegistry,
};

/// A loaded GPT-2 checkpoint. Immutable once built, so one instance can be
/// shared by any number of cursors.
#[derive(Debug)]
pub struct LanguageModel {
    hparams: Hyperparameters,
    dictionary: TokenDictionary,
    weights: WeightRegistry,
}

impl LanguageModel {
    pub fn new(hparams: Hyperparameters, dictionary: TokenDictionary, mut weights: WeightRegistry) -> Result<Self> {
        hparams.validate()?;
        if dictionary.len() != hparams.n_vocab {
            return Err(Error::format(format!(
                "Model dictionary n_vocab {} does not match hyperparameters n_vocab {}",
                dictionary.len(),
                hparams.n_vocab
            )));
        }

        if !weights.contains(gpt2::LM_HEAD) {
            let tied = weights.get(gpt2::WTE)?.clone();
            weights.insert(gpt2::LM_HEAD, tied)?;
        }

        let desc = gpt2::model_desc(&hparams)?;
        for (path, expected) in desc.flatten() {
            let tensor = weights.get(&path)?;
            if tensor.shape() != &expected.shape {
                return Err(Error::format(format!(
                    "Tensor {} has shape {}, expected {}",
                    path,
                    tensor.shape(),
                    expected.shape
                )));
            }
        }

        Ok(Self {
            hparams,
            dictionary,
            weights,
        })
    }

    pub fn hparams(&self) -> &Hyperparameters {
        &self.hparams
    }

    pub fn dictionary(&self) -> &TokenDictionary {
        &self.dictionary
    }

    pub fn weights(&self) -> &WeightRegistry {
        &self.weights
    }

    pub fn weight(&self, path: &str) -> Result<&Tensor> {
        self.weights.get(path)
    }

    /// Shapes and storage types of the loaded tensors.
    pub fn desc(&self) -> ModelDesc {
        self.weights.map(|_, t| TensorDesc::of(t))
    }

    /// Cache for up to `capacity` positions, clamped to the model context.
    pub fn new_cache(&self, capacity: usize) -> Result<KvCache> {
        KvCache::new(self.hparams.n_layer, capacity.min(self.hparams.n_ctx), self.hparams.d_model())
    }

    pub fn forward(
        &self,
        cache: &mut KvCache,
        tokens: &[TokenId],
        n_past: usize,
        cancel: Option<&Cancellable>,
    ) -> Result<Tensor> {
        gpt2::forward(self, cache, tokens, n_past, cancel)
    }
}
