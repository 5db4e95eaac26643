use super::{gpt2, Hyperparameters, LanguageModel};
use crate::core::{DType, Tensor, TokenDictionary, WeightRegistry};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub const TINY_VOCAB: [&str; 24] = [
    "a", "b", "c", "d", "e", "f", "g", "h", "i", "j", "k", "l", "m", "n", "o", "p", " a", " b", " c", " d", "The",
    " meaning", " of", " life",
];

pub fn tiny_hparams(dtype: DType) -> Hyperparameters {
    Hyperparameters::new(TINY_VOCAB.len(), 16, 32, 4, 2).ftype(Hyperparameters::ftype_for(dtype))
}

pub fn tiny_dictionary() -> TokenDictionary {
    TokenDictionary::new(TINY_VOCAB)
}

pub fn tiny_weights(hp: &Hyperparameters, seed: u64) -> WeightRegistry {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut weights = WeightRegistry::new();
    let desc = gpt2::model_desc(hp).unwrap();

    for (path, leaf) in desc.flatten() {
        let n = leaf.shape.numel();
        let values: Vec<f32> = if path.ends_with("/g") {
            (0..n).map(|_| 1.0 + rng.gen_range(-0.1..0.1)).collect()
        } else {
            (0..n).map(|_| rng.gen_range(-0.2..0.2)).collect()
        };
        let tensor = Tensor::new(values, leaf.shape.clone()).convert(leaf.dtype).unwrap();
        weights.insert(&path, tensor).unwrap();
    }
    weights
}

pub fn tiny_model(dtype: DType, seed: u64) -> LanguageModel {
    let hp = tiny_hparams(dtype);
    LanguageModel::new(hp, tiny_dictionary(), tiny_weights(&hp, seed)).unwrap()
}

pub fn tiny_model_with_vocab(dtype: DType, seed: u64, vocab: &[&str]) -> LanguageModel {
    let mut hp = tiny_hparams(dtype);
    hp.n_vocab = vocab.len();
    LanguageModel::new(hp, TokenDictionary::new(vocab.iter().copied()), tiny_weights(&hp, seed)).unwrap()
}
