use crate::core::tensor::ops::softmax_in_place;
use crate::core::TokenId;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// Picks the next token from the logits of the last position.
pub trait Sampler: Send {
    fn sample(&mut self, logits: &[f32]) -> TokenId;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ArgmaxSampler;

impl Sampler for ArgmaxSampler {
    fn sample(&mut self, logits: &[f32]) -> TokenId {
        let mut best = 0;
        let mut best_val = f32::MIN;
        for (i, &v) in logits.iter().enumerate() {
            if v > best_val {
                best = i;
                best_val = v;
            }
        }
        TokenId(best as u32)
    }
}

pub struct TopKTopPSampler {
    top_k: usize,
    top_p: f32,
    rng: StdRng,
}

impl TopKTopPSampler {
    pub fn new(top_k: usize, top_p: f32) -> Self {
        Self::with_rng(top_k, top_p, StdRng::from_entropy())
    }

    pub fn seeded(top_k: usize, top_p: f32, seed: u64) -> Self {
        Self::with_rng(top_k, top_p, StdRng::seed_from_u64(seed))
    }

    fn with_rng(top_k: usize, top_p: f32, rng: StdRng) -> Self {
        Self {
            top_k: top_k.max(1),
            top_p: top_p.clamp(f32::EPSILON, 1.0),
            rng,
        }
    }

    /// Candidate ids with their renormalised probabilities, most likely first.
    fn distribution(&self, logits: &[f32]) -> Vec<(usize, f32)> {
        let k = self.top_k.min(logits.len());
        let mut order: Vec<usize> = (0..logits.len()).collect();
        let by_logit = |a: &usize, b: &usize| logits[*b].total_cmp(&logits[*a]);
        if k < order.len() {
            order.select_nth_unstable_by(k, by_logit);
            order.truncate(k);
        }
        order.sort_by(by_logit);

        let mut probs: Vec<f32> = order.iter().map(|&i| logits[i]).collect();
        softmax_in_place(&mut probs);

        let mut cumsum = 0.0;
        let mut kept = Vec::with_capacity(order.len());
        for (&i, &p) in order.iter().zip(&probs) {
            kept.push((i, p));
            cumsum += p;
            if cumsum >= self.top_p {
                break;
            }
        }

        for entry in kept.iter_mut() {
            entry.1 /= cumsum;
        }
        kept
    }
}

impl Sampler for TopKTopPSampler {
    fn sample(&mut self, logits: &[f32]) -> TokenId {
        let candidates = self.distribution(logits);
        let r: f32 = self.rng.gen();

        let mut cumulative = 0.0;
        for &(i, p) in &candidates {
            cumulative += p;
            if cumulative > r {
                return TokenId(i as u32);
            }
        }
        candidates.last().map(|&(i, _)| TokenId(i as u32)).unwrap_or(TokenId(0))
    }
}

/// Adapts a closure into a [`Sampler`].
pub struct FnSampler<F>(pub F);

impl<F> Sampler for FnSampler<F>
where
    F: FnMut(&[f32]) -> TokenId + Send,
{
    fn sample(&mut self, logits: &[f32]) -> TokenId {
        (self.0)(logits)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SamplerConfig {
    Argmax,
    TopKTopP {
        top_k: usize,
        top_p: f32,
        seed: Option<u64>,
    },
}

impl SamplerConfig {
    pub fn build(&self) -> Box<dyn Sampler> {
        match *self {
            SamplerConfig::Argmax => Box::new(ArgmaxSampler),
            SamplerConfig::TopKTopP { top_k, top_p, seed: Some(seed) } => {
                Box::new(TopKTopPSampler::seeded(top_k, top_p, seed))
            }
            SamplerConfig::TopKTopP { top_k, top_p, seed: None } => Box::new(TopKTopPSampler::new(top_k, top_p)),
        }
    }
}

impl Default for SamplerConfig {
    fn default() -> Self {
        SamplerConfig::Argmax
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_argmax_first_max_wins() {
        let mut s = ArgmaxSampler;
        assert_eq!(s.sample(&[0.1, 3.0, 3.0, -1.0]), TokenId(1));
        assert_eq!(s.sample(&[f32::MIN, f32::MIN]), TokenId(0));
    }

    #[test]
    fn test_top_k_one_is_greedy() {
        let mut s = TopKTopPSampler::seeded(1, 1.0, 7);
        for _ in 0..10 {
            assert_eq!(s.sample(&[0.0, 5.0, 4.9, -2.0]), TokenId(1));
        }
    }

    #[test]
    fn test_top_p_cuts_the_tail() {
        let s = TopKTopPSampler::seeded(4, 0.5, 1);
        let dist = s.distribution(&[10.0, 0.0, 0.0, 0.0]);
        assert_eq!(dist.len(), 1);
        assert_eq!(dist[0].0, 0);
        assert!((dist[0].1 - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_distribution_is_sorted_and_normalised() {
        let s = TopKTopPSampler::seeded(3, 1.0, 1);
        let dist = s.distribution(&[1.0, 4.0, 2.0, 3.0, 0.0]);
        let ids: Vec<usize> = dist.iter().map(|&(i, _)| i).collect();
        assert_eq!(ids, vec![1, 3, 2]);
        let total: f32 = dist.iter().map(|&(_, p)| p).sum();
        assert!((total - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_seeded_sampling_is_reproducible() {
        let logits: Vec<f32> = (0..50).map(|i| (i % 7) as f32).collect();
        let mut a = TopKTopPSampler::seeded(10, 0.9, 42);
        let mut b = TopKTopPSampler::seeded(10, 0.9, 42);
        for _ in 0..20 {
            assert_eq!(a.sample(&logits), b.sample(&logits));
        }
    }

    #[test]
    fn test_fn_sampler() {
        let mut s = FnSampler(|logits: &[f32]| TokenId(logits.len() as u32 - 1));
        assert_eq!(s.sample(&[0.0, 0.0, 0.0]), TokenId(2));
    }

    #[test]
    fn test_config_builds_samplers() {
        let mut greedy = SamplerConfig::Argmax.build();
        assert_eq!(greedy.sample(&[0.0, 1.0]), TokenId(1));

        let cfg = SamplerConfig::TopKTopP { top_k: 1, top_p: 1.0, seed: Some(3) };
        assert_eq!(cfg.build().sample(&[2.0, 1.0]), TokenId(0));
    }
}
