use crate::core::{DType, Error, Result, Tensor};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const GPT2_QUANTIZE_PATTERNS: &[&str] = &[
    "model/wte",
    "model/lm_head",
    r"model/h\d+/attn/c_attn/w",
    r"model/h\d+/attn/c_proj/w",
    r"model/h\d+/mlp/c_fc/w",
    r"model/h\d+/mlp/c_proj/w",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Quantization {
    None,
    F16,
    Q8_0,
    Q5_0,
    Q5_1,
    Q4_0,
    Q4_1,
}

impl Quantization {
    pub const ALL: [Quantization; 7] = [
        Quantization::None,
        Quantization::F16,
        Quantization::Q8_0,
        Quantization::Q5_0,
        Quantization::Q5_1,
        Quantization::Q4_0,
        Quantization::Q4_1,
    ];

    /// Storage type weights are converted to, `None` keeps what the file stores.
    pub fn target(&self) -> Option<DType> {
        match self {
            Quantization::None => None,
            Quantization::F16 => Some(DType::F16),
            Quantization::Q8_0 => Some(DType::Q8_0),
            Quantization::Q5_0 => Some(DType::Q5_0),
            Quantization::Q5_1 => Some(DType::Q5_1),
            Quantization::Q4_0 => Some(DType::Q4_0),
            Quantization::Q4_1 => Some(DType::Q4_1),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Quantization::None => "none",
            Quantization::F16 => "f16",
            Quantization::Q8_0 => "q8_0",
            Quantization::Q5_0 => "q5_0",
            Quantization::Q5_1 => "q5_1",
            Quantization::Q4_0 => "q4_0",
            Quantization::Q4_1 => "q4_1",
        }
    }
}

impl fmt::Display for Quantization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Quantization {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let lower = s.to_ascii_lowercase();
        Self::ALL
            .iter()
            .copied()
            .find(|q| q.as_str() == lower)
            .ok_or_else(|| Error::format(format!("Unknown quantization '{}'", s)))
    }
}

#[derive(Debug, Clone)]
pub struct QuantizeConfig {
    target: Option<DType>,
    quantize: Vec<Regex>,
    skip: Vec<Regex>,
}

fn anchored(patterns: &[&str]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|p| Regex::new(&format!("^(?:{})$", p)).map_err(|e| Error::format(format!("Invalid pattern '{}': {}", p, e))))
        .collect()
}

impl QuantizeConfig {
    pub fn none() -> Self {
        Self {
            target: None,
            quantize: Vec::new(),
            skip: Vec::new(),
        }
    }

    pub fn new(target: DType, quantize: &[&str], skip: &[&str]) -> Result<Self> {
        Ok(Self {
            target: Some(target),
            quantize: anchored(quantize)?,
            skip: anchored(skip)?,
        })
    }

    pub fn for_gpt2(quantization: Quantization) -> Result<Self> {
        match quantization.target() {
            Some(target) => Self::new(target, GPT2_QUANTIZE_PATTERNS, &[]),
            None => Ok(Self::none()),
        }
    }

    pub fn target(&self) -> Option<DType> {
        self.target
    }

    pub fn should_quantize(&self, path: &str, n_dims: usize) -> bool {
        self.target.is_some()
            && n_dims == 2
            && !self.skip.iter().any(|r| r.is_match(path))
            && self.quantize.iter().any(|r| r.is_match(path))
    }

    pub fn apply(&self, path: &str, tensor: Tensor) -> Result<Tensor> {
        match self.target {
            Some(target) if tensor.dtype() != target && self.should_quantize(path, tensor.n_dims()) => {
                tensor.convert(target)
            }
            _ => Ok(tensor),
        }
    }
}

impl Default for QuantizeConfig {
    fn default() -> Self {
        Self::none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Shape;

    #[test]
    fn test_parse_quantization() {
        assert_eq!("q5_1".parse::<Quantization>().unwrap(), Quantization::Q5_1);
        assert_eq!("F16".parse::<Quantization>().unwrap(), Quantization::F16);
        assert_eq!("none".parse::<Quantization>().unwrap(), Quantization::None);
        assert!("q3_k".parse::<Quantization>().is_err());
        for q in Quantization::ALL {
            assert_eq!(q.to_string().parse::<Quantization>().unwrap(), q);
        }
    }

    #[test]
    fn test_gpt2_rules() {
        let config = QuantizeConfig::for_gpt2(Quantization::Q8_0).unwrap();
        assert!(config.should_quantize("model/wte", 2));
        assert!(config.should_quantize("model/h11/mlp/c_fc/w", 2));
        assert!(!config.should_quantize("model/h11/mlp/c_fc/b", 1));
        assert!(!config.should_quantize("model/wpe", 2));
        // anchored: a suffix match is not enough
        assert!(!config.should_quantize("extra/model/wte", 2));
        // only matrices are converted
        assert!(!config.should_quantize("model/wte", 1));
    }

    #[test]
    fn test_skip_wins() {
        let config = QuantizeConfig::new(DType::Q4_0, &[r"model/.*"], &["model/wte"]).unwrap();
        assert!(!config.should_quantize("model/wte", 2));
        assert!(config.should_quantize("model/lm_head", 2));
    }

    #[test]
    fn test_apply() {
        let config = QuantizeConfig::for_gpt2(Quantization::Q4_1).unwrap();
        let t = Tensor::new(vec![0.25; 64], Shape::new(vec![2, 32]));
        assert_eq!(config.apply("model/h0/attn/c_proj/w", t.clone()).unwrap().dtype(), DType::Q4_1);
        assert_eq!(config.apply("model/ln_f/g", t.clone()).unwrap().dtype(), DType::F32);

        let none = QuantizeConfig::for_gpt2(Quantization::None).unwrap();
        assert_eq!(none.apply("model/wte", t).unwrap().dtype(), DType::F32);
    }

    #[test]
    fn test_bad_pattern() {
        assert!(QuantizeConfig::new(DType::Q8_0, &["model/(wte"], &[]).is_err());
    }
}
