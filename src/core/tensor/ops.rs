use super::{Shape, Tensor};
use crate::core::{Error, Result};
use rayon::prelude::*;

const GELU_COEF_A: f32 = 0.044_715;
const SQRT_2_OVER_PI: f32 = 0.797_884_6;

/// Row-wise operations on `[rows, width]` f32 activations.
pub trait TensorOps {
    /// `self · weightᵀ + bias` where `weight` is `[out, in]` in any storage type.
    fn linear(&self, weight: &Tensor, bias: Option<&Tensor>) -> Result<Tensor>;
    fn layer_norm(&self, gain: &Tensor, bias: &Tensor, eps: f32) -> Result<Tensor>;
    fn gelu(&self) -> Result<Tensor>;
    fn add(&self, other: &Tensor) -> Result<Tensor>;
    fn row(&self, idx: usize) -> Result<&[f32]>;
}

impl TensorOps for Tensor {
    fn linear(&self, weight: &Tensor, bias: Option<&Tensor>) -> Result<Tensor> {
        let x = self.f32_data()?;
        let in_dim = self.shape.row_len();
        let n = self.shape.rows();
        let out_dim = weight.shape().rows();

        if weight.shape().row_len() != in_dim {
            return Err(Error::shape(format!(
                "linear: input width {} does not match weight {}",
                in_dim,
                weight.shape()
            )));
        }

        let bias = match bias {
            Some(b) => {
                let b = b.f32_data()?;
                if b.len() != out_dim {
                    return Err(Error::shape(format!("linear: bias of {} for {} outputs", b.len(), out_dim)));
                }
                Some(b)
            }
            None => None,
        };

        let columns: Vec<Vec<f32>> = (0..out_dim)
            .into_par_iter()
            .map_init(
                || vec![0.0f32; in_dim],
                |w_row, j| -> Result<Vec<f32>> {
                    weight.row_into(j, w_row)?;
                    let w_row: &[f32] = w_row;
                    let b = bias.map(|b| b[j]).unwrap_or(0.0);
                    Ok(x.chunks_exact(in_dim).map(|xi| dot(xi, w_row) + b).collect())
                },
            )
            .collect::<Result<Vec<Vec<f32>>>>()?;

        let mut result = vec![0.0; n * out_dim];
        for (j, column) in columns.iter().enumerate() {
            for (i, &v) in column.iter().enumerate() {
                result[i * out_dim + j] = v;
            }
        }

        Ok(Tensor::new(result, Shape::new(vec![n, out_dim])))
    }

    fn layer_norm(&self, gain: &Tensor, bias: &Tensor, eps: f32) -> Result<Tensor> {
        let width = self.shape.row_len();
        let g = gain.f32_data()?;
        let b = bias.f32_data()?;
        if g.len() != width || b.len() != width {
            return Err(Error::shape("layer_norm: gain/bias width mismatch"));
        }

        let mut data = self.f32_data()?.to_vec();
        for row in data.chunks_exact_mut(width) {
            let mean = row.iter().sum::<f32>() / width as f32;
            let var = row.iter().map(|&x| (x - mean).powi(2)).sum::<f32>() / width as f32;
            let scale = 1.0 / (var + eps).sqrt();
            for ((x, &g), &b) in row.iter_mut().zip(g).zip(b) {
                *x = (*x - mean) * scale * g + b;
            }
        }

        Ok(Tensor::new(data, self.shape.clone()))
    }

    fn gelu(&self) -> Result<Tensor> {
        let data: Vec<f32> = self
            .f32_data()?
            .iter()
            .map(|&x| 0.5 * x * (1.0 + (SQRT_2_OVER_PI * x * (1.0 + GELU_COEF_A * x * x)).tanh()))
            .collect();

        Ok(Tensor::new(data, self.shape.clone()))
    }

    fn add(&self, other: &Tensor) -> Result<Tensor> {
        if self.shape != other.shape {
            return Err(Error::shape(format!("add: {} vs {}", self.shape, other.shape)));
        }
        let data = self
            .f32_data()?
            .iter()
            .zip(other.f32_data()?)
            .map(|(&a, &b)| a + b)
            .collect();

        Ok(Tensor::new(data, self.shape.clone()))
    }

    fn row(&self, idx: usize) -> Result<&[f32]> {
        let width = self.shape.row_len();
        self.f32_data()?
            .chunks_exact(width)
            .nth(idx)
            .ok_or_else(|| Error::shape(format!("row {} out of range for {}", idx, self.shape)))
    }
}

pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Numerically stable softmax; `-inf` entries become zero.
pub fn softmax_in_place(values: &mut [f32]) {
    let max = values.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0;
    for v in values.iter_mut() {
        *v = if *v == f32::NEG_INFINITY { 0.0 } else { (*v - max).exp() };
        sum += *v;
    }
    if sum > 0.0 {
        for v in values.iter_mut() {
            *v /= sum;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::DType;

    #[test]
    fn test_softmax() {
        let mut v = vec![1.0, 2.0, 3.0, f32::NEG_INFINITY];
        softmax_in_place(&mut v);
        let sum: f32 = v.iter().sum();
        assert!((sum - 1.0).abs() < 1e-5);
        assert_eq!(v[3], 0.0);
        assert!(v[2] > v[1] && v[1] > v[0]);
    }

    #[test]
    fn test_linear() {
        let x = Tensor::new(vec![1.0, 2.0, 3.0, 4.0], Shape::new(vec![2, 2]));
        // weight rows are output neurons
        let w = Tensor::new(vec![1.0, 0.0, 0.0, 1.0, 1.0, 1.0], Shape::new(vec![3, 2]));
        let b = Tensor::new(vec![0.5, 0.0, -1.0], Shape::new(vec![3]));
        let y = x.linear(&w, Some(&b)).unwrap();
        assert_eq!(y.shape().dims(), &[2, 3]);
        assert_eq!(y.f32_data().unwrap(), &[1.5, 2.0, 2.0, 3.5, 4.0, 6.0]);
    }

    #[test]
    fn test_linear_with_f16_weight() {
        let x = Tensor::new(vec![1.0, -1.0], Shape::new(vec![1, 2]));
        let w = Tensor::new(vec![2.0, 1.0], Shape::new(vec![1, 2])).convert(DType::F16).unwrap();
        let y = x.linear(&w, None).unwrap();
        assert_eq!(y.f32_data().unwrap(), &[1.0]);
    }

    #[test]
    fn test_linear_width_mismatch() {
        let x = Tensor::new(vec![1.0, 2.0, 3.0], Shape::new(vec![1, 3]));
        let w = Tensor::zeros(Shape::new(vec![2, 2]));
        assert!(x.linear(&w, None).is_err());
    }

    #[test]
    fn test_layer_norm() {
        let t = Tensor::new(vec![1.0, 2.0, 3.0, 4.0], Shape::new(vec![1, 4]));
        let g = Tensor::new(vec![1.0; 4], Shape::new(vec![4]));
        let b = Tensor::new(vec![0.0; 4], Shape::new(vec![4]));
        let n = t.layer_norm(&g, &b, 1e-5).unwrap();
        let data = n.f32_data().unwrap();
        let mean: f32 = data.iter().sum::<f32>() / 4.0;
        assert!(mean.abs() < 1e-5);
        assert!(data[0] < 0.0 && data[3] > 0.0);
    }

    #[test]
    fn test_gelu() {
        let t = Tensor::new(vec![0.0, 1.0, -1.0], Shape::new(vec![3]));
        let g = t.gelu().unwrap();
        let data = g.f32_data().unwrap();
        assert_eq!(data[0], 0.0);
        assert!((data[1] - 0.841_192).abs() < 1e-4);
        assert!((data[2] + 0.158_808).abs() < 1e-4);
    }
}
