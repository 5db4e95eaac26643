pub mod ops;
pub mod quant;

pub use ops::TensorOps;

use crate::core::{Error, Result};
use half::f16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    F32,
    F16,
    Q4_0,
    Q4_1,
    Q5_0,
    Q5_1,
    Q8_0,
}

impl DType {
    pub fn ggml_id(&self) -> i32 {
        match self {
            DType::F32 => 0,
            DType::F16 => 1,
            DType::Q4_0 => 2,
            DType::Q4_1 => 3,
            DType::Q5_0 => 6,
            DType::Q5_1 => 7,
            DType::Q8_0 => 8,
        }
    }

    pub fn from_ggml_id(id: i32) -> Result<Self> {
        match id {
            0 => Ok(DType::F32),
            1 => Ok(DType::F16),
            2 => Ok(DType::Q4_0),
            3 => Ok(DType::Q4_1),
            6 => Ok(DType::Q5_0),
            7 => Ok(DType::Q5_1),
            8 => Ok(DType::Q8_0),
            _ => Err(Error::format(format!("Unsupported tensor type {}", id))),
        }
    }

    pub fn block_size(&self) -> usize {
        match self {
            DType::F32 | DType::F16 => 1,
            _ => quant::QK,
        }
    }

    /// Bytes occupied by one block (one element for the float types).
    pub fn type_size(&self) -> usize {
        match self {
            DType::F32 => 4,
            DType::F16 => 2,
            DType::Q4_0 => 2 + quant::QK / 2,
            DType::Q4_1 => 4 + quant::QK / 2,
            DType::Q5_0 => 6 + quant::QK / 2,
            DType::Q5_1 => 8 + quant::QK / 2,
            DType::Q8_0 => 2 + quant::QK,
        }
    }

    pub fn is_quantized(&self) -> bool {
        !matches!(self, DType::F32 | DType::F16)
    }

    pub fn row_bytes(&self, n_elements: usize) -> Result<usize> {
        let block = self.block_size();
        if n_elements % block != 0 {
            return Err(Error::shape(format!(
                "row of {} elements is not a multiple of the {} block size {}",
                n_elements,
                self.name(),
                block
            )));
        }
        Ok(n_elements / block * self.type_size())
    }

    pub fn name(&self) -> &'static str {
        match self {
            DType::F32 => "f32",
            DType::F16 => "f16",
            DType::Q4_0 => "q4_0",
            DType::Q4_1 => "q4_1",
            DType::Q5_0 => "q5_0",
            DType::Q5_1 => "q5_1",
            DType::Q8_0 => "q8_0",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shape {
    dims: Vec<usize>,
}

impl Shape {
    pub fn new(dims: Vec<usize>) -> Self {
        Self { dims }
    }

    pub fn from_slice(dims: &[usize]) -> Self {
        Self { dims: dims.to_vec() }
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn len(&self) -> usize {
        self.dims.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dims.is_empty()
    }

    pub fn numel(&self) -> usize {
        self.dims.iter().product()
    }

    /// Length of the contiguous (last) dimension.
    pub fn row_len(&self) -> usize {
        self.dims.last().copied().unwrap_or(1)
    }

    pub fn rows(&self) -> usize {
        match self.row_len() {
            0 => 0,
            n => self.numel() / n,
        }
    }

    pub fn byte_size(&self, dtype: DType) -> Result<usize> {
        Ok(dtype.row_bytes(self.row_len())? * self.rows())
    }
}

impl std::fmt::Display for Shape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let dims: Vec<String> = self.dims.iter().map(|d| d.to_string()).collect();
        write!(f, "[{}]", dims.join(", "))
    }
}

#[derive(Debug, Clone)]
enum Storage {
    F32(Vec<f32>),
    F16(Vec<f16>),
    Blocks(Vec<u8>),
}

#[derive(Debug, Clone)]
pub struct Tensor {
    data: Storage,
    shape: Shape,
    dtype: DType,
}

impl Tensor {
    pub fn new(data: Vec<f32>, shape: Shape) -> Self {
        Self {
            data: Storage::F32(data),
            shape,
            dtype: DType::F32,
        }
    }

    pub fn zeros(shape: Shape) -> Self {
        let numel = shape.numel();
        Self::new(vec![0.0; numel], shape)
    }

    pub fn from_f16(data: Vec<f16>, shape: Shape) -> Self {
        Self {
            data: Storage::F16(data),
            shape,
            dtype: DType::F16,
        }
    }

    /// Builds a tensor from its little-endian on-disk representation.
    pub fn from_bytes(dtype: DType, shape: Shape, bytes: Vec<u8>) -> Result<Self> {
        let expected = shape.byte_size(dtype)?;
        if bytes.len() != expected {
            return Err(Error::format(format!(
                "Tensor of shape {} and type {} needs {} bytes, got {}",
                shape,
                dtype.name(),
                expected,
                bytes.len()
            )));
        }

        let data = match dtype {
            DType::F32 => Storage::F32(
                bytes
                    .chunks_exact(4)
                    .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect(),
            ),
            DType::F16 => Storage::F16(
                bytes
                    .chunks_exact(2)
                    .map(|c| f16::from_bits(u16::from_le_bytes([c[0], c[1]])))
                    .collect(),
            ),
            _ => Storage::Blocks(bytes),
        };

        Ok(Self { data, shape, dtype })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        match &self.data {
            Storage::F32(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            Storage::F16(v) => v.iter().flat_map(|x| x.to_bits().to_le_bytes()).collect(),
            Storage::Blocks(b) => b.clone(),
        }
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn numel(&self) -> usize {
        self.shape.numel()
    }

    pub fn n_dims(&self) -> usize {
        self.shape.len()
    }

    pub fn f32_data(&self) -> Result<&[f32]> {
        match &self.data {
            Storage::F32(v) => Ok(v),
            _ => Err(Error::shape(format!("expected an f32 tensor, found {}", self.dtype.name()))),
        }
    }

    pub fn f32_data_mut(&mut self) -> Result<&mut [f32]> {
        match &mut self.data {
            Storage::F32(v) => Ok(v),
            _ => Err(Error::shape(format!("expected an f32 tensor, found {}", self.dtype.name()))),
        }
    }

    /// Dequantizes one row of the contiguous dimension into `out`.
    pub fn row_into(&self, row: usize, out: &mut [f32]) -> Result<()> {
        let row_len = self.shape.row_len();
        if row >= self.shape.rows() || out.len() != row_len {
            return Err(Error::shape(format!(
                "row {} of length {} out of range for shape {}",
                row,
                out.len(),
                self.shape
            )));
        }

        match &self.data {
            Storage::F32(v) => out.copy_from_slice(&v[row * row_len..(row + 1) * row_len]),
            Storage::F16(v) => {
                for (o, x) in out.iter_mut().zip(&v[row * row_len..(row + 1) * row_len]) {
                    *o = x.to_f32();
                }
            }
            Storage::Blocks(bytes) => {
                let row_bytes = self.dtype.row_bytes(row_len)?;
                quant::dequantize_row(self.dtype, &bytes[row * row_bytes..(row + 1) * row_bytes], out);
            }
        }
        Ok(())
    }

    pub fn to_f32_vec(&self) -> Result<Vec<f32>> {
        let row_len = self.shape.row_len();
        let mut out = vec![0.0; self.numel()];
        if row_len == 0 {
            return Ok(out);
        }
        for (row, chunk) in out.chunks_exact_mut(row_len).enumerate() {
            self.row_into(row, chunk)?;
        }
        Ok(out)
    }

    /// Re-encodes the tensor in `dtype`, going through f32.
    pub fn convert(&self, dtype: DType) -> Result<Tensor> {
        if dtype == self.dtype {
            return Ok(self.clone());
        }

        let values = self.to_f32_vec()?;
        let data = match dtype {
            DType::F32 => Storage::F32(values),
            DType::F16 => Storage::F16(values.iter().map(|&x| f16::from_f32(x)).collect()),
            _ => {
                let row_len = self.shape.row_len();
                let mut bytes = Vec::with_capacity(self.shape.byte_size(dtype)?);
                for row in values.chunks_exact(row_len) {
                    quant::quantize_row(dtype, row, &mut bytes);
                }
                Storage::Blocks(bytes)
            }
        };

        Ok(Tensor {
            data,
            shape: self.shape.clone(),
            dtype,
        })
    }

    pub fn reshape(&self, shape: Shape) -> Result<Self> {
        if self.shape.numel() != shape.numel() {
            return Err(Error::shape("Cannot reshape: element count mismatch"));
        }

        Ok(Self {
            data: self.data.clone(),
            shape,
            dtype: self.dtype,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tensor_creation() {
        let t = Tensor::zeros(Shape::new(vec![10, 20]));
        assert_eq!(t.shape().dims(), &[10, 20]);
        assert_eq!(t.numel(), 200);
        assert_eq!(t.shape().rows(), 10);
        assert_eq!(t.shape().row_len(), 20);
    }

    #[test]
    fn test_byte_sizes() {
        let shape = Shape::new(vec![4, 64]);
        assert_eq!(shape.byte_size(DType::F32).unwrap(), 4 * 64 * 4);
        assert_eq!(shape.byte_size(DType::F16).unwrap(), 4 * 64 * 2);
        assert_eq!(shape.byte_size(DType::Q8_0).unwrap(), 4 * 2 * 34);
        assert_eq!(shape.byte_size(DType::Q4_0).unwrap(), 4 * 2 * 18);
        assert!(Shape::new(vec![3, 33]).byte_size(DType::Q4_1).is_err());
    }

    #[test]
    fn test_ggml_ids() {
        for dtype in [DType::F32, DType::F16, DType::Q4_0, DType::Q4_1, DType::Q5_0, DType::Q5_1, DType::Q8_0] {
            assert_eq!(DType::from_ggml_id(dtype.ggml_id()).unwrap(), dtype);
        }
        assert!(DType::from_ggml_id(4).is_err());
    }

    #[test]
    fn test_from_bytes_rejects_wrong_length() {
        let err = Tensor::from_bytes(DType::F32, Shape::new(vec![2, 2]), vec![0u8; 12]).unwrap_err();
        assert!(matches!(err, Error::Format(_)));
    }

    #[test]
    fn test_f16_row_access() {
        let t = Tensor::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], Shape::new(vec![2, 3]));
        let h = t.convert(DType::F16).unwrap();
        assert_eq!(h.dtype(), DType::F16);

        let mut row = vec![0.0; 3];
        h.row_into(1, &mut row).unwrap();
        assert_eq!(row, vec![4.0, 5.0, 6.0]);
        assert!(h.row_into(2, &mut row).is_err());
        assert!(h.f32_data().is_err());
    }

    #[test]
    fn test_bytes_preserve_values() {
        let t = Tensor::new(vec![0.5, -1.25, 3.0, 8.0], Shape::new(vec![4]));
        let back = Tensor::from_bytes(DType::F32, t.shape().clone(), t.to_bytes()).unwrap();
        assert_eq!(back.f32_data().unwrap(), t.f32_data().unwrap());
    }
}
