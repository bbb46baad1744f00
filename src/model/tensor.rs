use crate::errors::{NodeError, Result};
use serde::{Deserialize, Serialize};

/// Scalar type of a tensor's elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Dtype {
    #[serde(rename = "float32")]
    Float32,
    #[serde(rename = "int32")]
    Int32,
}

impl Dtype {
    pub fn size_bytes(&self) -> usize {
        match self {
            Dtype::Float32 => 4,
            Dtype::Int32 => 4,
        }
    }
}

impl std::fmt::Display for Dtype {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Dtype::Float32 => write!(f, "float32"),
            Dtype::Int32 => write!(f, "int32"),
        }
    }
}

/// An n-dimensional tensor carried as raw little-endian bytes.
///
/// Scalars are fixed to little-endian on the wire so heterogeneous
/// clusters interoperate. Invariant, checked at construction and at every
/// decode: `product(shape) * dtype.size_bytes() == data.len()`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    /// Raw element storage, little-endian
    pub data: Vec<u8>,

    /// Dimension sizes
    pub shape: Vec<i32>,

    /// Element type tag
    pub dtype: Dtype,
}

impl Tensor {
    /// Create a validated tensor from raw parts.
    pub fn new(data: Vec<u8>, shape: Vec<i32>, dtype: Dtype) -> Result<Self> {
        let tensor = Self { data, shape, dtype };
        tensor.validate()?;
        Ok(tensor)
    }

    /// Check the size invariant. Called on every decode.
    pub fn validate(&self) -> Result<()> {
        let elements = self.element_count()?;
        let expected = elements * self.dtype.size_bytes();
        if expected != self.data.len() {
            return Err(NodeError::MalformedRequest(format!(
                "tensor of shape {:?} ({}) needs {} bytes, got {}",
                self.shape,
                self.dtype,
                expected,
                self.data.len()
            )));
        }
        Ok(())
    }

    /// Number of elements implied by the shape.
    pub fn element_count(&self) -> Result<usize> {
        let mut product: usize = 1;
        for &dim in &self.shape {
            if dim < 0 {
                return Err(NodeError::MalformedRequest(format!(
                    "negative dimension in shape {:?}",
                    self.shape
                )));
            }
            product = product.checked_mul(dim as usize).ok_or_else(|| {
                NodeError::MalformedRequest(format!("shape {:?} overflows", self.shape))
            })?;
        }
        Ok(product)
    }

    /// Build a float32 tensor from host values.
    pub fn from_f32s(values: &[f32], shape: Vec<i32>) -> Result<Self> {
        let mut data = Vec::with_capacity(values.len() * 4);
        for v in values {
            data.extend_from_slice(&v.to_le_bytes());
        }
        Self::new(data, shape, Dtype::Float32)
    }

    /// Build an int32 tensor from host values.
    pub fn from_i32s(values: &[i32], shape: Vec<i32>) -> Result<Self> {
        let mut data = Vec::with_capacity(values.len() * 4);
        for v in values {
            data.extend_from_slice(&v.to_le_bytes());
        }
        Self::new(data, shape, Dtype::Int32)
    }

    /// Decode the storage as float32 host values.
    pub fn to_f32s(&self) -> Result<Vec<f32>> {
        if self.dtype != Dtype::Float32 {
            return Err(NodeError::MalformedRequest(format!(
                "expected float32 tensor, got {}",
                self.dtype
            )));
        }
        Ok(self
            .data
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }

    /// Decode the storage as int32 host values.
    pub fn to_i32s(&self) -> Result<Vec<i32>> {
        if self.dtype != Dtype::Int32 {
            return Err(NodeError::MalformedRequest(format!(
                "expected int32 tensor, got {}",
                self.dtype
            )));
        }
        Ok(self
            .data
            .chunks_exact(4)
            .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_f32_roundtrip() {
        let values = vec![1.5f32, -2.25, 0.0, 1e-7];
        let tensor = Tensor::from_f32s(&values, vec![2, 2]).unwrap();
        assert_eq!(tensor.data.len(), 16);
        assert_eq!(tensor.to_f32s().unwrap(), values);
    }

    #[test]
    fn test_i32_roundtrip() {
        let values = vec![1, -7, i32::MAX, i32::MIN];
        let tensor = Tensor::from_i32s(&values, vec![4]).unwrap();
        assert_eq!(tensor.to_i32s().unwrap(), values);
    }

    #[test]
    fn test_size_mismatch_rejected() {
        // shape [4] float32 needs 16 bytes, give 8
        let result = Tensor::new(vec![0u8; 8], vec![4], Dtype::Float32);
        assert!(matches!(result, Err(NodeError::MalformedRequest(_))));
    }

    #[test]
    fn test_negative_dimension_rejected() {
        let result = Tensor::new(vec![], vec![-1], Dtype::Float32);
        assert!(matches!(result, Err(NodeError::MalformedRequest(_))));
    }

    #[test]
    fn test_shape_overflow_rejected() {
        let result = Tensor::new(vec![], vec![i32::MAX, i32::MAX, i32::MAX], Dtype::Float32);
        assert!(result.is_err());
    }

    #[test]
    fn test_empty_tensor_is_valid() {
        let tensor = Tensor::new(vec![], vec![0], Dtype::Float32).unwrap();
        assert_eq!(tensor.element_count().unwrap(), 0);
    }

    #[test]
    fn test_little_endian_storage() {
        let tensor = Tensor::from_i32s(&[1], vec![1]).unwrap();
        assert_eq!(tensor.data, vec![1, 0, 0, 0]);
    }

    #[test]
    fn test_dtype_wire_names() {
        assert_eq!(serde_json::to_string(&Dtype::Float32).unwrap(), "\"float32\"");
        assert_eq!(serde_json::to_string(&Dtype::Int32).unwrap(), "\"int32\"");
    }

    #[test]
    fn test_cbor_roundtrip() {
        let tensor = Tensor::from_f32s(&[1.0, 2.0, 3.0], vec![3]).unwrap();
        let mut buf = Vec::new();
        ciborium::into_writer(&tensor, &mut buf).unwrap();
        let decoded: Tensor = ciborium::from_reader(&buf[..]).unwrap();
        assert_eq!(decoded, tensor);
    }
}
