use std::sync::Arc;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backend::spec::{DType, Shape, TensorLiteral, TensorSpec};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TensorError {
    #[error("shape {shape} holds {expected} elements but {actual} were provided")]
    ElementCount {
        shape: Shape,
        expected: usize,
        actual: usize,
    },
    #[error("shape {0} overflows the address space")]
    Overflow(Shape),
    #[error("literal for {spec} carries {actual} bytes, expected {expected}")]
    LiteralBytes {
        spec: String,
        expected: usize,
        actual: usize,
    },
}

/// Typed element storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TensorData {
    Si32(Vec<i32>),
    F32(Vec<f32>),
}

impl TensorData {
    pub fn dtype(&self) -> DType {
        match self {
            TensorData::Si32(_) => DType::Si32,
            TensorData::F32(_) => DType::F32,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            TensorData::Si32(values) => values.len(),
            TensorData::F32(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Dense row-major tensor living in host memory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostTensor {
    dims: Vec<usize>,
    data: TensorData,
}

fn checked_count(dims: &[usize]) -> Result<usize, TensorError> {
    Shape::new(dims.to_vec())
        .element_count()
        .ok_or_else(|| TensorError::Overflow(Shape::new(dims.to_vec())))
}

impl HostTensor {
    pub fn new(dims: impl Into<Vec<usize>>, data: TensorData) -> Result<Self, TensorError> {
        let dims = dims.into();
        let expected = checked_count(&dims)?;
        if expected != data.len() {
            return Err(TensorError::ElementCount {
                shape: Shape::new(dims),
                expected,
                actual: data.len(),
            });
        }
        Ok(Self { dims, data })
    }

    pub fn from_i32(dims: impl Into<Vec<usize>>, values: Vec<i32>) -> Result<Self, TensorError> {
        Self::new(dims, TensorData::Si32(values))
    }

    pub fn from_f32(dims: impl Into<Vec<usize>>, values: Vec<f32>) -> Result<Self, TensorError> {
        Self::new(dims, TensorData::F32(values))
    }

    pub fn zeros(spec: &TensorSpec) -> Result<Self, TensorError> {
        let dims = spec.shape.dims().to_vec();
        let count = checked_count(&dims)?;
        let data = match spec.dtype {
            DType::Si32 => TensorData::Si32(vec![0; count]),
            DType::F32 => TensorData::F32(vec![0.0; count]),
        };
        Ok(Self { dims, data })
    }

    /// Uniform integers in `[0, high)`.
    pub fn randint<R: Rng + ?Sized>(
        dims: impl Into<Vec<usize>>,
        high: i32,
        rng: &mut R,
    ) -> Result<Self, TensorError> {
        let dims = dims.into();
        let count = checked_count(&dims)?;
        let upper = high.max(1);
        let values = (0..count).map(|_| rng.gen_range(0..upper)).collect();
        Ok(Self {
            dims,
            data: TensorData::Si32(values),
        })
    }

    pub fn from_literal(literal: &TensorLiteral) -> Result<Self, TensorError> {
        let dims = literal.spec.shape.dims().to_vec();
        let count = checked_count(&dims)?;
        let expected = count * literal.spec.dtype.size_in_bytes();
        if literal.bytes.len() != expected {
            return Err(TensorError::LiteralBytes {
                spec: literal.spec.to_string(),
                expected,
                actual: literal.bytes.len(),
            });
        }
        let data = match literal.spec.dtype {
            DType::Si32 => TensorData::Si32(
                literal
                    .bytes
                    .chunks_exact(4)
                    .map(|chunk| i32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
                    .collect(),
            ),
            DType::F32 => TensorData::F32(
                literal
                    .bytes
                    .chunks_exact(4)
                    .map(|chunk| f32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
                    .collect(),
            ),
        };
        Ok(Self { dims, data })
    }

    pub fn to_literal(&self) -> TensorLiteral {
        TensorLiteral::new(self.spec(), Arc::<[u8]>::from(self.to_ne_bytes()))
    }

    pub fn dtype(&self) -> DType {
        self.data.dtype()
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn spec(&self) -> TensorSpec {
        TensorSpec::new(self.dtype(), Shape::new(self.dims.clone()))
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &TensorData {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut TensorData {
        &mut self.data
    }

    pub fn as_i32(&self) -> Option<&[i32]> {
        match &self.data {
            TensorData::Si32(values) => Some(values),
            TensorData::F32(_) => None,
        }
    }

    pub fn as_f32(&self) -> Option<&[f32]> {
        match &self.data {
            TensorData::F32(values) => Some(values),
            TensorData::Si32(_) => None,
        }
    }

    /// Widens every element to `f64` for tolerance checks.
    pub fn to_f64_vec(&self) -> Vec<f64> {
        match &self.data {
            TensorData::Si32(values) => values.iter().map(|&v| f64::from(v)).collect(),
            TensorData::F32(values) => values.iter().map(|&v| f64::from(v)).collect(),
        }
    }

    pub fn to_ne_bytes(&self) -> Vec<u8> {
        match &self.data {
            TensorData::Si32(values) => values.iter().flat_map(|v| v.to_ne_bytes()).collect(),
            TensorData::F32(values) => values.iter().flat_map(|v| v.to_ne_bytes()).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;

    #[test]
    fn rejects_mismatched_element_count() {
        let err = HostTensor::from_i32(vec![2, 3], vec![1, 2, 3]).expect_err("count");
        assert!(matches!(
            err,
            TensorError::ElementCount {
                expected: 6,
                actual: 3,
                ..
            }
        ));
    }

    #[test]
    fn randint_stays_below_high() {
        let mut rng = StdRng::seed_from_u64(7);
        let tensor = HostTensor::randint(vec![8, 4], 5, &mut rng).expect("randint");
        let values = tensor.as_i32().expect("int32");
        assert_eq!(values.len(), 32);
        assert!(values.iter().all(|v| (0..5).contains(v)));
    }

    #[test]
    fn literal_conversion_preserves_values() {
        let tensor = HostTensor::from_f32(vec![2], vec![1.5, -2.0]).expect("tensor");
        let literal = tensor.to_literal();
        assert_eq!(literal.byte_len(), 8);
        assert_eq!(HostTensor::from_literal(&literal).expect("back"), tensor);
    }
}
