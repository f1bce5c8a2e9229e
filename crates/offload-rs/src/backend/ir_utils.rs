use std::sync::Arc;

use crate::backend::spec::{DType, Shape, TensorLiteral, TensorSpec, ValueType};

/// Builds a tensor spec from explicit dimensions.
pub fn tensor_spec(dtype: DType, dims: &[usize]) -> TensorSpec {
    TensorSpec::new(dtype, Shape::new(dims.to_vec()))
}

/// Wraps a tensor spec as a value type.
pub fn value_type_tensor(spec: TensorSpec) -> ValueType {
    ValueType::Tensor(spec)
}

/// Builds an `int32` literal. Returns `None` when `values` does not fill `dims`.
pub fn tensor_literal_i32(dims: &[usize], values: &[i32]) -> Option<TensorLiteral> {
    let spec = tensor_spec(DType::Si32, dims);
    if spec.element_count()? != values.len() {
        return None;
    }
    let bytes = values
        .iter()
        .flat_map(|value| value.to_ne_bytes())
        .collect::<Vec<u8>>();
    Some(TensorLiteral::new(spec, Arc::<[u8]>::from(bytes)))
}

/// Builds a `float32` literal. Returns `None` when `values` does not fill `dims`.
pub fn tensor_literal_f32(dims: &[usize], values: &[f32]) -> Option<TensorLiteral> {
    let spec = tensor_spec(DType::F32, dims);
    if spec.element_count()? != values.len() {
        return None;
    }
    let bytes = values
        .iter()
        .flat_map(|value| value.to_ne_bytes())
        .collect::<Vec<u8>>();
    Some(TensorLiteral::new(spec, Arc::<[u8]>::from(bytes)))
}

/// Resolves a possibly negative axis against `rank`.
pub fn normalize_axis(axis: i64, rank: usize) -> Option<usize> {
    let rank = i64::try_from(rank).ok()?;
    let resolved = if axis < 0 { axis + rank } else { axis };
    if (0..rank).contains(&resolved) {
        usize::try_from(resolved).ok()
    } else {
        None
    }
}

/// Row-major strides for `dims`.
pub fn contiguous_strides(dims: &[usize]) -> Vec<usize> {
    let mut strides = vec![1usize; dims.len()];
    for axis in (0..dims.len().saturating_sub(1)).rev() {
        strides[axis] = strides[axis + 1] * dims[axis + 1];
    }
    strides
}
