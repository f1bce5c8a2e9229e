//! Host implementations of the builtin operators.
//!
//! Integer arithmetic wraps on overflow.

use crate::backend::ir_utils::normalize_axis;
use crate::backend::spec::{
    BackendError, BackendResult, ElementwiseBinaryOp, ElementwiseUnaryOp,
};
use crate::tensor::{HostTensor, TensorData};

fn rebuild(dims: &[usize], data: TensorData) -> BackendResult<HostTensor> {
    HostTensor::new(dims.to_vec(), data).map_err(|err| BackendError::execution(err.to_string()))
}

pub fn binary(
    op: ElementwiseBinaryOp,
    lhs: &HostTensor,
    rhs: &HostTensor,
) -> BackendResult<HostTensor> {
    if lhs.dims() != rhs.dims() {
        return Err(BackendError::execution(format!(
            "elementwise operands disagree on shape: {:?} vs {:?}",
            lhs.dims(),
            rhs.dims()
        )));
    }
    let data = match (lhs.data(), rhs.data()) {
        (TensorData::Si32(a), TensorData::Si32(b)) => {
            let f: fn(i32, i32) -> i32 = match op {
                ElementwiseBinaryOp::Add => i32::wrapping_add,
                ElementwiseBinaryOp::Sub => i32::wrapping_sub,
                ElementwiseBinaryOp::Mul => i32::wrapping_mul,
                ElementwiseBinaryOp::Maximum => i32::max,
                ElementwiseBinaryOp::Minimum => i32::min,
            };
            TensorData::Si32(a.iter().zip(b).map(|(&x, &y)| f(x, y)).collect())
        }
        (TensorData::F32(a), TensorData::F32(b)) => {
            let f: fn(f32, f32) -> f32 = match op {
                ElementwiseBinaryOp::Add => |x: f32, y: f32| x + y,
                ElementwiseBinaryOp::Sub => |x: f32, y: f32| x - y,
                ElementwiseBinaryOp::Mul => |x: f32, y: f32| x * y,
                ElementwiseBinaryOp::Maximum => f32::max,
                ElementwiseBinaryOp::Minimum => f32::min,
            };
            TensorData::F32(a.iter().zip(b).map(|(&x, &y)| f(x, y)).collect())
        }
        _ => {
            return Err(BackendError::execution(format!(
                "elementwise operands disagree on dtype: {} vs {}",
                lhs.dtype(),
                rhs.dtype()
            )))
        }
    };
    rebuild(lhs.dims(), data)
}

pub fn unary(op: ElementwiseUnaryOp, input: &HostTensor) -> BackendResult<HostTensor> {
    let data = match input.data() {
        TensorData::Si32(values) => TensorData::Si32(match op {
            ElementwiseUnaryOp::Neg => values.iter().map(|v| v.wrapping_neg()).collect(),
            ElementwiseUnaryOp::Abs => values.iter().map(|v| v.wrapping_abs()).collect(),
        }),
        TensorData::F32(values) => TensorData::F32(match op {
            ElementwiseUnaryOp::Neg => values.iter().map(|v| -v).collect(),
            ElementwiseUnaryOp::Abs => values.iter().map(|v| v.abs()).collect(),
        }),
    };
    rebuild(input.dims(), data)
}

/// Adds the rank-1 `bias` along `axis` of `data`.
pub fn bias_add(data: &HostTensor, bias: &HostTensor, axis: i64) -> BackendResult<HostTensor> {
    let dims = data.dims();
    let axis = normalize_axis(axis, dims.len()).ok_or_else(|| {
        BackendError::execution(format!(
            "bias axis {axis} out of range for rank {}",
            dims.len()
        ))
    })?;
    let extent = dims[axis];
    if bias.dims() != [extent] {
        return Err(BackendError::execution(format!(
            "bias shape {:?} does not match extent {extent}",
            bias.dims()
        )));
    }
    let inner: usize = dims[axis + 1..].iter().product();
    let channel = |index: usize| (index / inner.max(1)) % extent.max(1);
    let out = match (data.data(), bias.data()) {
        (TensorData::Si32(values), TensorData::Si32(b)) => TensorData::Si32(
            values
                .iter()
                .enumerate()
                .map(|(i, v)| v.wrapping_add(b[channel(i)]))
                .collect(),
        ),
        (TensorData::F32(values), TensorData::F32(b)) => TensorData::F32(
            values
                .iter()
                .enumerate()
                .map(|(i, v)| v + b[channel(i)])
                .collect(),
        ),
        _ => {
            return Err(BackendError::execution(format!(
                "bias dtype {} does not match data dtype {}",
                bias.dtype(),
                data.dtype()
            )))
        }
    };
    rebuild(dims, out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bias_add_broadcasts_along_middle_axis() {
        let data = HostTensor::from_i32(vec![2, 3, 2], vec![0; 12]).expect("data");
        let bias = HostTensor::from_i32(vec![3], vec![1, 2, 3]).expect("bias");
        let out = bias_add(&data, &bias, 1).expect("bias_add");
        assert_eq!(
            out.as_i32().expect("int32"),
            &[1, 1, 2, 2, 3, 3, 1, 1, 2, 2, 3, 3]
        );
    }

    #[test]
    fn integer_add_wraps() {
        let a = HostTensor::from_i32(vec![1], vec![i32::MAX]).expect("a");
        let b = HostTensor::from_i32(vec![1], vec![1]).expect("b");
        let out = binary(ElementwiseBinaryOp::Add, &a, &b).expect("add");
        assert_eq!(out.as_i32().expect("int32"), &[i32::MIN]);
    }

    #[test]
    fn mixed_dtypes_are_rejected() {
        let a = HostTensor::from_i32(vec![1], vec![1]).expect("a");
        let b = HostTensor::from_f32(vec![1], vec![1.0]).expect("b");
        assert!(binary(ElementwiseBinaryOp::Mul, &a, &b).is_err());
    }
}
