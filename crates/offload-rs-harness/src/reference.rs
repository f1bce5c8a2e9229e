//! Reference arithmetic computed directly on host buffers.
//!
//! Nothing here goes through the IR, the compiler or the VM kernels, so a bug in those
//! paths cannot hide by appearing on both sides of a comparison.

use anyhow::{bail, Result};
use offload_rs::tensor::TensorData;
use offload_rs::HostTensor;

/// Result shape of broadcasting `a` against `b`, aligning trailing dimensions.
pub fn broadcast_shape(a: &[usize], b: &[usize]) -> Result<Vec<usize>> {
    let rank = a.len().max(b.len());
    let mut out = vec![0; rank];
    for i in 0..rank {
        let da = dim_from_end(a, rank - 1 - i);
        let db = dim_from_end(b, rank - 1 - i);
        out[i] = match (da, db) {
            (x, y) if x == y => x,
            (1, y) => y,
            (x, 1) => x,
            _ => bail!("shapes {a:?} and {b:?} cannot be broadcast"),
        };
    }
    Ok(out)
}

fn dim_from_end(dims: &[usize], from_end: usize) -> usize {
    if from_end < dims.len() {
        dims[dims.len() - 1 - from_end]
    } else {
        1
    }
}

/// Flat offset into a tensor of `dims` for the broadcast coordinate `coord`.
fn source_offset(coord: &[usize], dims: &[usize]) -> usize {
    let skip = coord.len() - dims.len();
    let mut offset = 0;
    for (axis, &dim) in dims.iter().enumerate() {
        let c = if dim == 1 { 0 } else { coord[skip + axis] };
        offset = offset * dim + c;
    }
    offset
}

fn for_each_coord(dims: &[usize], mut f: impl FnMut(&[usize])) {
    if dims.iter().any(|&d| d == 0) {
        return;
    }
    let mut coord = vec![0; dims.len()];
    loop {
        f(&coord);
        let mut axis = dims.len();
        loop {
            if axis == 0 {
                return;
            }
            axis -= 1;
            coord[axis] += 1;
            if coord[axis] < dims[axis] {
                break;
            }
            coord[axis] = 0;
        }
    }
}

/// Elementwise `a + b` with numpy broadcasting. Integers wrap.
pub fn add(a: &HostTensor, b: &HostTensor) -> Result<HostTensor> {
    let dims = broadcast_shape(a.dims(), b.dims())?;
    let data = match (a.data(), b.data()) {
        (TensorData::Si32(x), TensorData::Si32(y)) => {
            let mut out = Vec::new();
            for_each_coord(&dims, |coord| {
                let lhs = x[source_offset(coord, a.dims())];
                let rhs = y[source_offset(coord, b.dims())];
                out.push(lhs.wrapping_add(rhs));
            });
            TensorData::Si32(out)
        }
        (TensorData::F32(x), TensorData::F32(y)) => {
            let mut out = Vec::new();
            for_each_coord(&dims, |coord| {
                out.push(x[source_offset(coord, a.dims())] + y[source_offset(coord, b.dims())]);
            });
            TensorData::F32(out)
        }
        _ => bail!("cannot add {} to {}", b.dtype(), a.dtype()),
    };
    Ok(HostTensor::new(dims, data)?)
}

/// `data + bias` with the rank-1 `bias` laid along `axis`.
pub fn bias_add(data: &HostTensor, bias: &HostTensor, axis: i64) -> Result<HostTensor> {
    let rank = data.dims().len() as i64;
    let axis = if axis < 0 { axis + rank } else { axis };
    if !(0..rank).contains(&axis) {
        bail!("axis {axis} out of range for rank {rank}");
    }
    let [extent] = bias.dims() else {
        bail!("bias must be rank 1, got {:?}", bias.dims());
    };
    let mut dims = vec![1; (rank - axis) as usize];
    dims[0] = *extent;
    let bias = HostTensor::new(dims, bias.data().clone())?;
    add(data, &bias)
}
