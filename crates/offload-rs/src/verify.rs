//! Approximate equality between computed and reference tensors.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::tensor::HostTensor;

/// How many mismatching elements a [`VerificationError`] keeps for the report.
pub const REPORTED_MISMATCHES: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tolerance {
    pub rtol: f64,
    pub atol: f64,
}

impl Default for Tolerance {
    fn default() -> Self {
        Self {
            rtol: 1e-5,
            atol: 1e-5,
        }
    }
}

impl Tolerance {
    pub fn new(rtol: f64, atol: f64) -> Self {
        Self { rtol, atol }
    }

    pub fn exact() -> Self {
        Self::new(0.0, 0.0)
    }

    /// `|actual - desired| <= atol + rtol * |desired|`. NaN only matches NaN and an
    /// infinity only matches the same infinity.
    pub fn accepts(&self, actual: f64, desired: f64) -> bool {
        if actual == desired {
            return true;
        }
        if actual.is_nan() || desired.is_nan() {
            return actual.is_nan() && desired.is_nan();
        }
        if actual.is_infinite() || desired.is_infinite() {
            return false;
        }
        (actual - desired).abs() <= self.atol + self.rtol * desired.abs()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Mismatch {
    pub index: usize,
    pub actual: f64,
    pub desired: f64,
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] actual {} desired {}",
            self.index, self.actual, self.desired
        )
    }
}

fn format_mismatches(mismatches: &[Mismatch]) -> String {
    mismatches
        .iter()
        .map(Mismatch::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum VerificationError {
    #[error("shape mismatch: actual {actual:?}, desired {desired:?}")]
    ShapeMismatch {
        actual: Vec<usize>,
        desired: Vec<usize>,
    },
    #[error(
        "not close (rtol={rtol}, atol={atol}): {count}/{total} elements differ, \
         max abs diff {max_abs_diff}, max rel diff {max_rel_diff}; first: {}",
        format_mismatches(.first)
    )]
    NotClose {
        rtol: f64,
        atol: f64,
        count: usize,
        total: usize,
        max_abs_diff: f64,
        max_rel_diff: f64,
        first: Vec<Mismatch>,
    },
}

/// Element-wise comparison of two flat buffers of the same shape.
pub fn check_close(
    actual: &[f64],
    desired: &[f64],
    tolerance: Tolerance,
) -> Result<(), VerificationError> {
    if actual.len() != desired.len() {
        return Err(VerificationError::ShapeMismatch {
            actual: vec![actual.len()],
            desired: vec![desired.len()],
        });
    }
    let mut count = 0usize;
    let mut max_abs_diff = 0.0f64;
    let mut max_rel_diff = 0.0f64;
    let mut first = Vec::new();
    for (index, (&a, &d)) in actual.iter().zip(desired).enumerate() {
        if tolerance.accepts(a, d) {
            continue;
        }
        count += 1;
        let abs = (a - d).abs();
        max_abs_diff = max_abs_diff.max(abs);
        if d != 0.0 {
            max_rel_diff = max_rel_diff.max(abs / d.abs());
        }
        if first.len() < REPORTED_MISMATCHES {
            first.push(Mismatch {
                index,
                actual: a,
                desired: d,
            });
        }
    }
    if count == 0 {
        return Ok(());
    }
    Err(VerificationError::NotClose {
        rtol: tolerance.rtol,
        atol: tolerance.atol,
        count,
        total: actual.len(),
        max_abs_diff,
        max_rel_diff,
        first,
    })
}

/// Fails unless `actual` and `desired` have the same dims and every element is within
/// `tolerance`.
pub fn assert_allclose(
    actual: &HostTensor,
    desired: &HostTensor,
    tolerance: Tolerance,
) -> Result<(), VerificationError> {
    if actual.dims() != desired.dims() {
        return Err(VerificationError::ShapeMismatch {
            actual: actual.dims().to_vec(),
            desired: desired.dims().to_vec(),
        });
    }
    check_close(&actual.to_f64_vec(), &desired.to_f64_vec(), tolerance)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn f32_tensor(values: Vec<f32>) -> HostTensor {
        let len = values.len();
        HostTensor::from_f32(vec![len], values).expect("tensor")
    }

    #[test]
    fn difference_of_exactly_atol_passes() {
        let tol = Tolerance::new(0.0, 0.5);
        assert!(assert_allclose(&f32_tensor(vec![1.5]), &f32_tensor(vec![1.0]), tol).is_ok());
        assert!(assert_allclose(&f32_tensor(vec![1.5001]), &f32_tensor(vec![1.0]), tol).is_err());
    }

    #[test]
    fn relative_term_scales_with_desired() {
        let tol = Tolerance::new(0.25, 0.0);
        assert!(tol.accepts(5.0, 4.0));
        assert!(!tol.accepts(5.001, 4.0));
        assert!(tol.accepts(-5.0, -4.0));
    }

    #[test]
    fn nan_only_matches_nan() {
        let tol = Tolerance::default();
        assert!(tol.accepts(f64::NAN, f64::NAN));
        assert!(!tol.accepts(f64::NAN, 1.0));
        assert!(!tol.accepts(1.0, f64::NAN));
        assert!(tol.accepts(f64::INFINITY, f64::INFINITY));
        assert!(!tol.accepts(f64::INFINITY, f64::NEG_INFINITY));
    }

    #[test]
    fn infinite_reference_rejects_finite_values() {
        let tol = Tolerance::default();
        assert!(!tol.accepts(5.0, f64::INFINITY));
        assert!(!tol.accepts(f64::MAX, f64::INFINITY));
        assert!(!tol.accepts(f64::NEG_INFINITY, 1.0e300));

        let actual = HostTensor::from_f32(vec![2], vec![5.0, f32::NEG_INFINITY]).expect("tensor");
        let desired = HostTensor::from_f32(vec![2], vec![f32::INFINITY; 2]).expect("tensor");
        let err = assert_allclose(&actual, &desired, tol).expect_err("infinite reference");
        assert!(matches!(err, VerificationError::NotClose { .. }));
    }

    #[test]
    fn shape_mismatch_is_reported_with_both_shapes() {
        let actual = HostTensor::from_i32(vec![2, 2], vec![0; 4]).expect("tensor");
        let desired = HostTensor::from_i32(vec![4], vec![0; 4]).expect("tensor");
        let err = assert_allclose(&actual, &desired, Tolerance::default()).expect_err("shape");
        assert_eq!(
            err,
            VerificationError::ShapeMismatch {
                actual: vec![2, 2],
                desired: vec![4],
            }
        );
    }

    #[test]
    fn mismatch_report_summarizes_differences() {
        let actual = HostTensor::from_i32(vec![4], vec![1, 2, 9, 4]).expect("tensor");
        let desired = HostTensor::from_i32(vec![4], vec![1, 2, 3, 0]).expect("tensor");
        let err = assert_allclose(&actual, &desired, Tolerance::default()).expect_err("values");
        match &err {
            VerificationError::NotClose {
                count,
                total,
                max_abs_diff,
                max_rel_diff,
                first,
                ..
            } => {
                assert_eq!(*count, 2);
                assert_eq!(*total, 4);
                assert_eq!(*max_abs_diff, 6.0);
                assert_eq!(*max_rel_diff, 2.0);
                assert_eq!(first[0].index, 2);
                assert_eq!(first[1].index, 3);
            }
            other => panic!("unexpected error {other:?}"),
        }
        let message = err.to_string();
        assert!(message.contains("2/4"));
        assert!(message.contains("[2] actual 9 desired 3"));
    }
}
