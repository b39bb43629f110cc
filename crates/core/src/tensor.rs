//! Tensor types and norm computations.

use ndarray::{ArrayD, Axis};

use crate::error::{DpError, Result};

/// Scalar type (f64 by default, f32 with feature flag).
#[cfg(not(feature = "f32"))]
pub type Scalar = f64;

/// Scalar type (f64 by default, f32 with feature flag).
#[cfg(feature = "f32")]
pub type Scalar = f32;

/// Dynamic-dimensional tensor.
pub type Tensor = ArrayD<Scalar>;

/// Order of the vector norm used to measure per-example gradients.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum NormType {
    /// L-p norm with `p >= 1`.
    Lp(f64),
    /// Maximum absolute entry.
    Inf,
}

impl Default for NormType {
    fn default() -> Self {
        NormType::Lp(2.0)
    }
}

impl NormType {
    /// Check that the norm order describes an actual norm.
    pub fn validate(self) -> Result<()> {
        match self {
            NormType::Lp(p) if !p.is_finite() || p < 1.0 => Err(DpError::config(format!(
                "norm order must be finite and >= 1, got {p}"
            ))),
            _ => Ok(()),
        }
    }

    /// Norm of all entries of a tensor.
    pub fn norm(self, t: &Tensor) -> f64 {
        match self {
            NormType::Lp(p) if p == 2.0 => l2_norm(t),
            NormType::Lp(p) => scaled_lp(t.iter().map(|&v| v as f64), p),
            NormType::Inf => {
                let mut max = 0.0_f64;
                for &v in t.iter() {
                    let v = (v as f64).abs();
                    if v.is_nan() {
                        return f64::NAN;
                    }
                    max = max.max(v);
                }
                max
            }
        }
    }

    /// Combine norms of disjoint blocks into the norm of their concatenation.
    pub fn combine<I: IntoIterator<Item = f64>>(self, norms: I) -> f64 {
        match self {
            NormType::Lp(p) => {
                let norms: Vec<f64> = norms.into_iter().collect();
                scaled_lp(norms.iter().copied(), p)
            }
            NormType::Inf => norms.into_iter().fold(0.0, |acc: f64, n| {
                if acc.is_nan() || n.is_nan() {
                    f64::NAN
                } else {
                    acc.max(n)
                }
            }),
        }
    }
}

/// L-p norm computed relative to the largest magnitude so `|v|^p` cannot overflow.
fn scaled_lp<I: Iterator<Item = f64> + Clone>(values: I, p: f64) -> f64 {
    let mut max = 0.0_f64;
    for v in values.clone() {
        let v = v.abs();
        if v.is_nan() {
            return f64::NAN;
        }
        max = max.max(v);
    }
    if max == 0.0 || max.is_infinite() {
        return max;
    }
    let sum: f64 = values.map(|v| (v.abs() / max).powf(p)).sum();
    max * sum.powf(1.0 / p)
}

/// Compute L2 norm of a tensor, handling NaN/inf.
pub fn l2_norm(t: &Tensor) -> f64 {
    let mut sum_sq: f64 = 0.0;
    for &v in t.iter() {
        let v = v as f64;
        if v.is_nan() {
            return f64::NAN;
        }
        if !v.is_finite() {
            return f64::INFINITY;
        }
        sum_sq += v * v;
    }
    sum_sq.sqrt()
}

/// Norm of every slice of `batched` along `batch_dim`.
pub fn per_example_norms(batched: &Tensor, batch_dim: usize, norm: NormType) -> Result<Vec<f64>> {
    if batch_dim >= batched.ndim() {
        return Err(DpError::invalid(format!(
            "batch_dim {batch_dim} out of range for tensor of rank {}",
            batched.ndim()
        )));
    }
    Ok(batched
        .axis_iter(Axis(batch_dim))
        .map(|example| norm.norm(&example.to_owned()))
        .collect())
}
