use candle_core::{DType, Tensor};

use super::error::{EstimatorError, Result};

/// Read a rank-0 tensor as `f64` regardless of its float dtype
pub fn scalar_value(x: &Tensor) -> Result<f64> {
    Ok(x.to_dtype(DType::F64)?.to_scalar::<f64>()?)
}

/// Mean and population variance over all elements
///
/// # Returns `(mean, var)`
pub fn moments(x: &Tensor) -> Result<(f64, f64)> {
    let x = x.detach().to_dtype(DType::F64)?.flatten_all()?;
    let mean = x.mean_all()?;
    let var = x.broadcast_sub(&mean)?.sqr()?.mean_all()?;
    Ok((mean.to_scalar::<f64>()?, var.to_scalar::<f64>()?))
}

/// Reshape a per-example quantity to `(batch, 1)`
///
/// * `what` - name used in the error message
/// * `x` - tensor holding exactly `batch` elements
pub fn as_column(what: &'static str, x: &Tensor, batch: usize) -> Result<Tensor> {
    if x.elem_count() != batch {
        return Err(EstimatorError::ShapeContractViolation {
            what,
            expected: format!("{} elements", batch),
            got: x.dims().to_vec(),
        });
    }
    Ok(x.reshape((batch, 1))?)
}

/// Reshape a flat (example, iw-sample) quantity to `(batch, iw_samples)`
pub fn as_batch_by_sample(
    what: &'static str,
    x: &Tensor,
    batch: usize,
    iw_samples: usize,
) -> Result<Tensor> {
    if x.elem_count() != batch * iw_samples {
        return Err(EstimatorError::ShapeContractViolation {
            what,
            expected: format!("{} x {} elements", batch, iw_samples),
            got: x.dims().to_vec(),
        });
    }
    Ok(x.reshape((batch, iw_samples))?)
}

/// Fail unless `x` is exactly `(batch, 1)` or `(batch, iw_samples)`
pub fn check_batch_shape(
    what: &'static str,
    x: &Tensor,
    batch: usize,
    iw_samples: usize,
) -> Result<()> {
    match x.dims() {
        &[rows, cols] if rows == batch && (cols == 1 || cols == iw_samples) => Ok(()),
        dims => Err(EstimatorError::ShapeContractViolation {
            what,
            expected: format!("({}, 1) or ({}, {})", batch, batch, iw_samples),
            got: dims.to_vec(),
        }),
    }
}

/// Reshape a baseline so it broadcasts against `like`
///
/// Accepted: one value per element of `like`, a single shared value, or
/// one value per row of a `(rows, cols)` tensor.
pub fn align_baseline(what: &'static str, baseline: &Tensor, like: &Tensor) -> Result<Tensor> {
    let n = baseline.elem_count();
    if n == like.elem_count() {
        return Ok(baseline.reshape(like.shape())?);
    }
    if n == 1 {
        return Ok(baseline.reshape(vec![1usize; like.rank()])?);
    }
    match like.dims() {
        &[rows, _] if rows == n => Ok(baseline.reshape((rows, 1))?),
        dims => Err(EstimatorError::ShapeContractViolation {
            what,
            expected: format!(
                "1, {} or {} elements",
                dims.first().copied().unwrap_or(1),
                like.elem_count()
            ),
            got: baseline.dims().to_vec(),
        }),
    }
}
