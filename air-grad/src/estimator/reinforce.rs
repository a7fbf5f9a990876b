//! Score-function (REINFORCE) correction for the number-of-steps posterior.
//!
//! The correction adds `mean(detach(signal) * log q(n))` to the proxy
//! loss. Its gradient with respect to the posterior parameters is the
//! score-function estimator, while the learning signal itself stays a
//! constant.

use candle_core::Tensor;

use super::baseline::Baseline;
use super::error::{EstimatorError, Result};
use super::normalizer::SignalNormalizer;
use super::per_sample::{align_baseline, check_batch_shape, moments, scalar_value};
use super::summary::{Summaries, IMP_WEIGHT_MEAN, IMP_WEIGHT_VAR, REINFORCE_LOSS};

/// Everything the REINFORCE correction computed
#[derive(Clone, Debug)]
pub struct ReinforceOutput {
    /// Aggregate loss, scalar
    pub loss: Tensor,
    /// `detach(signal) * log_prob` before reduction
    pub loss_per_sample: Tensor,
    /// Final learning signal after baseline subtraction and normalisation
    pub learning_signal: Tensor,
    pub signal_mean: f64,
    pub signal_var: f64,
}

/// Single-sample REINFORCE correction
///
/// * `signal` - per-example learning signal, (n,) or (n, 1)
/// * `log_prob` - log q(n) of the sampled step counts, same element count
/// * `baseline` - optional control variate, subtracted from the signal
/// * `normalizer` - running statistics, present when a decay rate is set
/// * `summaries` - receives signal moments and `reinforce_loss`
pub fn reinforce(
    signal: &Tensor,
    log_prob: &Tensor,
    baseline: Option<&Baseline>,
    normalizer: Option<&mut SignalNormalizer>,
    summaries: &mut Summaries,
) -> Result<ReinforceOutput> {
    if log_prob.elem_count() != signal.elem_count() {
        return Err(EstimatorError::ShapeContractViolation {
            what: "num-steps log-probability",
            expected: format!("{:?}", signal.dims()),
            got: log_prob.dims().to_vec(),
        });
    }
    let log_prob = log_prob.reshape(signal.shape())?;

    let mut signal = subtract_baseline(signal, baseline)?;

    if let Some(normalizer) = normalizer {
        normalizer.update(&signal)?;
        signal = normalizer.normalize(&signal)?;
    }

    let (signal_mean, signal_var) = record_signal_moments(&signal, summaries)?;

    let loss_per_sample = signal.detach().mul(&log_prob)?;
    let loss = loss_per_sample.mean_all()?;
    summaries.scalar(REINFORCE_LOSS, scalar_value(&loss)?);

    Ok(ReinforceOutput {
        loss,
        loss_per_sample,
        learning_signal: signal.detach(),
        signal_mean,
        signal_var,
    })
}

/// Importance-weighted REINFORCE correction
///
/// The batch moments feeding the running statistics are taken from the
/// incoming signal, before baseline subtraction. The per-sample loss must
/// be `(batch, 1)` or `(batch, iw_samples)`; it is summed over samples and
/// averaged over the batch.
///
/// * `signal` - `(batch, 1)` or `(batch, iw_samples)`
/// * `log_prob` - `(batch, 1)` or `(batch, iw_samples)`
pub fn reinforce_importance_weighted(
    signal: &Tensor,
    log_prob: &Tensor,
    baseline: Option<&Baseline>,
    normalizer: Option<&mut SignalNormalizer>,
    batch_size: usize,
    iw_samples: usize,
    summaries: &mut Summaries,
) -> Result<ReinforceOutput> {
    check_batch_shape("learning signal", signal, batch_size, iw_samples)?;
    check_batch_shape("num-steps log-probability", log_prob, batch_size, iw_samples)?;

    let mut learning_signal = subtract_baseline(signal, baseline)?;

    if let Some(normalizer) = normalizer {
        normalizer.update(signal)?;
        learning_signal = normalizer.normalize(&learning_signal)?;
    }

    let (signal_mean, signal_var) = record_signal_moments(&learning_signal, summaries)?;

    let loss_per_sample = learning_signal.detach().broadcast_mul(log_prob)?;
    check_batch_shape("reinforce loss", &loss_per_sample, batch_size, iw_samples)?;

    let loss = loss_per_sample.sum(1)?.mean(0)?;
    summaries.scalar(REINFORCE_LOSS, scalar_value(&loss)?);

    Ok(ReinforceOutput {
        loss,
        loss_per_sample,
        learning_signal: learning_signal.detach(),
        signal_mean,
        signal_var,
    })
}

/// `signal - baseline`, see [`align_baseline`] for the accepted shapes
fn subtract_baseline(signal: &Tensor, baseline: Option<&Baseline>) -> Result<Tensor> {
    match baseline {
        None => Ok(signal.clone()),
        Some(b) => {
            let value = align_baseline("baseline", &b.value, signal)?;
            Ok(signal.broadcast_sub(&value)?)
        }
    }
}

fn record_signal_moments(signal: &Tensor, summaries: &mut Summaries) -> Result<(f64, f64)> {
    let (mean, var) = moments(signal)?;
    summaries.scalar(IMP_WEIGHT_MEAN, mean);
    summaries.scalar(IMP_WEIGHT_VAR, var);
    Ok((mean, var))
}
