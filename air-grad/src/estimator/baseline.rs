use candle_core::backprop::GradStore;
use candle_core::{Result, Tensor, Var};

use super::error::Result as EstimatorResult;
use super::per_sample::{align_baseline, scalar_value};
use super::summary::{Summaries, BASELINE_LOSS};

/// Learning rate multiplier of the baseline optimizer
pub const BASELINE_LEARNING_RATE_SCALE: f64 = 10.;

/// Learned control variate for the REINFORCE learning signal
#[derive(Clone, Debug)]
pub struct Baseline {
    /// One value per example
    pub value: Tensor,
    /// Trainable variables of the baseline, disjoint from the model's
    pub vars: Vec<Var>,
}

/// Supplies the (optional) baseline for the current batch of a host `H`
pub trait BaselineProvider<H: ?Sized> {
    fn make_baseline(&self, host: &H) -> Result<Option<Baseline>>;
}

/// Default provider: no variance reduction beyond normalisation
#[derive(Clone, Copy, Debug, Default)]
pub struct NoBaseline;

impl<H: ?Sized> BaselineProvider<H> for NoBaseline {
    fn make_baseline(&self, _host: &H) -> Result<Option<Baseline>> {
        Ok(None)
    }
}

/// Gradients of the baseline regression, ready to be applied
pub struct BaselineStep {
    pub loss: Tensor,
    pub grads: GradStore,
}

/// Regress `baseline` toward the detached `target` signal
///
/// loss = 0.5 * mean_n (target(n) - baseline(n))^2
///
/// The step is applied by an optimizer holding only `baseline.vars`, so an
/// empty variable list yields a no-op update.
///
/// * `target` - learning signal, one value per example
/// * `baseline` - one value per example or a single shared value
/// * `summaries` - receives `baseline_loss`
pub fn make_baseline_train_step(
    target: &Tensor,
    baseline: &Baseline,
    summaries: &mut Summaries,
) -> EstimatorResult<BaselineStep> {
    let target = target.detach();
    let value = align_baseline("baseline", &baseline.value, &target)?;
    let loss = (target.broadcast_sub(&value)?.sqr()?.mean_all()? * 0.5)?;
    summaries.scalar(BASELINE_LOSS, scalar_value(&loss)?);

    let grads = loss.backward()?;
    Ok(BaselineStep { loss, grads })
}
