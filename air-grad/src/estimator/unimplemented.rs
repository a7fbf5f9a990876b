use std::marker::PhantomData;

use candle_nn::Optimizer;

use super::error::{EstimatorError, Result};
use super::train_step::{GradVarPair, TrainContext, TrainStep};
use super::traits::{Estimator, EstimatorHost, KlDivergence, LossTerm};

/// Importance-weighted NVIL trained on importance-resampled particles.
/// Not available yet: every step fails with
/// [`EstimatorError::Unimplemented`].
pub struct ResampledImportanceWeightedNvilEstimator<O> {
    _optimizer: PhantomData<O>,
}

/// VIMCO, leave-one-out multi-sample baselines. Not available yet.
pub struct VimcoEstimator<O> {
    _optimizer: PhantomData<O>,
}

fn unimplemented_step<'a, O: Optimizer>(
    label: &'static str,
) -> Result<(TrainStep<'a, O, ()>, Vec<GradVarPair>)> {
    Err(EstimatorError::Unimplemented(label))
}

impl<O> ResampledImportanceWeightedNvilEstimator<O> {
    pub fn new() -> Self {
        Self {
            _optimizer: PhantomData,
        }
    }
}

impl<O> Default for ResampledImportanceWeightedNvilEstimator<O> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H, O> Estimator<H> for ResampledImportanceWeightedNvilEstimator<O>
where
    H: EstimatorHost + ?Sized,
    O: Optimizer,
{
    type Opt = O;
    type Record = ();

    fn make_train_step<'a>(
        &'a mut self,
        _host: &H,
        _rec_loss: &LossTerm,
        _kl_div: &KlDivergence,
        _ctx: &'a mut TrainContext,
    ) -> Result<(TrainStep<'a, O, ()>, Vec<GradVarPair>)> {
        unimplemented_step("importance-resampled IW-NVIL")
    }
}

impl<O> VimcoEstimator<O> {
    pub fn new() -> Self {
        Self {
            _optimizer: PhantomData,
        }
    }
}

impl<O> Default for VimcoEstimator<O> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H, O> Estimator<H> for VimcoEstimator<O>
where
    H: EstimatorHost + ?Sized,
    O: Optimizer,
{
    type Opt = O;
    type Record = ();

    fn make_train_step<'a>(
        &'a mut self,
        _host: &H,
        _rec_loss: &LossTerm,
        _kl_div: &KlDivergence,
        _ctx: &'a mut TrainContext,
    ) -> Result<(TrainStep<'a, O, ()>, Vec<GradVarPair>)> {
        unimplemented_step("VIMCO")
    }
}
