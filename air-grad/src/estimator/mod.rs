//! Score-function gradient estimators for the number-of-steps posterior.
//!
//! The discrete number of inference steps is not differentiable, so its
//! posterior is trained with REINFORCE while every continuous path keeps
//! its reparameterised gradient. Each estimator turns the host's
//! reconstruction and KL losses into a proxy loss:
//!
//! `proxy = nelbo + l2 + mean(detach(signal) * log q(n))`
//!
//! # Variance reduction
//!
//! - Learned baseline subtracted from the signal (`BaselineProvider`)
//! - Moving-average normalisation: `(signal - mean) / max(std, 1)`
//! - Importance weighting over `iw_samples` posterior draws (IW-NVIL)
//!
//! # Example
//!
//! ```ignore
//! use air_grad::estimator::{Estimator, NvilConfig, NvilEstimator, TrainContext};
//!
//! let mut est = NvilEstimator::new(NvilConfig::new(Some(0.9)), |vars, lr| {
//!     AdamW::new_lr(vars, lr)
//! })?;
//! let mut ctx = TrainContext::default();
//!
//! for _ in 0..num_iters {
//!     let (rec, kl) = model.losses(&batch)?;
//!     let (step, _grads) = est.make_train_step(&model, &rec, &kl, &mut ctx)?;
//!     step.run()?;
//! }
//! ```

mod baseline;
mod error;
mod iw_nvil;
mod normalizer;
mod nvil;
mod per_sample;
mod reinforce;
mod summary;
mod train_step;
mod traits;
mod unimplemented;

#[cfg(test)]
mod test_util;

pub use baseline::{
    make_baseline_train_step, Baseline, BaselineProvider, BaselineStep, NoBaseline,
    BASELINE_LEARNING_RATE_SCALE,
};
pub use error::{EstimatorError, Result};
pub use iw_nvil::{
    estimate_importance_weighted_elbo, sample_importance_indices, ImportanceCorrection,
    IwNvilConfig, IwNvilEstimator, IwNvilRecord,
};
pub use normalizer::{normalization_denominator, SignalNormalizer};
pub use nvil::{NvilConfig, NvilEstimator, NvilRecord};
pub use per_sample::{moments, scalar_value};
pub use reinforce::{reinforce, reinforce_importance_weighted, ReinforceOutput};
pub use summary::{Summaries, BASELINE_LOSS, IMP_WEIGHT_MEAN, IMP_WEIGHT_VAR, REINFORCE_LOSS};
pub use train_step::{
    collect_gradients, GlobalStep, GradVarPair, OptimizerFactory, TrainContext, TrainStep,
    UpdateOp,
};
pub use traits::{
    validate_host, Estimator, EstimatorHost, KlDivergence, LossTerm, NumStepsPosterior,
};
pub use unimplemented::{ResampledImportanceWeightedNvilEstimator, VimcoEstimator};
