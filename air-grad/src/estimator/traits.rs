use candle_core::{Result, Tensor, Var};
use candle_nn::Optimizer;

use super::error::{EstimatorError, Result as EstimatorResult};
use super::train_step::{GradVarPair, TrainContext, TrainStep};

/// A loss reported by the host model
pub struct LossTerm {
    /// Batch average, scalar
    pub aggregate: Tensor,
    /// One value per example, shape (n,) or (n, 1)
    pub per_sample: Tensor,
}

impl LossTerm {
    pub fn new(aggregate: Tensor, per_sample: Tensor) -> Self {
        Self {
            aggregate,
            per_sample,
        }
    }

    /// Build from the per-sample values, taking their mean as the aggregate
    pub fn from_per_sample(per_sample: Tensor) -> Result<Self> {
        let aggregate = per_sample.mean_all()?;
        Ok(Self {
            aggregate,
            per_sample,
        })
    }
}

/// KL divergence reported by the host model
pub struct KlDivergence {
    pub loss: LossTerm,
    /// The expectation over the number of steps is computed in closed
    /// form, so no score-function term is needed for it
    pub analytic_expectation: bool,
}

impl KlDivergence {
    pub fn new(loss: LossTerm, analytic_expectation: bool) -> Self {
        Self {
            loss,
            analytic_expectation,
        }
    }

    pub fn aggregate(&self) -> &Tensor {
        &self.loss.aggregate
    }

    pub fn per_sample(&self) -> &Tensor {
        &self.loss.per_sample
    }
}

/// Posterior over the number of inference steps
pub trait NumStepsPosterior {
    /// Log-probability of each sampled step count
    ///
    /// # Arguments
    /// * `num_steps` - sampled step counts, one per (example, iw-sample)
    ///
    /// # Returns
    /// Log-probability with gradients to the posterior parameters, same
    /// number of elements as `num_steps`
    fn log_prob(&self, num_steps: &Tensor) -> Result<Tensor>;
}

/// What an estimator needs from the model it trains.
///
/// The host samples `num_step_per_sample` from its posterior before the
/// estimator is invoked.
pub trait EstimatorHost {
    fn learning_rate(&self) -> f64;

    fn batch_size(&self) -> usize;

    /// Number of importance samples per example
    fn iw_samples(&self) -> usize {
        1
    }

    /// Trainable variables of the main objective (never the baseline's)
    fn model_vars(&self) -> Vec<Var>;

    /// Weight decay term added to the proxy loss
    fn l2_loss(&self) -> Result<Option<Tensor>> {
        Ok(None)
    }

    fn num_steps_posterior(&self) -> &dyn NumStepsPosterior;

    fn num_step_per_sample(&self) -> &Tensor;

    fn num_steps_log_prob(&self) -> Result<Tensor> {
        self.num_steps_posterior()
            .log_prob(self.num_step_per_sample())
    }
}

/// Common interface of the gradient estimators
pub trait Estimator<H: EstimatorHost + ?Sized> {
    type Opt: Optimizer;
    type Record;

    /// Compute the proxy loss and its gradients for one batch
    ///
    /// # Arguments
    /// * `host` - model that produced the losses and sampled step counts
    /// * `rec_loss` - reconstruction loss
    /// * `kl_div` - KL divergence
    /// * `ctx` - update ops and global step of the training run
    ///
    /// # Returns `(train_step, gradient_pairs)`
    /// * `train_step` - applies the update when run
    /// * `gradient_pairs` - `(gradient, var)` over the model variables
    #[allow(clippy::type_complexity)]
    fn make_train_step<'a>(
        &'a mut self,
        host: &H,
        rec_loss: &LossTerm,
        kl_div: &KlDivergence,
        ctx: &'a mut TrainContext,
    ) -> EstimatorResult<(TrainStep<'a, Self::Opt, Self::Record>, Vec<GradVarPair>)>;
}

/// Reject hosts whose reported hyper-parameters cannot drive a step
pub fn validate_host<H: EstimatorHost + ?Sized>(host: &H) -> EstimatorResult<()> {
    let lr = host.learning_rate();
    if !lr.is_finite() || lr <= 0. {
        return Err(EstimatorError::MisconfiguredHost(format!(
            "learning rate must be positive and finite, got {}",
            lr
        )));
    }
    if host.batch_size() == 0 {
        return Err(EstimatorError::MisconfiguredHost("batch size is zero".into()));
    }
    if host.iw_samples() == 0 {
        return Err(EstimatorError::MisconfiguredHost(
            "number of importance samples is zero".into(),
        ));
    }
    Ok(())
}
