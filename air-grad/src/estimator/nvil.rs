use candle_core::Tensor;

use super::baseline::{
    make_baseline_train_step, BaselineProvider, NoBaseline, BASELINE_LEARNING_RATE_SCALE,
};
use super::error::{EstimatorError, Result};
use super::normalizer::SignalNormalizer;
use super::reinforce::{reinforce, ReinforceOutput};
use super::summary::Summaries;
use super::train_step::{
    collect_gradients, ensure_optimizer, GradVarPair, OptimizerFactory, TrainContext, TrainStep,
};
use super::traits::{validate_host, Estimator, EstimatorHost, KlDivergence, LossTerm};

/// Configuration for the NVIL estimator.
#[derive(Debug, Clone, Default)]
pub struct NvilConfig {
    /// Decay of the running mean/variance used to normalise the learning
    /// signal; `None` disables normalisation
    pub decay_rate: Option<f64>,
}

impl NvilConfig {
    pub fn new(decay_rate: Option<f64>) -> Self {
        Self { decay_rate }
    }
}

/// Intermediate quantities of one NVIL step
pub struct NvilRecord {
    /// Loss whose gradient drives every model variable
    pub proxy_loss: Tensor,
    /// Learning signal before the baseline is subtracted
    pub learning_signal: Tensor,
    pub reinforce: ReinforceOutput,
    pub baseline_loss: Option<Tensor>,
    pub summaries: Summaries,
}

/// Single-sample score-function estimator (NVIL)
///
/// proxy = rec + kl + l2 + mean(detach(signal) * log q(n))
///
/// with `signal = rec(n) [+ kl(n)]`, optionally baselined and normalised.
pub struct NvilEstimator<H: ?Sized, F: OptimizerFactory> {
    config: NvilConfig,
    make_opt: F,
    baseline: Box<dyn BaselineProvider<H>>,
    normalizer: Option<SignalNormalizer>,
    optimizer: Option<F::Opt>,
    baseline_optimizer: Option<F::Opt>,
}

impl<H: ?Sized, F: OptimizerFactory> NvilEstimator<H, F> {
    /// * `config` - estimator configuration
    /// * `make_opt` - builds an optimizer from `(vars, learning_rate)`
    pub fn new(config: NvilConfig, make_opt: F) -> Result<Self> {
        let normalizer = config.decay_rate.map(SignalNormalizer::new).transpose()?;
        Ok(Self {
            config,
            make_opt,
            baseline: Box::new(NoBaseline),
            normalizer,
            optimizer: None,
            baseline_optimizer: None,
        })
    }

    pub fn with_baseline<P>(mut self, provider: P) -> Self
    where
        P: BaselineProvider<H> + 'static,
    {
        self.baseline = Box::new(provider);
        self
    }

    pub fn config(&self) -> &NvilConfig {
        &self.config
    }

    pub fn normalizer(&self) -> Option<&SignalNormalizer> {
        self.normalizer.as_ref()
    }

    /// Restore running statistics saved from an earlier run
    pub fn set_normalizer(&mut self, normalizer: SignalNormalizer) {
        self.normalizer = Some(normalizer);
    }
}

impl<H, F> Estimator<H> for NvilEstimator<H, F>
where
    H: EstimatorHost + ?Sized,
    F: OptimizerFactory,
{
    type Opt = F::Opt;
    type Record = NvilRecord;

    fn make_train_step<'a>(
        &'a mut self,
        host: &H,
        rec_loss: &LossTerm,
        kl_div: &KlDivergence,
        ctx: &'a mut TrainContext,
    ) -> Result<(TrainStep<'a, F::Opt, NvilRecord>, Vec<GradVarPair>)> {
        validate_host(host)?;
        let batch_size = host.batch_size();
        if rec_loss.per_sample.elem_count() != batch_size {
            return Err(EstimatorError::ShapeContractViolation {
                what: "per-sample reconstruction loss",
                expected: format!("{} elements", batch_size),
                got: rec_loss.per_sample.dims().to_vec(),
            });
        }

        let mut summaries = Summaries::new();

        let mut proxy_loss = (&rec_loss.aggregate + kl_div.aggregate())?;
        if let Some(l2) = host.l2_loss()? {
            proxy_loss = (proxy_loss + l2)?;
        }

        let learning_signal = if kl_div.analytic_expectation {
            rec_loss.per_sample.clone()
        } else {
            let kl_n = kl_div.per_sample().reshape(rec_loss.per_sample.shape())?;
            (&rec_loss.per_sample + kl_n)?
        };

        // running statistics are committed only once the whole step is built
        let mut normalizer = self.normalizer.clone();
        let baseline = self.baseline.make_baseline(host)?;
        let log_prob = host.num_steps_log_prob()?;
        let reinforce = reinforce(
            &learning_signal,
            &log_prob,
            baseline.as_ref(),
            normalizer.as_mut(),
            &mut summaries,
        )?;
        let proxy_loss = (proxy_loss + &reinforce.loss)?;

        let model_vars = host.model_vars();
        let baseline_vars = baseline.as_ref().map(|b| b.vars.clone()).unwrap_or_default();
        let mut grads = proxy_loss.backward()?;
        let gvs = collect_gradients(&mut grads, &model_vars, &baseline_vars);

        let learning_rate = host.learning_rate();
        let optimizer = ensure_optimizer(
            &mut self.optimizer,
            &self.make_opt,
            model_vars,
            learning_rate,
        )?;

        let (baseline_update, baseline_loss) = match baseline {
            Some(b) => {
                let step = make_baseline_train_step(&learning_signal, &b, &mut summaries)?;
                let loss = step.loss.clone();
                let opt = ensure_optimizer(
                    &mut self.baseline_optimizer,
                    &self.make_opt,
                    b.vars,
                    BASELINE_LEARNING_RATE_SCALE * learning_rate,
                )?;
                (Some((opt, step)), Some(loss))
            }
            None => (None, None),
        };
        self.normalizer = normalizer;

        let record = NvilRecord {
            proxy_loss,
            learning_signal: learning_signal.detach(),
            reinforce,
            baseline_loss,
            summaries,
        };

        Ok((
            TrainStep::new(optimizer, grads, baseline_update, ctx, record),
            gvs,
        ))
    }
}
