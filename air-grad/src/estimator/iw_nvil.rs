use candle_core::{Device, Tensor};
use candle_nn::ops::softmax;
use rand::distr::weighted::WeightedIndex;
use rand::distr::Distribution;
use rand::rngs::StdRng;
use rand::SeedableRng;

use super::baseline::{
    make_baseline_train_step, BaselineProvider, NoBaseline, BASELINE_LEARNING_RATE_SCALE,
};
use super::error::Result;
use super::normalizer::SignalNormalizer;
use super::per_sample::as_batch_by_sample;
use super::reinforce::{reinforce_importance_weighted, ReinforceOutput};
use super::summary::Summaries;
use super::train_step::{
    collect_gradients, ensure_optimizer, GradVarPair, OptimizerFactory, TrainContext, TrainStep,
};
use super::traits::{validate_host, Estimator, EstimatorHost, KlDivergence, LossTerm};

/// Configuration for the importance-weighted NVIL estimator.
#[derive(Debug, Clone)]
pub struct IwNvilConfig {
    /// Decay of the learning-signal running statistics; `None` disables
    /// normalisation
    pub decay_rate: Option<f64>,
    /// Train the posterior on one importance-resampled draw per example
    pub importance_resample: bool,
    /// Add the importance weights to the learning signal (ignored when
    /// resampling)
    pub use_r_imp_weight: bool,
    /// Seed of the resampling generator
    pub seed: u64,
}

impl Default for IwNvilConfig {
    fn default() -> Self {
        Self {
            decay_rate: None,
            importance_resample: false,
            use_r_imp_weight: true,
            seed: 42,
        }
    }
}

/// What gets added to the learning signal before REINFORCE
#[derive(Clone, Debug)]
pub enum ImportanceCorrection {
    /// Detached importance weights, `(batch, iw_samples)`
    Weights(Tensor),
    /// Resampled draws are already weighted: constant 1
    Resampled,
    /// No correction: constant 0
    Off,
}

impl ImportanceCorrection {
    fn select(importance_resample: bool, use_r_imp_weight: bool, weights: &Tensor) -> Self {
        if importance_resample {
            Self::Resampled
        } else if use_r_imp_weight {
            Self::Weights(weights.clone())
        } else {
            Self::Off
        }
    }

    /// `signal + r`, broadcasting `(batch, 1)` against the weights
    fn apply(&self, signal: &Tensor) -> Result<Tensor> {
        match self {
            Self::Weights(w) => Ok(signal.broadcast_add(w)?),
            Self::Resampled => Ok((signal + 1.)?),
            Self::Off => Ok(signal.clone()),
        }
    }
}

/// Intermediate quantities of one importance-weighted step
pub struct IwNvilRecord {
    /// Importance-weighted ELBO, `(batch, 1)`
    pub iw_elbo: Tensor,
    /// Detached softmax weights over samples, `(batch, iw_samples)`
    pub importance_weights: Tensor,
    /// `weights * -elbo`, `(batch, iw_samples)`, diagnostics only
    pub negative_weighted_per_sample_elbo: Tensor,
    /// Flat indices of the resampled draws
    pub resampled_index: Option<Vec<u32>>,
    /// log q(n) fed to REINFORCE: the resampled draws, `(batch, 1)`, or
    /// every draw, `(batch, iw_samples)`
    pub log_prob: Tensor,
    pub correction: ImportanceCorrection,
    /// `-iw_elbo`, `(batch, 1)`
    pub nelbo_per_sample: Tensor,
    pub nelbo: Tensor,
    pub proxy_loss: Tensor,
    /// `nelbo_per_sample + r`, before the baseline is subtracted
    pub learning_signal: Tensor,
    pub reinforce: ReinforceOutput,
    pub baseline_loss: Option<Tensor>,
    pub summaries: Summaries,
}

/// Numerically stable importance-weighted ELBO
///
/// elbo(b) = log sum_s exp(x(b,s) - m(b)) + m(b) - log S,  m(b) = max_s x(b,s)
///
/// # Arguments
/// * `per_sample_elbo` - `batch * iw_samples` values, batch-major
///
/// # Returns `(elbo, weights)`
/// * `elbo` - `(batch, 1)`
/// * `weights` - softmax over samples, `(batch, iw_samples)`
pub fn estimate_importance_weighted_elbo(
    per_sample_elbo: &Tensor,
    batch_size: usize,
    iw_samples: usize,
) -> Result<(Tensor, Tensor)> {
    let x_bs = as_batch_by_sample("per-sample ELBO", per_sample_elbo, batch_size, iw_samples)?;
    let weights_bs = softmax(&x_bs, 1)?;

    let biggest_b1 = x_bs.max_keepdim(1)?.detach();
    let normalised_bs = x_bs.broadcast_sub(&biggest_b1)?.exp()?;
    let elbo_b1 = ((normalised_bs.sum_keepdim(1)?.log()? + biggest_b1)?
        - (iw_samples as f64).ln())?;

    Ok((elbo_b1, weights_bs))
}

/// Draw one sample per row from `Categorical(weights)`
///
/// # Returns flat indices `row * iw_samples + sample`
pub fn sample_importance_indices(weights_bs: &Tensor, rng: &mut StdRng) -> Result<Vec<u32>> {
    let (_, iw_samples) = weights_bs.dims2()?;
    let rows = weights_bs
        .to_dtype(candle_core::DType::F32)?
        .to_vec2::<f32>()?;

    rows.iter()
        .enumerate()
        .map(|(b, w)| -> Result<u32> {
            let disc = WeightedIndex::new(w)
                .map_err(|e| candle_core::Error::Msg(format!("importance weights: {}", e)))?;
            Ok((b * iw_samples + disc.sample(&mut *rng)) as u32)
        })
        .collect()
}

/// Importance-weighted NVIL: REINFORCE on the IW-ELBO with `iw_samples`
/// posterior draws per example
pub struct IwNvilEstimator<H: ?Sized, F: OptimizerFactory> {
    config: IwNvilConfig,
    make_opt: F,
    baseline: Box<dyn BaselineProvider<H>>,
    normalizer: Option<SignalNormalizer>,
    rng: StdRng,
    optimizer: Option<F::Opt>,
    baseline_optimizer: Option<F::Opt>,
}

impl<H: ?Sized, F: OptimizerFactory> IwNvilEstimator<H, F> {
    pub fn new(config: IwNvilConfig, make_opt: F) -> Result<Self> {
        let normalizer = config.decay_rate.map(SignalNormalizer::new).transpose()?;
        let rng = StdRng::seed_from_u64(config.seed);
        Ok(Self {
            config,
            make_opt,
            baseline: Box::new(NoBaseline),
            normalizer,
            rng,
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

    pub fn config(&self) -> &IwNvilConfig {
        &self.config
    }

    pub fn normalizer(&self) -> Option<&SignalNormalizer> {
        self.normalizer.as_ref()
    }

    pub fn set_normalizer(&mut self, normalizer: SignalNormalizer) {
        self.normalizer = Some(normalizer);
    }
}

impl<H, F> Estimator<H> for IwNvilEstimator<H, F>
where
    H: EstimatorHost + ?Sized,
    F: OptimizerFactory,
{
    type Opt = F::Opt;
    type Record = IwNvilRecord;

    fn make_train_step<'a>(
        &'a mut self,
        host: &H,
        rec_loss: &LossTerm,
        kl_div: &KlDivergence,
        ctx: &'a mut TrainContext,
    ) -> Result<(TrainStep<'a, F::Opt, IwNvilRecord>, Vec<GradVarPair>)> {
        validate_host(host)?;
        let batch_size = host.batch_size();
        let iw_samples = host.iw_samples();
        let mut summaries = Summaries::new();

        let rec_n = &rec_loss.per_sample;
        let kl_n = kl_div.per_sample().reshape(rec_n.shape())?;
        let negative_elbo_n = (rec_n + kl_n)?;
        let elbo_n = negative_elbo_n.neg()?;

        let (iw_elbo, weights) =
            estimate_importance_weighted_elbo(&elbo_n, batch_size, iw_samples)?;
        let weights = weights.detach();

        let negative_weighted_per_sample_elbo = weights.mul(&as_batch_by_sample(
            "per-sample negative ELBO",
            &negative_elbo_n,
            batch_size,
            iw_samples,
        )?)?;

        let baseline = self.baseline.make_baseline(host)?;

        let log_prob = host.num_steps_log_prob()?;
        let (log_prob, resampled_index) = if self.config.importance_resample {
            let index = sample_importance_indices(&weights, &mut self.rng)?;
            let index_t = Tensor::from_vec(index.clone(), batch_size, &Device::Cpu)?
                .to_device(log_prob.device())?;
            let picked = log_prob
                .flatten_all()?
                .index_select(&index_t, 0)?
                .reshape((batch_size, 1))?;
            (picked, Some(index))
        } else {
            let lp = as_batch_by_sample(
                "num-steps log-probability",
                &log_prob,
                batch_size,
                iw_samples,
            )?;
            (lp, None)
        };

        let correction = ImportanceCorrection::select(
            self.config.importance_resample,
            self.config.use_r_imp_weight,
            &weights,
        );

        let nelbo_per_sample = iw_elbo.reshape((batch_size, 1))?.neg()?;
        let nelbo = nelbo_per_sample.mean_all()?;
        let mut proxy_loss = nelbo.clone();
        if let Some(l2) = host.l2_loss()? {
            proxy_loss = (proxy_loss + l2)?;
        }

        // running statistics are committed only once the whole step is built
        let mut normalizer = self.normalizer.clone();
        let learning_signal = correction.apply(&nelbo_per_sample)?;
        let reinforce = reinforce_importance_weighted(
            &learning_signal,
            &log_prob,
            baseline.as_ref(),
            normalizer.as_mut(),
            batch_size,
            iw_samples,
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
                let step = make_baseline_train_step(&nelbo_per_sample, &b, &mut summaries)?;
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

        let record = IwNvilRecord {
            iw_elbo,
            importance_weights: weights,
            negative_weighted_per_sample_elbo,
            resampled_index,
            log_prob: log_prob.detach(),
            correction,
            nelbo_per_sample: nelbo_per_sample.detach(),
            nelbo,
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::estimator::error::EstimatorError;
    use crate::estimator::summary::BASELINE_LOSS;
    use crate::estimator::test_util::{scalar, ConstantBaseline, FixedBaseline, TestHost};
    use approx::assert_abs_diff_eq;
    use candle_core::Var;
    use candle_nn::{Optimizer, SGD};

    const REC: [f32; 6] = [1., 2., 3., 4., 5., 6.];
    const KL: [f32; 6] = [0.1, 0.2, 0.3, 0.4, 0.5, 0.6];

    fn sgd(vars: Vec<Var>, lr: f64) -> candle_core::Result<SGD> {
        SGD::new(vars, lr)
    }

    fn no_optimizer(_: Vec<Var>, _: f64) -> candle_core::Result<SGD> {
        Err(candle_core::Error::Msg("optimizer unavailable".into()))
    }

    fn host() -> candle_core::Result<TestHost> {
        TestHost::new(2, 3, &[0, 1, 2, 2, 1, 0])
    }

    fn log_mean_exp(xs: &[f64]) -> f64 {
        (xs.iter().map(|x| x.exp()).sum::<f64>() / xs.len() as f64).ln()
    }

    #[test]
    fn iw_elbo_matches_naive_log_mean_exp() -> Result<()> {
        let dev = Device::Cpu;
        let x = Tensor::new(&[-1f32, -2., -3., -4., -1., -2., -3., -4.], &dev)?;
        let (elbo, _) = estimate_importance_weighted_elbo(&x, 2, 4)?;
        assert_eq!(elbo.dims(), &[2, 1]);

        let naive = log_mean_exp(&[-1., -2., -3., -4.]);
        for v in elbo.flatten_all()?.to_vec1::<f32>()? {
            assert_abs_diff_eq!(v as f64, naive, epsilon = 1e-5);
        }
        Ok(())
    }

    #[test]
    fn iw_elbo_survives_large_magnitudes() -> Result<()> {
        let dev = Device::Cpu;
        let x = Tensor::new(&[-1000f32, -1001., -1002.], &dev)?;
        let (elbo, _) = estimate_importance_weighted_elbo(&x, 1, 3)?;
        let v = elbo.flatten_all()?.to_vec1::<f32>()?[0] as f64;
        let shifted = log_mean_exp(&[0., -1., -2.]) - 1000.;
        assert!(v.is_finite());
        assert_abs_diff_eq!(v, shifted, epsilon = 1e-3);
        Ok(())
    }

    #[test]
    fn importance_weights_sum_to_one() -> Result<()> {
        let dev = Device::Cpu;
        let x = Tensor::new(&[50f32, -50., 0.3, 1e3, -1e3, 7., -2., -2., -2.], &dev)?;
        let (_, weights) = estimate_importance_weighted_elbo(&x, 3, 3)?;
        for row in weights.to_vec2::<f32>()? {
            assert!(row.iter().all(|w| *w >= 0.));
            assert_abs_diff_eq!(row.iter().sum::<f32>(), 1., epsilon = 1e-5);
        }
        Ok(())
    }

    #[test]
    fn resampled_indices_stay_in_their_row() -> Result<()> {
        let dev = Device::Cpu;
        let weights = Tensor::new(&[[0.2f32, 0.3, 0.5], [0., 0., 1.], [1., 0., 0.]], &dev)?;
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..20 {
            let idx = sample_importance_indices(&weights, &mut rng)?;
            assert!(idx[0] < 3);
            assert_eq!(idx[1], 5);
            assert_eq!(idx[2], 6);
        }
        Ok(())
    }

    #[test]
    fn proxy_loss_is_nelbo_plus_reinforce() -> Result<()> {
        let host = host()?;
        let (rec, kl) = host.losses(&REC, &KL, false)?;
        let mut est = IwNvilEstimator::<TestHost, _>::new(IwNvilConfig::default(), sgd)?;
        let mut ctx = TrainContext::default();

        let (step, gvs) = est.make_train_step(&host, &rec, &kl, &mut ctx)?;
        assert_eq!(gvs.len(), 2);
        let record = step.record();

        let row0 = log_mean_exp(&[-1.6, -2.7, -3.8]);
        let row1 = log_mean_exp(&[-4.9, -6.0, -7.1]);
        let nelbo = record.nelbo_per_sample.flatten_all()?.to_vec1::<f32>()?;
        assert_abs_diff_eq!(nelbo[0] as f64, -row0, epsilon = 1e-4);
        assert_abs_diff_eq!(nelbo[1] as f64, -row1, epsilon = 1e-4);
        assert_abs_diff_eq!(scalar(&record.nelbo)? as f64, -(row0 + row1) / 2., epsilon = 1e-4);

        assert!(matches!(record.correction, ImportanceCorrection::Weights(_)));
        assert_eq!(record.learning_signal.dims(), &[2, 3]);
        assert_eq!(record.reinforce.loss_per_sample.dims(), &[2, 3]);
        assert_eq!(record.negative_weighted_per_sample_elbo.dims(), &[2, 3]);

        let total = scalar(&record.nelbo)? + scalar(&record.reinforce.loss)?;
        assert_abs_diff_eq!(scalar(&record.proxy_loss)?, total, epsilon = 1e-5);
        Ok(())
    }

    #[test]
    fn correction_off_keeps_column_signal() -> Result<()> {
        let host = host()?;
        let (rec, kl) = host.losses(&REC, &KL, false)?;
        let config = IwNvilConfig {
            use_r_imp_weight: false,
            ..IwNvilConfig::default()
        };
        let mut est = IwNvilEstimator::<TestHost, _>::new(config, sgd)?;
        let mut ctx = TrainContext::default();

        let (step, _) = est.make_train_step(&host, &rec, &kl, &mut ctx)?;
        let record = step.record();
        assert!(matches!(record.correction, ImportanceCorrection::Off));
        assert_eq!(record.learning_signal.dims(), &[2, 1]);
        assert_eq!(
            record.learning_signal.to_vec2::<f32>()?,
            record.nelbo_per_sample.to_vec2::<f32>()?
        );
        // (batch, 1) signal against (batch, iw) log-probabilities
        assert_eq!(record.reinforce.loss_per_sample.dims(), &[2, 3]);
        Ok(())
    }

    #[test]
    fn resampling_adds_one_even_without_weight_correction() -> Result<()> {
        let host = host()?;
        let (rec, kl) = host.losses(&REC, &KL, false)?;
        let config = IwNvilConfig {
            importance_resample: true,
            use_r_imp_weight: false,
            ..IwNvilConfig::default()
        };
        let mut est = IwNvilEstimator::<TestHost, _>::new(config, sgd)?;
        let mut ctx = TrainContext::default();

        let (step, _) = est.make_train_step(&host, &rec, &kl, &mut ctx)?;
        let record = step.record();
        assert!(matches!(record.correction, ImportanceCorrection::Resampled));

        let signal = record.learning_signal.flatten_all()?.to_vec1::<f32>()?;
        let nelbo = record.nelbo_per_sample.flatten_all()?.to_vec1::<f32>()?;
        assert_abs_diff_eq!(signal[0], nelbo[0] + 1., epsilon = 1e-5);
        assert_abs_diff_eq!(signal[1], nelbo[1] + 1., epsilon = 1e-5);
        assert_eq!(record.reinforce.loss_per_sample.dims(), &[2, 1]);

        let idx = record.resampled_index.clone().expect("resampled");
        assert!(idx[0] < 3);
        assert!((3..6).contains(&idx[1]));

        // each row trains on the log-probability of its own resampled draw
        assert_eq!(record.log_prob.dims(), &[2, 1]);
        let all = host.num_steps_log_prob()?.flatten_all()?.to_vec1::<f32>()?;
        let picked = record.log_prob.flatten_all()?.to_vec1::<f32>()?;
        for (row, &i) in idx.iter().enumerate() {
            assert_abs_diff_eq!(picked[row], all[i as usize], epsilon = 1e-7);
        }
        Ok(())
    }

    #[test]
    fn same_seed_same_proxy_loss() -> Result<()> {
        let run = || -> Result<(f32, Vec<u32>)> {
            let host = host()?;
            let (rec, kl) = host.losses(&REC, &KL, false)?;
            let config = IwNvilConfig {
                importance_resample: true,
                decay_rate: Some(0.9),
                seed: 1234,
                ..IwNvilConfig::default()
            };
            let mut est = IwNvilEstimator::<TestHost, _>::new(config, sgd)?;
            let mut ctx = TrainContext::default();
            let (step, _) = est.make_train_step(&host, &rec, &kl, &mut ctx)?;
            let record = step.record();
            Ok((
                scalar(&record.proxy_loss)?,
                record.resampled_index.clone().unwrap_or_default(),
            ))
        };
        let (loss_a, idx_a) = run()?;
        let (loss_b, idx_b) = run()?;
        assert_eq!(loss_a, loss_b);
        assert_eq!(idx_a, idx_b);
        Ok(())
    }

    #[test]
    fn baseline_regresses_toward_nelbo() -> Result<()> {
        let host = host()?;
        let (rec, kl) = host.losses(&REC, &KL, false)?;
        let provider = ConstantBaseline::new(0.)?;
        let b = provider.b.clone();
        let mut est = IwNvilEstimator::new(IwNvilConfig::default(), sgd)?.with_baseline(provider);
        let mut ctx = TrainContext::default();

        let (step, gvs) = est.make_train_step(&host, &rec, &kl, &mut ctx)?;
        assert!(gvs.iter().all(|(_, v)| v.id() != b.id()));
        let record = step.record();

        let nelbo = record.nelbo_per_sample.flatten_all()?.to_vec1::<f32>()?;
        let expected = 0.5 * (nelbo[0] * nelbo[0] + nelbo[1] * nelbo[1]) / 2.;
        let baseline_loss = record.baseline_loss.as_ref().expect("baseline loss");
        assert_abs_diff_eq!(scalar(baseline_loss)?, expected, epsilon = 1e-4);
        assert!(record.summaries.get(BASELINE_LOSS).is_some());

        let mean_nelbo = (nelbo[0] + nelbo[1]) / 2.;
        step.run()?;
        let b = b.as_tensor().to_vec1::<f32>()?[0];
        assert_abs_diff_eq!(b, mean_nelbo, epsilon = 1e-4);
        Ok(())
    }

    #[test]
    fn wrong_number_of_samples_is_rejected() -> Result<()> {
        let host = host()?;
        let (rec, kl) = host.losses(&REC[..4], &KL[..4], false)?;
        let mut est = IwNvilEstimator::<TestHost, _>::new(IwNvilConfig::default(), sgd)?;
        let mut ctx = TrainContext::default();

        let err = est
            .make_train_step(&host, &rec, &kl, &mut ctx)
            .err()
            .expect("must fail");
        assert!(matches!(err, EstimatorError::ShapeContractViolation { .. }));
        assert_eq!(ctx.global_step().value(), 0);
        Ok(())
    }

    #[test]
    fn failed_optimizer_leaves_running_statistics_untouched() -> Result<()> {
        let host = host()?;
        let (rec, kl) = host.losses(&REC, &KL, false)?;
        let config = IwNvilConfig {
            decay_rate: Some(0.9),
            ..IwNvilConfig::default()
        };
        let mut est = IwNvilEstimator::<TestHost, _>::new(config, no_optimizer)?;
        let mut ctx = TrainContext::default();

        let err = est
            .make_train_step(&host, &rec, &kl, &mut ctx)
            .err()
            .expect("optimizer cannot be built");
        assert!(matches!(err, EstimatorError::Candle(_)));
        let normalizer = est.normalizer().expect("normalizer");
        assert_eq!(normalizer.moving_mean(), 0.);
        assert_eq!(normalizer.moving_var(), 1.);
        Ok(())
    }

    #[test]
    fn shared_baseline_value_is_broadcast() -> Result<()> {
        let host = host()?;
        let (rec, kl) = host.losses(&REC, &KL, false)?;
        let provider = FixedBaseline::new(&[2.])?;
        let config = IwNvilConfig {
            use_r_imp_weight: false,
            ..IwNvilConfig::default()
        };
        let mut est = IwNvilEstimator::new(config, sgd)?.with_baseline(provider);
        let mut ctx = TrainContext::default();

        let (step, _) = est.make_train_step(&host, &rec, &kl, &mut ctx)?;
        let record = step.record();
        let nelbo = record.nelbo_per_sample.flatten_all()?.to_vec1::<f32>()?;
        let signal = record.reinforce.learning_signal.flatten_all()?.to_vec1::<f32>()?;
        assert_abs_diff_eq!(signal[0], nelbo[0] - 2., epsilon = 1e-5);
        assert_abs_diff_eq!(signal[1], nelbo[1] - 2., epsilon = 1e-5);
        assert!(record.baseline_loss.is_some());
        Ok(())
    }
}
