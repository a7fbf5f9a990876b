//! A small host model for exercising the estimators.
//!
//! Data are one-dimensional draws from a mixture of unit-variance Gaussians.
//! The latent "number of steps" n picks the mixture component:
//!
//! - generative: `x | n ~ N(mu(n), 1)`, `p(n) = 1/K`
//! - inference: `q(n | x) = softmax(w * x + b)`
//!
//! n is discrete, so `w` and `b` only learn through the score-function
//! term; `mu` learns through the reparameterised path.

use crate::candle_inference::{MinibatchHost, TrainConfig};
use crate::candle_loss_functions::{
    categorical_kl_uniform, categorical_kl_uniform_sampled, gaussian_nll,
};
use crate::estimator::{
    self,
    Baseline, BaselineProvider, EstimatorError, EstimatorHost, KlDivergence, LossTerm,
    NumStepsPosterior,
};

use candle_core::{DType, Device, Result, Tensor, Var};
use candle_nn::ops::log_softmax;
use rand::distr::weighted::WeightedIndex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

/// `q(n | x)` evaluated on the current minibatch
pub struct AmortisedStepPosterior {
    log_q_sk: Tensor,
}

impl NumStepsPosterior for AmortisedStepPosterior {
    fn log_prob(&self, num_steps: &Tensor) -> Result<Tensor> {
        let idx = num_steps.flatten_all()?.unsqueeze(1)?;
        self.log_q_sk.gather(&idx, 1)?.squeeze(1)
    }
}

struct ToyMinibatch {
    /// one input per example, (batch,)
    x_b: Tensor,
    /// inputs repeated per iw-sample, (batch * iw,)
    x_s: Tensor,
    logits_sk: Tensor,
    steps_s: Tensor,
    posterior: AmortisedStepPosterior,
}

pub struct ToyStepCountModel {
    data: Vec<f32>,
    w: Var,
    b: Var,
    mu: Var,
    num_steps: usize,
    analytic_kl: bool,
    learning_rate: f64,
    batch_size: usize,
    iw_samples: usize,
    rng: StdRng,
    minibatch: ToyMinibatch,
}

impl ToyStepCountModel {
    /// Simulate `num_data` points around `true_centres` and set up a model
    /// with one step count per centre
    ///
    /// * `true_centres` - component means of the simulated data
    /// * `num_data` - number of data points
    /// * `train_config` - learning rate, batch size, iw-samples, seed, device
    pub fn new(
        true_centres: &[f32],
        num_data: usize,
        train_config: &TrainConfig,
    ) -> estimator::Result<Self> {
        if true_centres.is_empty() || num_data == 0 {
            return Err(EstimatorError::MisconfiguredHost(
                "toy model needs at least one centre and one data point".into(),
            ));
        }

        let mut rng = StdRng::seed_from_u64(train_config.seed);
        let data = simulate_data(true_centres, num_data, &mut rng)?;

        let device = &train_config.device;
        let k = true_centres.len();
        let mu_init: Vec<f32> = (0..k).map(|j| j as f32 - (k - 1) as f32 / 2.).collect();

        let w = Var::zeros(k, DType::F32, device)?;
        let b = Var::zeros(k, DType::F32, device)?;
        let mu = Var::from_tensor(&Tensor::from_vec(mu_init, k, device)?)?;

        let minibatch = draw_minibatch(
            &data,
            &w,
            &b,
            train_config.batch_size,
            train_config.iw_samples,
            &mut rng,
        )?;

        Ok(Self {
            data,
            w,
            b,
            mu,
            num_steps: k,
            analytic_kl: false,
            learning_rate: train_config.learning_rate as f64,
            batch_size: train_config.batch_size,
            iw_samples: train_config.iw_samples,
            rng,
            minibatch,
        })
    }

    /// Compute the KL expectation over n in closed form
    pub fn with_analytic_kl(mut self, analytic_kl: bool) -> Self {
        self.analytic_kl = analytic_kl;
        self
    }

    pub fn num_steps(&self) -> usize {
        self.num_steps
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Inputs of the current minibatch, one per example
    pub fn current_inputs(&self) -> &Tensor {
        &self.minibatch.x_b
    }

    /// Learned per-step means
    pub fn centres(&self) -> Result<Vec<f32>> {
        self.mu.as_tensor().to_vec1::<f32>()
    }
}

impl EstimatorHost for ToyStepCountModel {
    fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn iw_samples(&self) -> usize {
        self.iw_samples
    }

    fn model_vars(&self) -> Vec<Var> {
        vec![self.w.clone(), self.b.clone(), self.mu.clone()]
    }

    fn num_steps_posterior(&self) -> &dyn NumStepsPosterior {
        &self.minibatch.posterior
    }

    fn num_step_per_sample(&self) -> &Tensor {
        &self.minibatch.steps_s
    }
}

impl MinibatchHost for ToyStepCountModel {
    fn next_minibatch(&mut self) -> Result<()> {
        self.minibatch = draw_minibatch(
            &self.data,
            &self.w,
            &self.b,
            self.batch_size,
            self.iw_samples,
            &mut self.rng,
        )?;
        Ok(())
    }

    fn losses(&self) -> Result<(LossTerm, KlDivergence)> {
        let mb = &self.minibatch;
        let mu_s = self.mu.as_tensor().index_select(&mb.steps_s, 0)?;
        let rec_s = gaussian_nll(&mb.x_s, &mu_s)?;

        let kl_s = if self.analytic_kl {
            categorical_kl_uniform(&mb.logits_sk)?
        } else {
            categorical_kl_uniform_sampled(&self.num_steps_log_prob()?, self.num_steps)?
        };

        Ok((
            LossTerm::from_per_sample(rec_s)?,
            KlDivergence::new(LossTerm::from_per_sample(kl_s)?, self.analytic_kl),
        ))
    }
}

fn simulate_data(true_centres: &[f32], num_data: usize, rng: &mut StdRng) -> Result<Vec<f32>> {
    let components = true_centres
        .iter()
        .map(|&c| {
            Normal::new(c, 1.)
                .map_err(|e| candle_core::Error::Msg(format!("centre {}: {}", c, e)))
        })
        .collect::<Result<Vec<_>>>()?;

    Ok((0..num_data)
        .map(|_| {
            let j = rng.random_range(0..components.len());
            components[j].sample(&mut *rng)
        })
        .collect())
}

fn draw_minibatch(
    data: &[f32],
    w: &Var,
    b: &Var,
    batch_size: usize,
    iw_samples: usize,
    rng: &mut StdRng,
) -> Result<ToyMinibatch> {
    let device = w.device();

    let x_b: Vec<f32> = (0..batch_size)
        .map(|_| data[rng.random_range(0..data.len())])
        .collect();
    let x_s: Vec<f32> = x_b
        .iter()
        .flat_map(|&x| std::iter::repeat(x).take(iw_samples))
        .collect();

    let nsamples = x_s.len();
    let x_b = Tensor::from_vec(x_b, batch_size, device)?;
    let x_s = Tensor::from_vec(x_s, nsamples, device)?;

    let logits_sk = x_s
        .unsqueeze(1)?
        .broadcast_mul(w.as_tensor())?
        .broadcast_add(b.as_tensor())?;
    let log_q_sk = log_softmax(&logits_sk, 1)?;

    let probs = log_q_sk.detach().exp()?.to_vec2::<f32>()?;
    let steps = probs
        .iter()
        .map(|q| {
            let disc = WeightedIndex::new(q)
                .map_err(|e| candle_core::Error::Msg(format!("step posterior: {}", e)))?;
            Ok(disc.sample(&mut *rng) as u32)
        })
        .collect::<Result<Vec<_>>>()?;
    let steps_s = Tensor::from_vec(steps, nsamples, device)?;

    Ok(ToyMinibatch {
        x_b,
        x_s,
        logits_sk,
        steps_s,
        posterior: AmortisedStepPosterior { log_q_sk },
    })
}

/// Baseline `c0 + c1 * x + c2 * x^2` on the example's input
pub struct QuadraticBaseline {
    coef: Var,
}

impl QuadraticBaseline {
    pub fn new(device: &Device) -> Result<Self> {
        Ok(Self {
            coef: Var::zeros((3, 1), DType::F32, device)?,
        })
    }

    pub fn coefficients(&self) -> Result<Vec<f32>> {
        self.coef.as_tensor().flatten_all()?.to_vec1::<f32>()
    }
}

impl BaselineProvider<ToyStepCountModel> for QuadraticBaseline {
    fn make_baseline(&self, host: &ToyStepCountModel) -> Result<Option<Baseline>> {
        let x_b = host.current_inputs();
        let features_b3 = Tensor::stack(&[x_b.ones_like()?, x_b.clone(), x_b.sqr()?], 1)?;
        let value = features_b3
            .matmul(self.coef.as_tensor())?
            .reshape(host.batch_size())?;
        Ok(Some(Baseline {
            value,
            vars: vec![self.coef.clone()],
        }))
    }
}
