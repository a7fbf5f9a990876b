use crate::estimator::{
    scalar_value, Estimator, EstimatorHost, KlDivergence, LossTerm, TrainContext,
};

use candle_core::{Result, Var};
use candle_nn::AdamW;
use indicatif::{ProgressBar, ProgressDrawTarget};
use log::info;

pub struct TrainConfig {
    pub learning_rate: f32,
    pub batch_size: usize,
    pub iw_samples: usize,
    pub num_iters: usize,
    pub seed: u64,
    /// Rescale model gradients to this global L2 norm before each update
    pub max_grad_norm: Option<f64>,
    pub device: candle_core::Device,
    pub verbose: bool,
    pub show_progress: bool,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-2,
            batch_size: 32,
            iw_samples: 1,
            num_iters: 500,
            seed: 42,
            max_grad_norm: None,
            device: candle_core::Device::Cpu,
            verbose: false,
            show_progress: true,
        }
    }
}

/// A host that can draw its own minibatches
pub trait MinibatchHost: EstimatorHost {
    /// Draw the next minibatch and sample the number of steps for every
    /// (example, iw-sample) from the current posterior
    fn next_minibatch(&mut self) -> Result<()>;

    /// Reconstruction loss and KL divergence of the current minibatch
    fn losses(&self) -> Result<(LossTerm, KlDivergence)>;
}

/// Default optimizer factory
pub fn adamw(vars: Vec<Var>, learning_rate: f64) -> Result<AdamW> {
    AdamW::new_lr(vars, learning_rate)
}

/// Train a host model with a gradient estimator
///
/// * `host` - model drawing minibatches and reporting losses
/// * `estimator` - turns the losses into parameter updates
/// * `train_config` - training configuration
///
/// # Returns per-iteration negative ELBO, `rec + kl` averaged over the batch
pub fn train_with_estimator<H, E>(
    host: &mut H,
    estimator: &mut E,
    train_config: &TrainConfig,
) -> anyhow::Result<Vec<f32>>
where
    H: MinibatchHost,
    E: Estimator<H>,
{
    let pb = ProgressBar::new(train_config.num_iters as u64);

    if !train_config.show_progress || train_config.verbose {
        pb.set_draw_target(ProgressDrawTarget::hidden());
    }

    let mut ctx = TrainContext::default();
    let mut nelbo_trace = vec![];

    for _iter in 0..train_config.num_iters {
        host.next_minibatch()?;
        let (rec, kl) = host.losses()?;
        let nelbo = scalar_value(&(&rec.aggregate + kl.aggregate())?)?;

        let (mut step, grads) = estimator.make_train_step(host, &rec, &kl, &mut ctx)?;
        if let Some(max_norm) = train_config.max_grad_norm {
            let vars: Vec<Var> = grads.into_iter().map(|(_, v)| v).collect();
            let norm = step.clip_grad_norm(&vars, max_norm)?;
            log::debug!("gradient norm: {}", norm);
        }
        let (global_step, _) = step.run()?;

        nelbo_trace.push(nelbo as f32);
        pb.inc(1);

        if train_config.verbose && (global_step % 50 == 0 || global_step == 1) {
            info!(
                "[{}] negative ELBO: {}",
                global_step,
                nelbo_trace.last().ok_or(anyhow::anyhow!("nelbo"))?
            );
        }
    }
    pb.finish_and_clear();
    Ok(nelbo_trace)
}
