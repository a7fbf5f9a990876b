use anyhow::Result;
use candle_core::Device;
use clap::{Args, ValueEnum};
use log::{info, warn};

use crate::candle_inference::{adamw, train_with_estimator, TrainConfig};
use crate::candle_toy_model::{QuadraticBaseline, ToyStepCountModel};
use crate::estimator::{IwNvilConfig, IwNvilEstimator, NvilConfig, NvilEstimator};

#[derive(Clone, Debug, ValueEnum)]
pub enum EstimatorType {
    /// Single-sample NVIL
    Nvil,
    /// Importance-weighted NVIL
    IwNvil,
}

#[derive(Clone, Debug, ValueEnum)]
pub enum ComputeDevice {
    Cpu,
    Cuda,
    Metal,
}

#[derive(Args, Debug)]
pub struct ToyArgs {
    #[arg(short, long, default_value = "nvil")]
    pub estimator: EstimatorType,

    #[arg(
        long,
        value_delimiter = ',',
        default_value = "-4,0,4",
        allow_hyphen_values = true,
        help = "Component means of the simulated data, one step count per centre"
    )]
    pub centres: Vec<f32>,

    #[arg(long, default_value = "1000", help = "Number of simulated data points")]
    pub num_data: usize,

    #[arg(long, default_value = "1000")]
    pub iters: usize,

    #[arg(long, default_value = "0.01")]
    pub learning_rate: f32,

    #[arg(long, default_value = "32")]
    pub batch_size: usize,

    #[arg(long, default_value = "5", help = "Importance samples per example (IW-NVIL)")]
    pub iw_samples: usize,

    #[arg(long, help = "Decay of the learning-signal moving averages")]
    pub decay_rate: Option<f64>,

    #[arg(long, help = "Learn a quadratic baseline for the learning signal")]
    pub baseline: bool,

    #[arg(long, help = "Closed-form KL over the number of steps")]
    pub analytic_kl: bool,

    #[arg(long, help = "Train the posterior on one resampled draw per example")]
    pub importance_resample: bool,

    #[arg(long, help = "Leave the importance weights out of the learning signal")]
    pub no_r_imp_weight: bool,

    #[arg(long, help = "Clip model gradients to this global norm")]
    pub max_grad_norm: Option<f64>,

    #[arg(long, default_value = "42")]
    pub seed: u64,

    #[arg(long, default_value = "cpu")]
    pub device: ComputeDevice,

    #[arg(short, long)]
    pub verbose: bool,
}

fn make_device(device: &ComputeDevice) -> Result<Device> {
    Ok(match device {
        ComputeDevice::Cpu => Device::Cpu,
        ComputeDevice::Cuda => Device::new_cuda(0)?,
        ComputeDevice::Metal => Device::new_metal(0)?,
    })
}

pub fn run(args: &ToyArgs) -> Result<()> {
    let iw_samples = match args.estimator {
        EstimatorType::Nvil => {
            if args.iw_samples > 1 {
                warn!("NVIL uses a single posterior sample; ignoring --iw-samples");
            }
            1
        }
        EstimatorType::IwNvil => args.iw_samples,
    };

    let train_config = TrainConfig {
        learning_rate: args.learning_rate,
        batch_size: args.batch_size,
        iw_samples,
        num_iters: args.iters,
        seed: args.seed,
        max_grad_norm: args.max_grad_norm,
        device: make_device(&args.device)?,
        verbose: args.verbose,
        show_progress: true,
    };

    let mut model = ToyStepCountModel::new(&args.centres, args.num_data, &train_config)?
        .with_analytic_kl(args.analytic_kl);

    info!(
        "Training {:?} on {} points, {} step counts",
        args.estimator,
        args.num_data,
        model.num_steps()
    );

    let trace = match args.estimator {
        EstimatorType::Nvil => {
            let mut est = NvilEstimator::<ToyStepCountModel, _>::new(
                NvilConfig::new(args.decay_rate),
                adamw,
            )?;
            if args.baseline {
                est = est.with_baseline(QuadraticBaseline::new(&train_config.device)?);
            }
            train_with_estimator(&mut model, &mut est, &train_config)?
        }
        EstimatorType::IwNvil => {
            let config = IwNvilConfig {
                decay_rate: args.decay_rate,
                importance_resample: args.importance_resample,
                use_r_imp_weight: !args.no_r_imp_weight,
                seed: args.seed,
            };
            let mut est = IwNvilEstimator::<ToyStepCountModel, _>::new(config, adamw)?;
            if args.baseline {
                est = est.with_baseline(QuadraticBaseline::new(&train_config.device)?);
            }
            train_with_estimator(&mut model, &mut est, &train_config)?
        }
    };

    if let (Some(first), Some(last)) = (trace.first(), trace.last()) {
        info!("negative ELBO: {} -> {}", first, last);
    }
    info!("learned centres: {:?}", model.centres()?);
    Ok(())
}
