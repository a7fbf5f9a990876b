use candle_core::{DType, Device, Result, Tensor, Var};
use candle_nn::ops::log_softmax;

use super::baseline::{Baseline, BaselineProvider};
use super::traits::{EstimatorHost, KlDivergence, LossTerm, NumStepsPosterior};

pub(crate) struct CategoricalPosterior {
    pub logits: Var,
}

impl NumStepsPosterior for CategoricalPosterior {
    fn log_prob(&self, num_steps: &Tensor) -> Result<Tensor> {
        log_softmax(self.logits.as_tensor(), 0)?.index_select(num_steps, 0)
    }
}

/// Host with a scalar continuous parameter `theta` and a categorical
/// posterior over three step counts
pub(crate) struct TestHost {
    pub learning_rate: f64,
    pub batch_size: usize,
    pub iw_samples: usize,
    pub posterior: CategoricalPosterior,
    pub theta: Var,
    pub num_steps: Tensor,
}

impl TestHost {
    pub fn new(batch_size: usize, iw_samples: usize, num_steps: &[u32]) -> Result<Self> {
        let dev = Device::Cpu;
        Ok(Self {
            learning_rate: 0.1,
            batch_size,
            iw_samples,
            posterior: CategoricalPosterior {
                logits: Var::new(&[0.1f32, 0.2, 0.3], &dev)?,
            },
            theta: Var::new(&[0.5f32], &dev)?,
            num_steps: Tensor::new(num_steps, &dev)?,
        })
    }

    /// rec(i) = rec[i] + theta, kl(i) = kl[i]
    pub fn losses(
        &self,
        rec: &[f32],
        kl: &[f32],
        analytic_kl: bool,
    ) -> Result<(LossTerm, KlDivergence)> {
        let dev = Device::Cpu;
        let rec_n = Tensor::new(rec, &dev)?.broadcast_add(self.theta.as_tensor())?;
        let kl_n = Tensor::new(kl, &dev)?;
        Ok((
            LossTerm::from_per_sample(rec_n)?,
            KlDivergence::new(LossTerm::from_per_sample(kl_n)?, analytic_kl),
        ))
    }
}

impl EstimatorHost for TestHost {
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
        vec![self.theta.clone(), self.posterior.logits.clone()]
    }

    fn num_steps_posterior(&self) -> &dyn NumStepsPosterior {
        &self.posterior
    }

    fn num_step_per_sample(&self) -> &Tensor {
        &self.num_steps
    }
}

/// Learned constant baseline, one value shared by every example
pub(crate) struct ConstantBaseline {
    pub b: Var,
}

impl ConstantBaseline {
    pub fn new(init: f32) -> Result<Self> {
        Ok(Self {
            b: Var::new(&[init], &Device::Cpu)?,
        })
    }
}

impl BaselineProvider<TestHost> for ConstantBaseline {
    fn make_baseline(&self, host: &TestHost) -> Result<Option<Baseline>> {
        let value = self.b.as_tensor().broadcast_as(host.batch_size)?;
        Ok(Some(Baseline {
            value,
            vars: vec![self.b.clone()],
        }))
    }
}

/// Learned baseline used as given, without broadcasting to the batch
pub(crate) struct FixedBaseline {
    pub b: Var,
}

impl FixedBaseline {
    pub fn new(init: &[f32]) -> Result<Self> {
        Ok(Self {
            b: Var::new(init, &Device::Cpu)?,
        })
    }
}

impl BaselineProvider<TestHost> for FixedBaseline {
    fn make_baseline(&self, _host: &TestHost) -> Result<Option<Baseline>> {
        Ok(Some(Baseline {
            value: self.b.as_tensor().clone(),
            vars: vec![self.b.clone()],
        }))
    }
}

pub(crate) fn scalar(x: &Tensor) -> Result<f32> {
    x.to_dtype(DType::F32)?.to_scalar::<f32>()
}
