use candle_core::Tensor;
use serde::{Deserialize, Serialize};

use super::error::Result;
use super::per_sample::moments;
use crate::candle_moving_average::MovingAverage;

pub const MOVING_MEAN_NAME: &str = "imp_weight_moving_mean";
pub const MOVING_VAR_NAME: &str = "imp_weight_moving_var";

/// Running centring and scaling of the REINFORCE learning signal (NVIL)
///
/// signal <- (signal - moving_mean) / max(sqrt(moving_var), 1)
///
/// Mean is seeded at 0 and variance at 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalNormalizer {
    mean: MovingAverage,
    var: MovingAverage,
}

impl SignalNormalizer {
    pub fn new(decay_rate: f64) -> Result<Self> {
        Ok(Self {
            mean: MovingAverage::new(MOVING_MEAN_NAME, 0., decay_rate)?,
            var: MovingAverage::new(MOVING_VAR_NAME, 1., decay_rate)?,
        })
    }

    pub fn moving_mean(&self) -> f64 {
        self.mean.value()
    }

    pub fn moving_var(&self) -> f64 {
        self.var.value()
    }

    /// Fold the batch moments of `signal` into the running statistics
    ///
    /// # Returns the updated `(moving_mean, moving_var)`
    pub fn update(&mut self, signal: &Tensor) -> Result<(f64, f64)> {
        let (mean, var) = moments(signal)?;
        Ok((self.mean.update(mean), self.var.update(var)))
    }

    /// Centre and scale `signal` with the current running statistics
    pub fn normalize(&self, signal: &Tensor) -> Result<Tensor> {
        let denom = normalization_denominator(self.var.value());
        Ok(signal.affine(1. / denom, -self.mean.value() / denom)?)
    }
}

/// Scale used to divide the centred signal; never below 1
pub fn normalization_denominator(moving_var: f64) -> f64 {
    moving_var.max(0.).sqrt().max(1.)
}
