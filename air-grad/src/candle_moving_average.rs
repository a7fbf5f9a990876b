use serde::{Deserialize, Serialize};

use crate::estimator::{EstimatorError, Result};

/// Exponential moving average of a scalar statistic
///
/// value(t) = decay * value(t-1) + (1 - decay) * observation(t)
///
/// The state lives for a whole training run and is never reset; it can
/// be checkpointed with `serde`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MovingAverage {
    name: Box<str>,
    value: f64,
    decay: f64,
}

impl MovingAverage {
    /// * `name` - stable name of the tracked statistic
    /// * `initial` - seed value before the first update
    /// * `decay` - weight on the previous value, in `[0, 1)`
    pub fn new(name: &str, initial: f64, decay: f64) -> Result<Self> {
        if !decay.is_finite() || !(0.0..1.0).contains(&decay) {
            return Err(EstimatorError::MisconfiguredHost(format!(
                "decay rate of `{}` must be in [0, 1), got {}",
                name, decay
            )));
        }
        Ok(Self {
            name: name.into(),
            value: initial,
            decay,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn decay(&self) -> f64 {
        self.decay
    }

    /// Fold one observation into the average and return the new value
    pub fn update(&mut self, observation: f64) -> f64 {
        self.value = ema_step(self.value, observation, self.decay);
        self.value
    }
}

/// One exponential-moving-average step
pub fn ema_step(previous: f64, observation: f64, decay: f64) -> f64 {
    previous - (1.0 - decay) * (previous - observation)
}
