use log::debug;

pub const BASELINE_LOSS: &str = "baseline_loss";
pub const REINFORCE_LOSS: &str = "reinforce_loss";
pub const IMP_WEIGHT_MEAN: &str = "imp_weight_mean";
pub const IMP_WEIGHT_VAR: &str = "imp_weight_var";

/// Scalar diagnostics emitted by one training step, keyed by stable names
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Summaries {
    scalars: Vec<(&'static str, f64)>,
}

impl Summaries {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scalar(&mut self, name: &'static str, value: f64) {
        debug!("{}: {}", name, value);
        self.scalars.push((name, value));
    }

    /// Latest value recorded under `name`
    pub fn get(&self, name: &str) -> Option<f64> {
        self.scalars
            .iter()
            .rev()
            .find(|(k, _)| *k == name)
            .map(|(_, v)| *v)
    }

    pub fn iter(&self) -> impl Iterator<Item = &(&'static str, f64)> {
        self.scalars.iter()
    }
}
