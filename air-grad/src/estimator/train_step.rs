use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use candle_core::backprop::GradStore;
use candle_core::{Result, Tensor, Var};
use candle_nn::Optimizer;

use super::baseline::BaselineStep;
use super::error::Result as EstimatorResult;
use super::per_sample::scalar_value;

/// A gradient and the variable it belongs to
pub type GradVarPair = (Tensor, Var);

/// Builds an optimizer over `vars` with the given learning rate
pub trait OptimizerFactory {
    type Opt: Optimizer;

    fn make(&self, vars: Vec<Var>, learning_rate: f64) -> Result<Self::Opt>;
}

impl<O, F> OptimizerFactory for F
where
    O: Optimizer,
    F: Fn(Vec<Var>, f64) -> Result<O>,
{
    type Opt = O;

    fn make(&self, vars: Vec<Var>, learning_rate: f64) -> Result<O> {
        self(vars, learning_rate)
    }
}

/// Shared training-step counter
#[derive(Clone, Debug, Default)]
pub struct GlobalStep(Arc<AtomicUsize>);

impl GlobalStep {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resume counting from a restored value
    pub fn starting_at(step: usize) -> Self {
        Self(Arc::new(AtomicUsize::new(step)))
    }

    pub fn value(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    /// Returns the step count after the increment
    fn increment(&self) -> usize {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// Side effect that must happen before each parameter update,
/// e.g. refreshing batch-norm running statistics
pub type UpdateOp = Box<dyn FnMut() -> Result<()>>;

/// Per-run state the training step depends on
#[derive(Default)]
pub struct TrainContext {
    update_ops: Vec<UpdateOp>,
    global_step: GlobalStep,
}

impl TrainContext {
    pub fn new(global_step: GlobalStep) -> Self {
        Self {
            update_ops: vec![],
            global_step,
        }
    }

    pub fn with_update_op<F>(mut self, op: F) -> Self
    where
        F: FnMut() -> Result<()> + 'static,
    {
        self.update_ops.push(Box::new(op));
        self
    }

    pub fn push_update_op<F>(&mut self, op: F)
    where
        F: FnMut() -> Result<()> + 'static,
    {
        self.update_ops.push(Box::new(op));
    }

    pub fn global_step(&self) -> &GlobalStep {
        &self.global_step
    }
}

/// One fully computed training step, applied by [`TrainStep::run`]
///
/// Running it executes the update ops, applies the main gradients,
/// increments the global step and finally applies the baseline update.
pub struct TrainStep<'a, O: Optimizer, R> {
    optimizer: &'a mut O,
    grads: GradStore,
    baseline: Option<(&'a mut O, BaselineStep)>,
    ctx: &'a mut TrainContext,
    record: R,
}

impl<'a, O: Optimizer, R> TrainStep<'a, O, R> {
    pub(crate) fn new(
        optimizer: &'a mut O,
        grads: GradStore,
        baseline: Option<(&'a mut O, BaselineStep)>,
        ctx: &'a mut TrainContext,
        record: R,
    ) -> Self {
        Self {
            optimizer,
            grads,
            baseline,
            ctx,
            record,
        }
    }

    /// Intermediate quantities of this step
    pub fn record(&self) -> &R {
        &self.record
    }

    pub fn has_baseline_update(&self) -> bool {
        self.baseline.is_some()
    }

    pub fn learning_rate(&self) -> f64 {
        self.optimizer.learning_rate()
    }

    pub fn baseline_learning_rate(&self) -> Option<f64> {
        self.baseline.as_ref().map(|(opt, _)| opt.learning_rate())
    }

    /// Replace the gradient applied to `var`
    pub fn set_gradient(&mut self, var: &Var, grad: Tensor) {
        self.grads.insert(var.as_tensor(), grad);
    }

    /// Rescale the gradients of `vars` so their global L2 norm is at most
    /// `max_norm`
    ///
    /// # Returns the norm before clipping
    pub fn clip_grad_norm(&mut self, vars: &[Var], max_norm: f64) -> EstimatorResult<f64> {
        let mut sq_norm = 0f64;
        for v in vars {
            if let Some(g) = self.grads.get(v.as_tensor()) {
                sq_norm += scalar_value(&g.sqr()?.sum_all()?)?;
            }
        }
        let norm = sq_norm.sqrt();
        if norm > max_norm {
            let scale = max_norm / norm;
            for v in vars {
                if let Some(g) = self.grads.get(v.as_tensor()) {
                    let clipped = (g * scale)?;
                    self.grads.insert(v.as_tensor(), clipped);
                }
            }
        }
        Ok(norm)
    }

    /// Apply the step
    ///
    /// # Returns `(global_step, record)`
    pub fn run(self) -> EstimatorResult<(usize, R)> {
        let Self {
            optimizer,
            grads,
            baseline,
            ctx,
            record,
        } = self;

        for op in ctx.update_ops.iter_mut() {
            op()?;
        }
        optimizer.step(&grads)?;
        let step = ctx.global_step.increment();

        if let Some((baseline_opt, baseline_step)) = baseline {
            baseline_opt.step(&baseline_step.grads)?;
        }
        Ok((step, record))
    }
}

/// Collect the gradients of `model_vars`, dropping any entry for the
/// baseline's variables from the store
pub fn collect_gradients(
    grads: &mut GradStore,
    model_vars: &[Var],
    baseline_vars: &[Var],
) -> Vec<GradVarPair> {
    for v in baseline_vars {
        grads.remove(v.as_tensor());
    }
    model_vars
        .iter()
        .filter_map(|v| grads.get(v.as_tensor()).map(|g| (g.clone(), v.clone())))
        .collect()
}

/// Build the optimizer on first use, then keep it (and its state) for the
/// rest of the run
pub(crate) fn ensure_optimizer<'o, F: OptimizerFactory>(
    slot: &'o mut Option<F::Opt>,
    make_opt: &F,
    vars: Vec<Var>,
    learning_rate: f64,
) -> EstimatorResult<&'o mut F::Opt> {
    let mut opt = match slot.take() {
        Some(opt) => opt,
        None => make_opt.make(vars, learning_rate)?,
    };
    opt.set_learning_rate(learning_rate);
    Ok(slot.insert(opt))
}
