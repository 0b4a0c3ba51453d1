//! Gradient accumulation, per-group norm clipping and the AdamW step.
//!
//! Each micro-batch's loss is backpropagated immediately and its parameter
//! gradients are summed into a pending buffer. On an accumulation boundary
//! the buffer is clipped group by group, handed to AdamW in one step and
//! cleared.

use std::collections::HashMap;

use candle_core::backprop::GradStore;
use candle_core::{DType, Tensor, TensorId, Var};
use candle_nn::optim::{AdamW, Optimizer, ParamsAdamW};
use tracing::debug;

use crate::error::{TrainError, TrainResult};

/// Parameters clipped together.
#[derive(Debug, Clone)]
pub struct ParamGroup {
    pub name: &'static str,
    pub vars: Vec<Var>,
    /// `None` leaves the group unclipped.
    pub max_grad_norm: Option<f64>,
}

/// Pre-clip gradient norm of every group at an optimizer step.
#[derive(Debug, Clone, PartialEq)]
pub struct StepReport {
    pub grad_norms: Vec<(&'static str, f64)>,
}

pub struct AccumulatingOptimizer {
    optimizer: AdamW,
    groups: Vec<ParamGroup>,
    accumulate: usize,
    pending: HashMap<TensorId, Tensor>,
    micro_batches: usize,
}

impl AccumulatingOptimizer {
    /// One AdamW over the union of all groups.
    pub fn new(groups: Vec<ParamGroup>, learning_rate: f64, accumulate: usize) -> TrainResult<Self> {
        if accumulate == 0 {
            return Err(TrainError::Config("accumulate must be at least 1".into()));
        }
        let vars: Vec<Var> = groups.iter().flat_map(|g| g.vars.iter().cloned()).collect();
        let params = ParamsAdamW { lr: learning_rate, ..Default::default() };
        let optimizer = AdamW::new(vars, params)?;
        Ok(Self { optimizer, groups, accumulate, pending: HashMap::new(), micro_batches: 0 })
    }

    pub fn learning_rate(&self) -> f64 {
        self.optimizer.learning_rate()
    }

    /// Micro-batches summed since the last optimizer step.
    pub fn pending_micro_batches(&self) -> usize {
        self.micro_batches
    }

    /// Backpropagate `loss` (already divided by the accumulation factor) and
    /// step when `step % accumulate == accumulate - 1`.
    ///
    /// `step` is the caller's global micro-batch counter, so accumulation
    /// windows run across epoch boundaries.
    pub fn backward(&mut self, loss: &Tensor, step: usize) -> TrainResult<Option<StepReport>> {
        let mut grads = loss.backward()?;
        self.add(&grads)?;
        if step % self.accumulate != self.accumulate - 1 {
            return Ok(None);
        }
        self.flush(&mut grads).map(Some)
    }

    fn add(&mut self, grads: &GradStore) -> TrainResult<()> {
        for var in self.groups.iter().flat_map(|g| g.vars.iter()) {
            let Some(grad) = grads.get(var.as_tensor()) else { continue };
            let id = var.as_tensor().id();
            let summed = match self.pending.remove(&id) {
                Some(prev) => (prev + grad)?,
                None => grad.clone(),
            };
            self.pending.insert(id, summed);
        }
        self.micro_batches += 1;
        Ok(())
    }

    /// Clip, write the summed gradients into `carrier` and step.
    fn flush(&mut self, carrier: &mut GradStore) -> TrainResult<StepReport> {
        let mut grad_norms = Vec::with_capacity(self.groups.len());
        for group in &self.groups {
            let norm = grad_norm(&self.pending, &group.vars)?;
            if let Some(max_norm) = group.max_grad_norm {
                clip_to_norm(&mut self.pending, &group.vars, norm, max_norm)?;
            }
            grad_norms.push((group.name, norm));
        }

        for var in self.groups.iter().flat_map(|g| g.vars.iter()) {
            match self.pending.get(&var.as_tensor().id()) {
                Some(grad) => {
                    carrier.insert(var.as_tensor(), grad.clone());
                }
                None => {
                    carrier.remove(var.as_tensor());
                }
            }
        }
        self.optimizer.step(carrier)?;

        debug!(micro_batches = self.micro_batches, ?grad_norms, "Optimizer step");
        self.pending.clear();
        self.micro_batches = 0;
        Ok(StepReport { grad_norms })
    }
}

/// L2 norm over every gradient of `vars` present in `grads`.
fn grad_norm(grads: &HashMap<TensorId, Tensor>, vars: &[Var]) -> TrainResult<f64> {
    let mut total_sq = 0.0f64;
    for var in vars {
        if let Some(grad) = grads.get(&var.as_tensor().id()) {
            let sq = grad.to_dtype(DType::F32)?.sqr()?.sum_all()?.to_scalar::<f32>()?;
            total_sq += sq as f64;
        }
    }
    Ok(total_sq.sqrt())
}

/// Scale the group's gradients by `max_norm / (norm + 1e-6)` when that is
/// below one.
fn clip_to_norm(
    grads: &mut HashMap<TensorId, Tensor>,
    vars: &[Var],
    norm: f64,
    max_norm: f64,
) -> TrainResult<()> {
    let coef = max_norm / (norm + 1e-6);
    if coef >= 1.0 {
        return Ok(());
    }
    for var in vars {
        let id = var.as_tensor().id();
        if let Some(grad) = grads.remove(&id) {
            grads.insert(id, (grad * coef)?);
        }
    }
    Ok(())
}
