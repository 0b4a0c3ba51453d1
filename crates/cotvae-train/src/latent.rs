//! Latent extraction with reparameterised Gaussian noise.
//!
//! For every layer `l` the encoder's hidden state at each example's anchor is
//! gathered (`clean`) and perturbed as `clean + sigma_l * eps`, with `eps`
//! drawn from the caller's RNG. Gradients reach `clean` and `sigma_l`; the
//! noise itself is a constant.

use candle_core::{DType, Tensor, Var};
use rand::Rng;
use rand_distr::StandardNormal;

use cotvae_core::{select_positions, CoreError, RunContext};

use crate::error::TrainResult;
use crate::span::BatchPlan;

/// Learned per-layer noise scale, optimised alongside the model weights.
#[derive(Debug, Clone)]
pub struct Sigmas {
    var: Var,
}

impl Sigmas {
    /// One sigma per layer, all starting at 1.0.
    pub fn new(num_layers: usize, ctx: &RunContext) -> TrainResult<Self> {
        Ok(Self { var: Var::ones(num_layers, ctx.dtype, &ctx.device)? })
    }

    pub fn from_values(values: &[f32], ctx: &RunContext) -> TrainResult<Self> {
        let t = Tensor::new(values, &ctx.device)?.to_dtype(ctx.dtype)?;
        Ok(Self { var: Var::from_tensor(&t)? })
    }

    pub fn len(&self) -> usize {
        self.var.as_tensor().elem_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The optimisable variable backing all sigmas.
    pub fn var(&self) -> &Var {
        &self.var
    }

    /// `[1]` view of layer `layer`'s sigma, still attached to the graph.
    pub fn layer(&self, layer: usize) -> TrainResult<Tensor> {
        Ok(self.var.as_tensor().narrow(0, layer, 1)?)
    }

    /// Current values, for logging.
    pub fn values(&self) -> TrainResult<Vec<f32>> {
        Ok(self.var.as_tensor().to_dtype(DType::F32)?.to_vec1::<f32>()?)
    }
}

/// Per-layer latents for one batch.
#[derive(Debug, Clone)]
pub struct LatentSample {
    /// `clean + sigma * eps`, one `[batch, hidden]` tensor per layer.
    pub noisy: Vec<Tensor>,
    /// The gathered hidden states before noise (`zs0`).
    pub clean: Vec<Tensor>,
}

/// Gather anchor states from `layer_states` and draw the noisy posterior
/// sample.
pub fn extract_latents<R: Rng>(
    layer_states: &[Tensor],
    plan: &BatchPlan,
    sigmas: &Sigmas,
    rng: &mut R,
) -> TrainResult<LatentSample> {
    if layer_states.len() != sigmas.len() {
        return Err(CoreError::LatentLayers { expected: sigmas.len(), got: layer_states.len() }.into());
    }

    let mut noisy = Vec::with_capacity(layer_states.len());
    let mut clean = Vec::with_capacity(layer_states.len());
    for (layer, states) in layer_states.iter().enumerate() {
        let z = select_positions(states, &plan.layer_anchors(layer))?;
        let (batch, hidden) = z.dims2()?;

        let eps: Vec<f32> = (0..batch * hidden).map(|_| rng.sample(StandardNormal)).collect();
        let eps = Tensor::from_vec(eps, (batch, hidden), z.device())?.to_dtype(z.dtype())?;

        noisy.push((&z + eps.broadcast_mul(&sigmas.layer(layer)?)?)?);
        clean.push(z);
    }
    Ok(LatentSample { noisy, clean })
}
