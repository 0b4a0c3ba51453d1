use candle_core::{DType, IndexOp, Tensor, Var};
use serde::{Deserialize, Serialize};

use crate::beam::beam_search;
use crate::error::{CoreError, CoreResult};

/// Parameters controlling latent-conditioned beam search.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BeamParams {
    /// Number of hypotheses kept alive per step.
    pub beam_size: usize,
    /// Hard cap on generated tokens (prompt excluded).
    pub max_new_tokens: usize,
    /// Exponent applied to the hypothesis length when ranking finished beams.
    pub length_penalty: f64,
    /// Stop as soon as `beam_size` hypotheses have finished.
    pub early_stopping: bool,
    /// Token id that finishes a hypothesis.
    pub eos_token_id: u32,
}

impl BeamParams {
    pub fn new(eos_token_id: u32) -> Self {
        Self {
            beam_size: 5,
            max_new_tokens: 100,
            length_penalty: 1.0,
            early_stopping: true,
            eos_token_id,
        }
    }
}

/// Ordinary scoring output with every layer's input hidden state exposed.
#[derive(Debug, Clone)]
pub struct HiddenOutput {
    /// `[batch, seq, vocab]`
    pub logits: Tensor,
    /// One `[batch, seq, hidden]` tensor per transformer layer: the input to
    /// that layer (the embeddings for layer 0). Length equals `num_layers()`.
    pub layer_states: Vec<Tensor>,
}

/// Output of a latent-conditioned forward pass.
#[derive(Debug, Clone)]
pub struct LatentOutput {
    /// `[batch, seq, vocab]`
    pub logits: Tensor,
    /// One `[batch, hidden]` tensor per layer: the model's own state at the
    /// first-output offset, read before the injected latent replaces it.
    pub predicted_latents: Vec<Tensor>,
}

/// Capability interface a model must provide to take part in variational
/// trace compression, either as the encoder run on the full trace or as the
/// student conditioned on latents.
///
/// Latents are injected per layer at each example's first-output offset.
/// Positions before that offset are ordinary conditioning context and must
/// not depend on the latents.
pub trait LatentModel {
    fn num_layers(&self) -> usize;

    fn hidden_size(&self) -> usize;

    fn vocab_size(&self) -> usize;

    /// Every parameter the optimiser should update.
    fn trainable_vars(&self) -> Vec<Var>;

    /// Plain next-token scoring over `input_ids` (`[batch, seq]`, u32).
    fn forward_hidden(&self, input_ids: &Tensor) -> CoreResult<HiddenOutput>;

    /// Score `input_ids` while injecting `latents[l]` (`[batch, hidden]`) at
    /// `first_offsets[b]` of layer `l`.
    fn forward_with_latents(
        &self,
        input_ids: &Tensor,
        latents: &[Tensor],
        first_offsets: &[usize],
    ) -> CoreResult<LatentOutput>;

    /// Beam-search continuation of a single prompt under `latents`
    /// (each `[1, hidden]`). Returns the best sequence, prompt included.
    ///
    /// Weights stay `Var`-backed here, so each scoring step still builds an
    /// op graph; it is dropped with the step's logits. Peak memory therefore
    /// grows with `beam_size * seq_len`, as during training.
    fn generate_with_latents(
        &self,
        prompt: &[u32],
        latents: &[Tensor],
        first_offset: usize,
        params: &BeamParams,
    ) -> CoreResult<Vec<u32>> {
        if latents.len() != self.num_layers() {
            return Err(CoreError::LatentLayers {
                expected: self.num_layers(),
                got: latents.len(),
            });
        }
        if first_offset >= prompt.len() {
            return Err(CoreError::OffsetOutOfRange { offset: first_offset, seq_len: prompt.len() });
        }
        let device = latents[0].device().clone();

        beam_search(prompt, params, |beams| {
            let n = beams.len();
            let seq_len = beams[0].len();
            let flat: Vec<u32> = beams.iter().flat_map(|b| b.iter().copied()).collect();
            let input_ids = Tensor::from_vec(flat, (n, seq_len), &device)?;

            // Replicate the single example's latents across the live beams.
            let expanded = latents
                .iter()
                .map(|z| z.broadcast_as((n, z.dim(1)?))?.contiguous())
                .collect::<candle_core::Result<Vec<_>>>()?;
            let offsets = vec![first_offset; n];

            let out = self.forward_with_latents(&input_ids, &expanded, &offsets)?;
            Ok(out.logits.i((.., seq_len - 1, ..))?.to_dtype(DType::F32)?)
        })
    }
}

/// Gather the hidden vector at `positions[b]` for every example `b` of a
/// `[batch, seq, hidden]` tensor, giving `[batch, hidden]`.
///
/// An exact index gather: gradients flow back to the selected rows only.
pub fn select_positions(states: &Tensor, positions: &[usize]) -> CoreResult<Tensor> {
    let (batch, seq_len, hidden) = states.dims3()?;
    if positions.len() != batch {
        return Err(CoreError::BatchMismatch { expected: batch, got: positions.len() });
    }
    if let Some(&offset) = positions.iter().find(|&&p| p >= seq_len) {
        return Err(CoreError::OffsetOutOfRange { offset, seq_len });
    }
    let idx: Vec<u32> = positions.iter().map(|&p| p as u32).collect();
    let idx = Tensor::from_vec(idx, (batch, 1, 1), states.device())?
        .broadcast_as((batch, 1, hidden))?
        .contiguous()?;
    Ok(states.gather(&idx, 1)?.squeeze(1)?)
}
