//! The encoder → latents → student pass shared by training and evaluation.

use candle_core::{Device, Tensor};
use rand::Rng;

use cotvae_core::{CoreError, LatentModel};

use crate::dataset::CotBatch;
use crate::error::TrainResult;
use crate::latent::{extract_latents, LatentSample, Sigmas};
use crate::span::{plan_batch, BatchPlan};

#[derive(Debug, Clone)]
pub struct ConditionedPass {
    pub plan: BatchPlan,
    pub sample: LatentSample,
    /// Student logits over the no-trace sequence, `[batch, seq, vocab]`.
    pub logits: Tensor,
    /// The student's own per-layer estimate of the injected latents.
    pub predicted_latents: Vec<Tensor>,
}

/// Run the encoder over the full trace, draw noisy latents at the planned
/// anchors and score the no-trace sequence with the student conditioned on
/// them.
pub fn conditioned_forward<E, S, R>(
    encoder: &E,
    student: &S,
    sigmas: &Sigmas,
    batch: &CotBatch,
    device: &Device,
    rng: &mut R,
) -> TrainResult<ConditionedPass>
where
    E: LatentModel,
    S: LatentModel,
    R: Rng,
{
    if encoder.num_layers() != student.num_layers() {
        return Err(CoreError::LatentLayers {
            expected: student.num_layers(),
            got: encoder.num_layers(),
        }
        .into());
    }

    let plan = plan_batch(&batch.labels_cot_shift, encoder.num_layers())?;

    let cot = batch.input_ids_cot_tensor(device)?;
    let hidden = encoder.forward_hidden(&cot)?;
    let sample = extract_latents(&hidden.layer_states, &plan, sigmas, rng)?;

    let nocot = batch.input_ids_nocot_tensor(device)?;
    let out = student.forward_with_latents(&nocot, &sample.noisy, &plan.first_offsets)?;

    Ok(ConditionedPass {
        plan,
        sample,
        logits: out.logits,
        predicted_latents: out.predicted_latents,
    })
}
