//! Training objective over the student's no-trace logits.
//!
//! Logits at position `j` are scored against the label at `j + 1`; labels
//! equal to [`IGNORE_INDEX`] (the problem prefix and padding) take no part.

use candle_core::{DType, Tensor, D};
use candle_nn::loss;
use tracing::warn;

use cotvae_core::CoreError;

use crate::error::TrainResult;
use crate::latent::Sigmas;

/// Correct / total counts of argmax predictions over valid positions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenAccuracy {
    pub correct: usize,
    pub total: usize,
}

impl TokenAccuracy {
    pub fn value(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.correct as f64 / self.total as f64
        }
    }

    pub fn merge(&mut self, other: TokenAccuracy) {
        self.correct += other.correct;
        self.total += other.total;
    }
}

/// Mean cross-entropy over valid positions, still attached to the graph.
#[derive(Debug, Clone)]
pub struct MaskedNll {
    /// Scalar F32 loss.
    pub loss: Tensor,
    pub valid_tokens: usize,
}

/// Flattened row indices and targets of every non-ignored shifted label.
struct ShiftedTargets {
    rows: Vec<u32>,
    targets: Vec<u32>,
}

fn shifted_targets(labels: &[Vec<i64>], seq_len: usize) -> ShiftedTargets {
    let width = seq_len.saturating_sub(1);
    let mut rows = Vec::new();
    let mut targets = Vec::new();
    for (b, row) in labels.iter().enumerate() {
        for j in 0..width {
            let target = row[j + 1];
            if target >= 0 {
                rows.push((b * width + j) as u32);
                targets.push(target as u32);
            }
        }
    }
    ShiftedTargets { rows, targets }
}

fn check_labels(logits: &Tensor, labels: &[Vec<i64>]) -> TrainResult<(usize, usize, usize)> {
    let (batch, seq_len, vocab) = logits.dims3()?;
    if labels.len() != batch {
        return Err(CoreError::BatchMismatch { expected: batch, got: labels.len() }.into());
    }
    if let Some(row) = labels.iter().find(|r| r.len() != seq_len) {
        return Err(CoreError::BatchMismatch { expected: seq_len, got: row.len() }.into());
    }
    Ok((batch, seq_len, vocab))
}

/// Argmax accuracy of `logits[:, :-1]` against `labels[:, 1:]`.
pub fn token_accuracy(logits: &Tensor, labels: &[Vec<i64>]) -> TrainResult<TokenAccuracy> {
    let (_, seq_len, _) = check_labels(logits, labels)?;
    if seq_len < 2 {
        return Ok(TokenAccuracy::default());
    }
    let predicted = logits
        .narrow(1, 0, seq_len - 1)?
        .argmax(D::Minus1)?
        .to_vec2::<u32>()?;

    let mut acc = TokenAccuracy::default();
    for (row_pred, row_labels) in predicted.iter().zip(labels) {
        for (j, &pred) in row_pred.iter().enumerate() {
            let target = row_labels[j + 1];
            if target >= 0 {
                acc.total += 1;
                if pred as i64 == target {
                    acc.correct += 1;
                }
            }
        }
    }
    Ok(acc)
}

/// Next-token cross-entropy averaged over non-ignored positions.
///
/// Only the valid rows are gathered before calling
/// [`candle_nn::loss::cross_entropy`], so padding never reaches the softmax.
/// A batch with no valid position yields a constant zero loss.
pub fn masked_nll(logits: &Tensor, labels: &[Vec<i64>]) -> TrainResult<MaskedNll> {
    let (batch, seq_len, vocab) = check_labels(logits, labels)?;
    let shifted = shifted_targets(labels, seq_len);
    let valid_tokens = shifted.targets.len();
    let device = logits.device();

    if valid_tokens == 0 {
        return Ok(MaskedNll { loss: Tensor::zeros((), DType::F32, device)?, valid_tokens });
    }

    let flat = logits
        .narrow(1, 0, seq_len - 1)?
        .contiguous()?
        .reshape((batch * (seq_len - 1), vocab))?;
    let rows = Tensor::from_vec(shifted.rows, valid_tokens, device)?;
    let targets = Tensor::from_vec(shifted.targets, valid_tokens, device)?;

    // Always F32: log-softmax over the vocabulary overflows in half precision.
    let picked = flat.index_select(&rows, 0)?.to_dtype(DType::F32)?;
    let loss = loss::cross_entropy(&picked, &targets)?;
    Ok(MaskedNll { loss, valid_tokens })
}

/// `Σ_l Σ (clean_l - predicted_l)² / (2 σ_l² · valid_tokens)`.
///
/// `valid_tokens` is the student's valid-label count for the whole batch and
/// is shared by every layer. Gradients reach both latent sets and sigma.
pub fn kl_penalty(
    clean: &[Tensor],
    predicted: &[Tensor],
    sigmas: &Sigmas,
    valid_tokens: usize,
) -> TrainResult<Tensor> {
    if clean.len() != sigmas.len() {
        return Err(CoreError::LatentLayers { expected: sigmas.len(), got: clean.len() }.into());
    }
    if predicted.len() != sigmas.len() {
        return Err(CoreError::LatentLayers { expected: sigmas.len(), got: predicted.len() }.into());
    }

    let device = sigmas.var().as_tensor().device();
    let mut total = Tensor::zeros((), DType::F32, device)?;
    for (layer, (z, zp)) in clean.iter().zip(predicted).enumerate() {
        let sq = (z - zp)?.sqr()?.sum_all()?.to_dtype(DType::F32)?;
        let denom = (sigmas.layer(layer)?.sqr()? * 2.0)?.squeeze(0)?.to_dtype(DType::F32)?;
        total = (total + sq.div(&denom)?)?;
    }
    Ok((total / valid_tokens.max(1) as f64)?)
}

/// `exp(loss)`, or `+inf` with a warning when that is not finite.
pub fn perplexity(loss: f64) -> f64 {
    let ppl = loss.exp();
    if ppl.is_finite() {
        ppl
    } else {
        warn!(loss, "Non-finite loss, reporting infinite perplexity");
        f64::INFINITY
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::span::IGNORE_INDEX;
    use candle_core::{Device, Var};
    use cotvae_core::RunContext;

    const I: i64 = IGNORE_INDEX;

    /// `[1, 3, 4]` logits whose argmax is 2 at position 0 and 0 at 1 and 2.
    fn logits() -> Tensor {
        let data = vec![
            0.0f32, 0.0, 5.0, 0.0, //
            5.0, 0.0, 0.0, 0.0, //
            5.0, 0.0, 0.0, 0.0,
        ];
        Tensor::from_vec(data, (1, 3, 4), &Device::Cpu).unwrap()
    }

    #[test]
    fn accuracy_counts_shifted_valid_positions() {
        // pos0 -> 2 (correct), pos1 -> 3 (wrong).
        let acc = token_accuracy(&logits(), &[vec![I, 2, 3]]).unwrap();
        assert_eq!(acc, TokenAccuracy { correct: 1, total: 2 });
        assert!((acc.value() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn accuracy_ignores_masked_labels() {
        let acc = token_accuracy(&logits(), &[vec![I, I, 0]]).unwrap();
        assert_eq!(acc, TokenAccuracy { correct: 1, total: 1 });
    }

    #[test]
    fn empty_accuracy_is_zero() {
        assert_eq!(TokenAccuracy::default().value(), 0.0);
    }

    #[test]
    fn nll_of_uniform_logits_is_log_vocab() {
        let uniform = Tensor::zeros((2, 3, 4), DType::F32, &Device::Cpu).unwrap();
        let nll = masked_nll(&uniform, &[vec![I, 1, 2], vec![I, I, 3]]).unwrap();
        assert_eq!(nll.valid_tokens, 3);
        let value = nll.loss.to_scalar::<f32>().unwrap();
        assert!((value - 4f32.ln()).abs() < 1e-5, "got {value}");
    }

    #[test]
    fn nll_without_valid_labels_is_zero() {
        let nll = masked_nll(&logits(), &[vec![I, I, I]]).unwrap();
        assert_eq!(nll.valid_tokens, 0);
        assert_eq!(nll.loss.to_scalar::<f32>().unwrap(), 0.0);
    }

    #[test]
    fn nll_rejects_misaligned_labels() {
        assert!(masked_nll(&logits(), &[vec![I, 1]]).is_err());
        assert!(masked_nll(&logits(), &[vec![I, 1, 2], vec![I, 1, 2]]).is_err());
    }

    #[test]
    fn nll_backpropagates_to_logits() {
        let var = Var::from_tensor(&logits()).unwrap();
        let nll = masked_nll(var.as_tensor(), &[vec![I, 2, 3]]).unwrap();
        let grads = nll.loss.backward().unwrap();
        assert!(grads.get(var.as_tensor()).is_some());
    }

    fn latents(values: &[f32]) -> Tensor {
        Tensor::from_vec(values.to_vec(), (1, values.len()), &Device::Cpu).unwrap()
    }

    #[test]
    fn kl_is_zero_for_identical_latents() {
        let ctx = RunContext::cpu();
        let sigmas = Sigmas::new(2, &ctx).unwrap();
        let z = vec![latents(&[1.0, -2.0]), latents(&[0.5, 3.0])];
        let kl = kl_penalty(&z, &z, &sigmas, 4).unwrap().to_scalar::<f32>().unwrap();
        assert_eq!(kl, 0.0);
    }

    #[test]
    fn kl_matches_closed_form() {
        let ctx = RunContext::cpu();
        let sigmas = Sigmas::from_values(&[1.0, 2.0], &ctx).unwrap();
        let clean = vec![latents(&[1.0, 2.0]), latents(&[1.0, 2.0])];
        let predicted = vec![latents(&[0.0, 0.0]), latents(&[0.0, 0.0])];
        // 5 / (2 * 1 * 5) + 5 / (2 * 4 * 5)
        let kl = kl_penalty(&clean, &predicted, &sigmas, 5).unwrap().to_scalar::<f32>().unwrap();
        assert!((kl - 0.625).abs() < 1e-6, "got {kl}");
    }

    #[test]
    fn kl_is_non_negative() {
        let ctx = RunContext::cpu();
        let sigmas = Sigmas::from_values(&[0.3, 1.7, 4.0], &ctx).unwrap();
        let clean: Vec<Tensor> = (0..3).map(|l| latents(&[l as f32, -1.5, 0.25])).collect();
        let predicted: Vec<Tensor> = (0..3).map(|l| latents(&[-(l as f32), 2.0, 0.0])).collect();
        let kl = kl_penalty(&clean, &predicted, &sigmas, 7).unwrap().to_scalar::<f32>().unwrap();
        assert!(kl >= 0.0);
    }

    #[test]
    fn kl_gradient_reaches_sigma() {
        let ctx = RunContext::cpu();
        let sigmas = Sigmas::new(1, &ctx).unwrap();
        let kl = kl_penalty(&[latents(&[1.0])], &[latents(&[0.0])], &sigmas, 1).unwrap();
        let grads = kl.backward().unwrap();
        // d/dσ (1 / 2σ²) = -1/σ³ = -1 at σ = 1.
        let g = grads.get(sigmas.var().as_tensor()).unwrap().to_vec1::<f32>().unwrap();
        assert!((g[0] + 1.0).abs() < 1e-5, "got {g:?}");
    }

    #[test]
    fn kl_rejects_layer_mismatch() {
        let ctx = RunContext::cpu();
        let sigmas = Sigmas::new(2, &ctx).unwrap();
        let z = vec![latents(&[1.0])];
        assert!(kl_penalty(&z, &z, &sigmas, 1).is_err());
    }

    #[test]
    fn perplexity_falls_back_to_infinity() {
        assert!((perplexity(0.0) - 1.0).abs() < 1e-12);
        assert!((perplexity(2f64.ln()) - 2.0).abs() < 1e-9);
        assert_eq!(perplexity(1e6), f64::INFINITY);
        assert_eq!(perplexity(f64::NAN), f64::INFINITY);
    }
}
