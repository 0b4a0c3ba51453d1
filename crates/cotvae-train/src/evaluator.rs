//! Evaluation: latent-conditioned perplexity plus beam-searched exact match.
//!
//! Noise is still drawn for the latents so the student sees the same input
//! distribution it was trained on. Per-example decode failures are logged
//! and counted as misses; they never abort the run.
//!
//! "No gradient" means detached outputs: the forwards still run through the
//! trainable `Var`s, but nothing here calls `backward` or touches the
//! optimizer, and every tensor kept past a forward is detached.

use std::ops::Range;

use candle_core::Tensor;
use rand::Rng;
use serde::Serialize;
use tracing::{debug, info, warn};

use cotvae_core::{BeamParams, LatentModel, Tokenizer};

use crate::conditioned::{conditioned_forward, ConditionedPass};
use crate::dataset::CotBatch;
use crate::error::{TrainError, TrainResult};
use crate::latent::Sigmas;
use crate::objective::{masked_nll, perplexity, token_accuracy, TokenAccuracy};
use crate::progress::{hidden_bar, progress_bar};

/// Strip surrounding whitespace and thousands separators.
pub fn normalize_answer(text: &str) -> String {
    text.trim().replace(',', "")
}

/// Problem separator position and answer token range of a no-trace sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnswerSplit {
    pub separator: usize,
    pub answer: Range<usize>,
}

/// Find the separator ending the problem and the one ending the answer.
pub fn split_answer(ids: &[u32], eos_token_id: u32, example: usize) -> TrainResult<AnswerSplit> {
    let separator = ids
        .iter()
        .position(|&t| t == eos_token_id)
        .ok_or(TrainError::DecodeBoundary { example, segment: "problem" })?;
    let start = separator + 1;
    let end = ids[start..]
        .iter()
        .position(|&t| t == eos_token_id)
        .map(|p| start + p)
        .ok_or(TrainError::DecodeBoundary { example, segment: "answer" })?;
    Ok(AnswerSplit { separator, answer: start..end })
}

/// Running exact-match counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExactMatchTally {
    pub examples: usize,
    pub correct: usize,
}

impl ExactMatchTally {
    pub fn record(&mut self, correct: bool) {
        self.examples += 1;
        if correct {
            self.correct += 1;
        }
    }

    pub fn accuracy(&self) -> f64 {
        if self.examples == 0 {
            0.0
        } else {
            self.correct as f64 / self.examples as f64
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EvalReport {
    pub examples: usize,
    pub correct: usize,
    /// Exact-match accuracy over examples.
    pub accuracy: f64,
    pub token_accuracy: f64,
    /// Token-weighted mean NLL of the student.
    pub loss: f64,
    pub perplexity: f64,
    /// Examples whose separators could not be found or whose decode failed.
    pub decode_errors: usize,
}

/// Borrowed view of a trained system, evaluated batch by batch.
pub struct Evaluator<'a, E: LatentModel, S: LatentModel> {
    encoder: &'a E,
    student: &'a S,
    sigmas: &'a Sigmas,
    tokenizer: &'a Tokenizer,
    beam: BeamParams,
    show_progress: bool,
}

impl<'a, E: LatentModel, S: LatentModel> Evaluator<'a, E, S> {
    pub fn new(
        encoder: &'a E,
        student: &'a S,
        sigmas: &'a Sigmas,
        tokenizer: &'a Tokenizer,
        beam: BeamParams,
    ) -> Self {
        Self { encoder, student, sigmas, tokenizer, beam, show_progress: true }
    }

    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    pub fn run<R: Rng>(&self, batches: &[CotBatch], rng: &mut R) -> TrainResult<EvalReport> {
        let total_examples: usize = batches.iter().map(CotBatch::len).sum();
        let pb = if self.show_progress {
            progress_bar(total_examples as u64, "Evaluating")
        } else {
            hidden_bar()
        };

        let device = self.sigmas.var().as_tensor().device().clone();
        let mut tally = ExactMatchTally::default();
        let mut tokens = TokenAccuracy::default();
        let mut weighted_loss = 0.0f64;
        let mut decode_errors = 0usize;

        for batch in batches {
            let pass = conditioned_forward(self.encoder, self.student, self.sigmas, batch, &device, rng)?;
            let logits = pass.logits.detach();

            let nll = masked_nll(&logits, &batch.labels_nocot)?;
            weighted_loss += nll.loss.to_scalar::<f32>()? as f64 * nll.valid_tokens as f64;
            tokens.merge(token_accuracy(&logits, &batch.labels_nocot)?);

            for (i, ids) in batch.input_ids_nocot.iter().enumerate() {
                let correct = match self.score_example(&pass, ids, i) {
                    Ok((correct, predicted)) => {
                        if tally.examples == 0 {
                            info!(prediction = %predicted, "First evaluation output");
                        }
                        correct
                    }
                    Err(e) => {
                        warn!(example = tally.examples, error = %e, "Example could not be scored");
                        decode_errors += 1;
                        false
                    }
                };
                tally.record(correct);
                pb.set_message(format!("acc {:.3}", tally.accuracy()));
                pb.inc(1);
            }
        }
        pb.finish_and_clear();

        let loss = if tokens.total == 0 { 0.0 } else { weighted_loss / tokens.total as f64 };
        let report = EvalReport {
            examples: tally.examples,
            correct: tally.correct,
            accuracy: tally.accuracy(),
            token_accuracy: tokens.value(),
            loss,
            perplexity: perplexity(loss),
            decode_errors,
        };
        debug!(?report, "Evaluation finished");
        Ok(report)
    }

    /// Beam-search example `i` of the batch and compare its normalised
    /// answer with the ground truth. Returns the match and the decoded text.
    fn score_example(&self, pass: &ConditionedPass, ids: &[u32], i: usize) -> TrainResult<(bool, String)> {
        let eos = self.tokenizer.eos_token_id();
        let split = split_answer(ids, eos, i)?;
        let truth = self.tokenizer.decode(&ids[split.answer.clone()], true)?;

        let latents = pass
            .sample
            .noisy
            .iter()
            .map(|z| z.narrow(0, i, 1).map(|t| t.detach()))
            .collect::<candle_core::Result<Vec<Tensor>>>()?;
        let prompt = &ids[..=split.separator];
        let output = self.student.generate_with_latents(
            prompt,
            &latents,
            pass.plan.first_offsets[i],
            &self.beam,
        )?;

        let generated = &output[prompt.len().min(output.len())..];
        let answer_len = generated.iter().position(|&t| t == eos).unwrap_or(generated.len());
        let predicted = self.tokenizer.decode(&generated[..answer_len], true)?;

        Ok((normalize_answer(&truth) == normalize_answer(&predicted), predicted))
    }
}
