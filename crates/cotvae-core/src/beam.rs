//! Beam search over an arbitrary next-token scorer.
//!
//! The scorer receives every live hypothesis (all the same length) and
//! returns `[n_beams, vocab]` logits for the next position. Hypotheses are
//! ranked by summed log-probability; finished ones are normalised by
//! `generated_len ^ length_penalty`.

use candle_core::{Tensor, D};

use crate::error::CoreResult;
use crate::model::BeamParams;

#[derive(Debug, Clone)]
struct Hypothesis {
    tokens: Vec<u32>,
    log_prob: f64,
}

/// Bounded pool of finished hypotheses, best first.
struct FinishedBeams {
    capacity: usize,
    length_penalty: f64,
    early_stopping: bool,
    beams: Vec<(f64, Vec<u32>)>,
}

impl FinishedBeams {
    fn new(params: &BeamParams) -> Self {
        Self {
            capacity: params.beam_size.max(1),
            length_penalty: params.length_penalty,
            early_stopping: params.early_stopping,
            beams: Vec::new(),
        }
    }

    fn normalise(&self, log_prob: f64, generated_len: usize) -> f64 {
        log_prob / (generated_len.max(1) as f64).powf(self.length_penalty)
    }

    fn add(&mut self, tokens: Vec<u32>, log_prob: f64, generated_len: usize) {
        let score = self.normalise(log_prob, generated_len);
        if self.beams.len() >= self.capacity && score <= self.worst_score() {
            return;
        }
        self.beams.push((score, tokens));
        self.beams.sort_by(|a, b| b.0.total_cmp(&a.0));
        self.beams.truncate(self.capacity);
    }

    fn worst_score(&self) -> f64 {
        self.beams.last().map(|(s, _)| *s).unwrap_or(f64::NEG_INFINITY)
    }

    /// Whether no live hypothesis can still enter the pool.
    fn is_done(&self, best_live_log_prob: f64, generated_len: usize) -> bool {
        if self.beams.len() < self.capacity {
            return false;
        }
        if self.early_stopping {
            return true;
        }
        self.worst_score() >= self.normalise(best_live_log_prob, generated_len)
    }

    fn into_best(self) -> Option<Vec<u32>> {
        self.beams.into_iter().next().map(|(_, tokens)| tokens)
    }
}

/// Run beam search from `prompt` and return the best sequence (prompt
/// included, finishing `eos` included when one was produced).
pub fn beam_search<F>(prompt: &[u32], params: &BeamParams, mut next_logits: F) -> CoreResult<Vec<u32>>
where
    F: FnMut(&[Vec<u32>]) -> CoreResult<Tensor>,
{
    let beam_size = params.beam_size.max(1);
    let mut finished = FinishedBeams::new(params);
    let mut alive = vec![Hypothesis { tokens: prompt.to_vec(), log_prob: 0.0 }];

    for step in 0..params.max_new_tokens {
        let generated_len = step + 1;
        let seqs: Vec<Vec<u32>> = alive.iter().map(|h| h.tokens.clone()).collect();
        let logits = next_logits(&seqs)?;
        let log_probs = candle_nn::ops::log_softmax(&logits, D::Minus1)?.to_vec2::<f32>()?;

        let mut candidates: Vec<(f64, usize, u32)> = Vec::with_capacity(alive.len() * 2 * beam_size);
        for (b, row) in log_probs.iter().enumerate() {
            for (token, lp) in top_k(row, 2 * beam_size) {
                candidates.push((alive[b].log_prob + lp as f64, b, token));
            }
        }
        candidates.sort_by(|a, b| b.0.total_cmp(&a.0));

        let mut next = Vec::with_capacity(beam_size);
        for (rank, (log_prob, b, token)) in candidates.into_iter().enumerate() {
            let mut tokens = alive[b].tokens.clone();
            tokens.push(token);
            if token == params.eos_token_id {
                // An eos outside the top `beam_size` would have displaced a live beam.
                if rank < beam_size {
                    finished.add(tokens, log_prob, generated_len);
                }
            } else {
                next.push(Hypothesis { tokens, log_prob });
            }
            if next.len() == beam_size {
                break;
            }
        }

        alive = next;
        let best_live = alive.first().map(|h| h.log_prob).unwrap_or(f64::NEG_INFINITY);
        if alive.is_empty() || finished.is_done(best_live, generated_len) {
            return Ok(finished.into_best().unwrap_or_else(|| prompt.to_vec()));
        }
    }

    // Out of budget: unfinished beams compete with the finished ones.
    for h in alive {
        let generated_len = h.tokens.len() - prompt.len();
        finished.add(h.tokens, h.log_prob, generated_len);
    }
    Ok(finished.into_best().unwrap_or_else(|| prompt.to_vec()))
}

/// The `k` highest-scoring `(token, log_prob)` pairs of `row`, best first.
fn top_k(row: &[f32], k: usize) -> Vec<(u32, f32)> {
    let mut indexed: Vec<(u32, f32)> = row.iter().enumerate().map(|(i, &v)| (i as u32, v)).collect();
    let k = k.min(indexed.len());
    if k < indexed.len() {
        indexed.select_nth_unstable_by(k, |a, b| b.1.total_cmp(&a.1));
        indexed.truncate(k);
    }
    indexed.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
    indexed
}
