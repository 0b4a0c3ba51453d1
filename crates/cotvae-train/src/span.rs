//! Reasoning-trace span location and per-layer anchor sampling.
//!
//! A trace mask marks every position that is *not* part of the reasoning
//! trace with `true`. The span is the first contiguous run of `false`
//! entries; it is subsampled into one anchor per transformer layer.

use tracing::debug;

use crate::error::{TrainError, TrainResult};

/// Label value marking a position that carries no training target.
pub const IGNORE_INDEX: i64 = -100;

/// Half-open `[first, last)` interval of trace positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceSpan {
    pub first: usize,
    pub last: usize,
}

impl TraceSpan {
    pub fn len(&self) -> usize {
        self.last - self.first
    }

    pub fn is_empty(&self) -> bool {
        self.last == self.first
    }
}

/// Derive the trace mask from next-token labels: ignored labels are not trace.
pub fn trace_mask(labels_shift: &[i64]) -> Vec<bool> {
    labels_shift.iter().map(|&l| l < 0).collect()
}

/// Find the reasoning-trace span in `mask`.
///
/// `last` is the first `true` after `first`, or the mask length when the
/// trace runs to the end of the sequence. `example` only labels the error.
pub fn locate_trace_span(mask: &[bool], example: usize) -> TrainResult<TraceSpan> {
    let first = mask
        .iter()
        .position(|&not_trace| !not_trace)
        .ok_or(TrainError::MalformedBatch { example })?;
    let last = mask[first..]
        .iter()
        .position(|&not_trace| not_trace)
        .map_or(mask.len(), |offset| first + offset);
    Ok(TraceSpan { first, last })
}

/// One anchor per layer, evenly spread over `span`:
/// `round(first + i * (last - 1 - first) / num_layers)`.
///
/// Rounds half to even. A span of length one yields `num_layers` copies of
/// `first`.
pub fn anchor_positions(span: TraceSpan, num_layers: usize) -> Vec<usize> {
    let first = span.first as f64;
    let extent = span.last.saturating_sub(1).saturating_sub(span.first) as f64;
    (0..num_layers)
        .map(|i| (first + i as f64 * extent / num_layers as f64).round_ties_even() as usize)
        .collect()
}

/// Spans and anchors for every example of a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchPlan {
    /// Per example: the position where the student is conditioned on latents.
    pub first_offsets: Vec<usize>,
    /// Per example, per layer: the anchor position in the trace.
    pub anchors: Vec<Vec<usize>>,
}

impl BatchPlan {
    pub fn batch_size(&self) -> usize {
        self.first_offsets.len()
    }

    /// Anchor of every example for `layer`.
    pub fn layer_anchors(&self, layer: usize) -> Vec<usize> {
        self.anchors.iter().map(|a| a[layer]).collect()
    }
}

/// Locate spans and sample anchors for each row of `labels_cot_shift`.
///
/// Any example without a trace aborts the whole batch.
pub fn plan_batch(labels_cot_shift: &[Vec<i64>], num_layers: usize) -> TrainResult<BatchPlan> {
    let mut first_offsets = Vec::with_capacity(labels_cot_shift.len());
    let mut anchors = Vec::with_capacity(labels_cot_shift.len());
    for (example, labels) in labels_cot_shift.iter().enumerate() {
        let span = locate_trace_span(&trace_mask(labels), example)?;
        debug!(example, first = span.first, last = span.last, "trace span");
        first_offsets.push(span.first);
        anchors.push(anchor_positions(span, num_layers));
    }
    Ok(BatchPlan { first_offsets, anchors })
}

#[cfg(test)]
mod tests {
    use super::*;

    const T: bool = true;
    const F: bool = false;

    #[test]
    fn span_of_interior_trace() {
        let span = locate_trace_span(&[T, T, F, F, F, T, T], 0).unwrap();
        assert_eq!(span, TraceSpan { first: 2, last: 5 });
        assert_eq!(span.len(), 3);
    }

    #[test]
    fn span_runs_to_end_without_closing_boundary() {
        let span = locate_trace_span(&[T, F, F, F], 0).unwrap();
        assert_eq!(span, TraceSpan { first: 1, last: 4 });
    }

    #[test]
    fn single_token_trace_at_sequence_end() {
        let span = locate_trace_span(&[T, T, T, F], 0).unwrap();
        assert_eq!(span, TraceSpan { first: 3, last: 4 });
    }

    #[test]
    fn only_first_run_is_used() {
        let span = locate_trace_span(&[F, T, F, F], 0).unwrap();
        assert_eq!(span, TraceSpan { first: 0, last: 1 });
    }

    #[test]
    fn all_true_mask_is_malformed() {
        let err = locate_trace_span(&[T, T, T], 4).unwrap_err();
        assert!(matches!(err, TrainError::MalformedBatch { example: 4 }));
    }

    #[test]
    fn span_bounds_hold_for_every_short_mask() {
        // Exhaustively check all masks up to length 8.
        for len in 1..=8usize {
            for bits in 0u32..(1 << len) {
                let mask: Vec<bool> = (0..len).map(|i| bits & (1 << i) != 0).collect();
                match locate_trace_span(&mask, 0) {
                    Ok(span) => {
                        assert!(span.first < span.last && span.last <= len, "{mask:?}");
                        assert!(!mask[span.first]);
                        if !mask[span.first..].contains(&true) {
                            assert_eq!(span.last, len);
                        }
                    }
                    Err(_) => assert!(mask.iter().all(|&m| m)),
                }
            }
        }
    }

    #[test]
    fn anchors_follow_rounded_interpolation() {
        // first = 2, last = 5: 2 + i * 2 / 3 for i in 0..3 -> 2, 2.67, 3.33
        let anchors = anchor_positions(TraceSpan { first: 2, last: 5 }, 3);
        assert_eq!(anchors, vec![2, 3, 3]);
    }

    #[test]
    fn anchors_round_half_to_even() {
        // 0 + i * 3 / 6 -> 0, 0.5, 1, 1.5, 2, 2.5
        let anchors = anchor_positions(TraceSpan { first: 0, last: 4 }, 6);
        assert_eq!(anchors, vec![0, 0, 1, 2, 2, 2]);
    }

    #[test]
    fn degenerate_span_collapses_to_first() {
        let anchors = anchor_positions(TraceSpan { first: 7, last: 8 }, 4);
        assert_eq!(anchors, vec![7; 4]);
        let empty = anchor_positions(TraceSpan { first: 7, last: 7 }, 2);
        assert_eq!(empty, vec![7; 2]);
    }

    #[test]
    fn anchors_are_sorted_in_span_and_one_per_layer() {
        for first in 0..6usize {
            for last in (first + 1)..20 {
                for layers in 1..14usize {
                    let span = TraceSpan { first, last };
                    let anchors = anchor_positions(span, layers);
                    assert_eq!(anchors.len(), layers);
                    assert!(anchors.windows(2).all(|w| w[0] <= w[1]));
                    assert!(anchors.iter().all(|&a| a >= first && a < last));
                    assert_eq!(anchors[0], first);
                }
            }
        }
    }

    #[test]
    fn trace_mask_marks_ignored_labels() {
        assert_eq!(trace_mask(&[IGNORE_INDEX, 5, 6, IGNORE_INDEX]), vec![T, F, F, T]);
    }

    #[test]
    fn plan_batch_collects_offsets_and_anchors() {
        let i = IGNORE_INDEX;
        let labels = vec![vec![i, i, 4, 5, 6, i, i], vec![i, 9, 9, 9, 9, 9, 9]];
        let plan = plan_batch(&labels, 3).unwrap();
        assert_eq!(plan.first_offsets, vec![2, 1]);
        assert_eq!(plan.anchors, vec![vec![2, 3, 3], vec![1, 3, 4]]);
        assert_eq!(plan.layer_anchors(2), vec![3, 4]);
        assert_eq!(plan.batch_size(), 2);
    }

    #[test]
    fn plan_batch_aborts_on_malformed_example() {
        let i = IGNORE_INDEX;
        let labels = vec![vec![i, 3, i], vec![i, i, i]];
        let err = plan_batch(&labels, 2).unwrap_err();
        assert!(matches!(err, TrainError::MalformedBatch { example: 1 }));
    }
}
