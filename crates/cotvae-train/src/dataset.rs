//! Chain-of-thought dataset loading and collation.
//!
//! Each non-blank line of a data file holds one example:
//!
//! ```text
//! 12 * 34||12 * 4 = 48 , 12 * 30 = 360 #### 408
//! ```
//!
//! i.e. `problem||trace #### answer`. Every example is encoded twice, with
//! the end-of-segment token `<e>` as the only delimiter:
//!
//! ```text
//! cot:   problem <e> trace <e> answer <e>
//! nocot: problem <e> answer <e>
//! ```
//!
//! `labels_cot_shift` carries a next-token target only where that target is a
//! trace token or the separator closing the trace, so the trace span of the
//! cot sequence starts at the problem separator, the same index in both
//! sequences.

use std::fs;
use std::io::{self, BufRead};
use std::path::Path;

use candle_core::{Device, Tensor};
use rand::seq::SliceRandom;
use rand::Rng;
use tracing::{info, warn};

use cotvae_core::Tokenizer;

use crate::error::{TrainError, TrainResult};
use crate::span::IGNORE_INDEX;

/// One raw example.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CotExample {
    pub problem: String,
    pub trace: String,
    pub answer: String,
}

impl CotExample {
    /// Parse a `problem||trace #### answer` line.
    pub fn parse(line: &str) -> Result<Self, String> {
        let (problem, target) = line
            .split_once("||")
            .ok_or_else(|| "expected 'problem||trace #### answer' (missing '||')".to_string())?;
        let (trace, answer) = target
            .rsplit_once("####")
            .ok_or_else(|| "expected 'problem||trace #### answer' (missing '####')".to_string())?;
        Ok(Self {
            problem: problem.trim().to_string(),
            trace: trace.trim().to_string(),
            answer: answer.trim().to_string(),
        })
    }
}

/// A tokenized example with all five aligned fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedExample {
    pub input_ids_cot: Vec<u32>,
    pub input_ids_nocot: Vec<u32>,
    pub labels_cot: Vec<i64>,
    pub labels_cot_shift: Vec<i64>,
    pub labels_nocot: Vec<i64>,
}

impl EncodedExample {
    pub fn encode(example: &CotExample, tokenizer: &Tokenizer) -> TrainResult<Self> {
        let eos = tokenizer.eos_token_id();
        let problem = tokenizer.encode(&example.problem, false)?;
        // Later segments carry a leading space so byte-level BPE sees word starts.
        let trace = tokenizer.encode(&format!(" {}", example.trace), false)?;
        let answer = tokenizer.encode(&format!(" {}", example.answer), false)?;

        let p = problem.len();
        let c = trace.len();

        let input_ids_cot: Vec<u32> = problem
            .iter()
            .copied()
            .chain([eos])
            .chain(trace.iter().copied())
            .chain([eos])
            .chain(answer.iter().copied())
            .chain([eos])
            .collect();
        let input_ids_nocot: Vec<u32> = problem
            .iter()
            .copied()
            .chain([eos])
            .chain(answer.iter().copied())
            .chain([eos])
            .collect();

        let labels_cot = mask_prefix(&input_ids_cot, p + 1);
        let labels_nocot = mask_prefix(&input_ids_nocot, p + 1);

        // Target j+1 is a trace token or the separator closing the trace.
        let trace_targets = (p + 1)..=(p + 1 + c);
        let labels_cot_shift = (0..input_ids_cot.len())
            .map(|j| {
                if trace_targets.contains(&(j + 1)) {
                    input_ids_cot[j + 1] as i64
                } else {
                    IGNORE_INDEX
                }
            })
            .collect();

        Ok(Self { input_ids_cot, input_ids_nocot, labels_cot, labels_cot_shift, labels_nocot })
    }
}

fn mask_prefix(ids: &[u32], prefix: usize) -> Vec<i64> {
    ids.iter()
        .enumerate()
        .map(|(i, &id)| if i < prefix { IGNORE_INDEX } else { id as i64 })
        .collect()
}

/// A padded batch. Ids are right-padded with the end-of-segment token,
/// labels with [`IGNORE_INDEX`].
#[derive(Debug, Clone)]
pub struct CotBatch {
    pub input_ids_cot: Vec<Vec<u32>>,
    pub input_ids_nocot: Vec<Vec<u32>>,
    pub labels_cot: Vec<Vec<i64>>,
    pub labels_cot_shift: Vec<Vec<i64>>,
    pub labels_nocot: Vec<Vec<i64>>,
}

impl CotBatch {
    pub fn len(&self) -> usize {
        self.input_ids_cot.len()
    }

    pub fn is_empty(&self) -> bool {
        self.input_ids_cot.is_empty()
    }

    pub fn input_ids_cot_tensor(&self, device: &Device) -> TrainResult<Tensor> {
        tensor_2d(&self.input_ids_cot, device)
    }

    pub fn input_ids_nocot_tensor(&self, device: &Device) -> TrainResult<Tensor> {
        tensor_2d(&self.input_ids_nocot, device)
    }

    pub fn labels_nocot_tensor(&self, device: &Device) -> TrainResult<Tensor> {
        tensor_2d(&self.labels_nocot, device)
    }
}

/// Pad `examples` into one batch.
pub fn collate(examples: &[&EncodedExample], pad_id: u32) -> CotBatch {
    CotBatch {
        input_ids_cot: pad(examples.iter().map(|e| &e.input_ids_cot), pad_id),
        input_ids_nocot: pad(examples.iter().map(|e| &e.input_ids_nocot), pad_id),
        labels_cot: pad(examples.iter().map(|e| &e.labels_cot), IGNORE_INDEX),
        labels_cot_shift: pad(examples.iter().map(|e| &e.labels_cot_shift), IGNORE_INDEX),
        labels_nocot: pad(examples.iter().map(|e| &e.labels_nocot), IGNORE_INDEX),
    }
}

fn pad<'a, T: Copy + 'a>(rows: impl Iterator<Item = &'a Vec<T>> + Clone, value: T) -> Vec<Vec<T>> {
    let max_len = rows.clone().map(Vec::len).max().unwrap_or(0);
    rows.map(|r| {
        let mut row = r.clone();
        row.resize(max_len, value);
        row
    })
    .collect()
}

fn tensor_2d<T: candle_core::WithDType>(rows: &[Vec<T>], device: &Device) -> TrainResult<Tensor> {
    let batch = rows.len();
    let seq = rows.first().map(|r| r.len()).unwrap_or(0);
    let flat: Vec<T> = rows.iter().flat_map(|r| r.iter().copied()).collect();
    Ok(Tensor::from_vec(flat, (batch, seq), device)?)
}

// ── CotDataset ────────────────────────────────────────────────────────────────

/// Tokenized examples plus the padding id used when batching them.
pub struct CotDataset {
    examples: Vec<EncodedExample>,
    pad_id: u32,
}

impl CotDataset {
    /// Load and tokenize every line of `path`, dropping examples whose cot
    /// sequence exceeds `max_seq_len` tokens.
    pub fn from_file(path: &Path, tokenizer: &Tokenizer, max_seq_len: usize) -> TrainResult<Self> {
        let file = fs::File::open(path)?;
        let mut raw = Vec::new();
        for (line_no, line) in io::BufReader::new(file).lines().enumerate() {
            let line = line?;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let example = CotExample::parse(trimmed).map_err(|reason| TrainError::Data {
                path: path.to_path_buf(),
                line: line_no + 1,
                reason,
            })?;
            raw.push(example);
        }
        if raw.is_empty() {
            return Err(TrainError::Data {
                path: path.to_path_buf(),
                line: 0,
                reason: "no examples found".to_string(),
            });
        }

        let dataset = Self::from_examples(&raw, tokenizer, max_seq_len)?;
        info!(path = %path.display(), examples = dataset.len(), "Dataset loaded");
        Ok(dataset)
    }

    pub fn from_examples(raw: &[CotExample], tokenizer: &Tokenizer, max_seq_len: usize) -> TrainResult<Self> {
        let mut examples = Vec::with_capacity(raw.len());
        let mut dropped = 0usize;
        for example in raw {
            let encoded = EncodedExample::encode(example, tokenizer)?;
            if encoded.input_ids_cot.len() > max_seq_len {
                dropped += 1;
                continue;
            }
            examples.push(encoded);
        }
        if dropped > 0 {
            warn!(dropped, max_seq_len, "Dropped examples longer than the maximum sequence length");
        }
        Ok(Self { examples, pad_id: tokenizer.eos_token_id() })
    }

    /// Total number of examples in the dataset.
    pub fn len(&self) -> usize {
        self.examples.len()
    }

    /// Returns `true` when the dataset is empty.
    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }

    pub fn as_slice(&self) -> &[EncodedExample] {
        &self.examples
    }

    /// Number of batches of `batch_size` (the last one may be short).
    pub fn num_batches(&self, batch_size: usize) -> usize {
        self.examples.len().div_ceil(batch_size.max(1))
    }

    /// Collate the dataset into batches, in a fresh random order drawn from
    /// `rng`.
    pub fn shuffled_batches<R: Rng>(&self, batch_size: usize, rng: &mut R) -> Vec<CotBatch> {
        let mut order: Vec<usize> = (0..self.examples.len()).collect();
        order.shuffle(rng);
        self.collate_in(&order, batch_size)
    }

    /// Collate the dataset into batches in file order.
    pub fn batches(&self, batch_size: usize) -> Vec<CotBatch> {
        let order: Vec<usize> = (0..self.examples.len()).collect();
        self.collate_in(&order, batch_size)
    }

    fn collate_in(&self, order: &[usize], batch_size: usize) -> Vec<CotBatch> {
        order
            .chunks(batch_size.max(1))
            .map(|chunk| {
                let refs: Vec<&EncodedExample> = chunk.iter().map(|&i| &self.examples[i]).collect();
                collate(&refs, self.pad_id)
            })
            .collect()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::span::{locate_trace_span, trace_mask, TraceSpan};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::io::Write;
    use tempfile::TempDir;

    const I: i64 = IGNORE_INDEX;

    fn tokenizer() -> Tokenizer {
        // ids: 1:0 2:1 +:2 =:3 3:4 ,:5 4:6 <unk>:7 <|endoftext|>:8
        Tokenizer::from_word_vocab(&["1", "2", "+", "=", "3", ",", "4"]).unwrap()
    }

    fn make_file(lines: &[&str]) -> (TempDir, std::path::PathBuf) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("train.txt");
        let mut f = fs::File::create(&path).unwrap();
        for line in lines {
            writeln!(f, "{line}").unwrap();
        }
        (dir, path)
    }

    #[test]
    fn parse_splits_three_segments() {
        let ex = CotExample::parse("1 + 2||1 + 2 = 3 #### 3").unwrap();
        assert_eq!(ex.problem, "1 + 2");
        assert_eq!(ex.trace, "1 + 2 = 3");
        assert_eq!(ex.answer, "3");
    }

    #[test]
    fn parse_rejects_missing_markers() {
        assert!(CotExample::parse("1 + 2 #### 3").is_err());
        assert!(CotExample::parse("1 + 2||3").is_err());
    }

    #[test]
    fn encode_builds_aligned_fields() {
        let tok = tokenizer();
        let ex = CotExample::parse("1 + 2||1 + 2 = 3 #### 3").unwrap();
        let enc = EncodedExample::encode(&ex, &tok).unwrap();

        assert_eq!(enc.input_ids_cot, vec![0, 2, 1, 8, 0, 2, 1, 3, 4, 8, 4, 8]);
        assert_eq!(enc.input_ids_nocot, vec![0, 2, 1, 8, 4, 8]);
        assert_eq!(enc.labels_cot, vec![I, I, I, I, 0, 2, 1, 3, 4, 8, 4, 8]);
        assert_eq!(enc.labels_nocot, vec![I, I, I, I, 4, 8]);
        assert_eq!(enc.labels_cot_shift, vec![I, I, I, 0, 2, 1, 3, 4, 8, I, I, I]);
    }

    #[test]
    fn trace_span_starts_at_problem_separator() {
        let tok = tokenizer();
        let ex = CotExample::parse("1 + 2||1 + 2 = 3 #### 3").unwrap();
        let enc = EncodedExample::encode(&ex, &tok).unwrap();
        let span = locate_trace_span(&trace_mask(&enc.labels_cot_shift), 0).unwrap();
        assert_eq!(span, TraceSpan { first: 3, last: 9 });
        assert_eq!(enc.input_ids_nocot[span.first], tok.eos_token_id());
    }

    #[test]
    fn collate_pads_ids_and_labels() {
        let tok = tokenizer();
        let long = EncodedExample::encode(&CotExample::parse("1 + 2||1 + 2 = 3 #### 3").unwrap(), &tok).unwrap();
        let short = EncodedExample::encode(&CotExample::parse("4||4 #### 4").unwrap(), &tok).unwrap();
        let batch = collate(&[&long, &short], tok.eos_token_id());

        assert_eq!(batch.len(), 2);
        assert_eq!(batch.input_ids_cot[1], vec![6, 8, 6, 8, 6, 8, 8, 8, 8, 8, 8, 8]);
        assert_eq!(batch.labels_cot_shift[1], vec![I, 6, 8, I, I, I, I, I, I, I, I, I]);
        assert_eq!(batch.input_ids_nocot[1], vec![6, 8, 6, 8, 8, 8]);
        assert_eq!(batch.labels_nocot[1], vec![I, I, 6, 8, I, I]);
    }

    #[test]
    fn batch_tensors_have_batch_shapes() {
        let tok = tokenizer();
        let ex = EncodedExample::encode(&CotExample::parse("4||4 #### 4").unwrap(), &tok).unwrap();
        let batch = collate(&[&ex, &ex, &ex], tok.eos_token_id());
        let ids = batch.input_ids_nocot_tensor(&Device::Cpu).unwrap();
        let labels = batch.labels_nocot_tensor(&Device::Cpu).unwrap();
        assert_eq!(ids.dims(), &[3, 4]);
        assert_eq!(labels.dtype(), candle_core::DType::I64);
    }

    #[test]
    fn loads_file_and_skips_blank_lines() {
        let (_dir, path) = make_file(&["1 + 2||1 + 2 = 3 #### 3", "", "4||4 #### 4"]);
        let ds = CotDataset::from_file(&path, &tokenizer(), 1024).unwrap();
        assert_eq!(ds.len(), 2);
    }

    #[test]
    fn drops_examples_over_max_len() {
        let (_dir, path) = make_file(&["1 + 2||1 + 2 = 3 #### 3", "4||4 #### 4"]);
        let ds = CotDataset::from_file(&path, &tokenizer(), 8).unwrap();
        assert_eq!(ds.len(), 1);
    }

    #[test]
    fn malformed_line_reports_position() {
        let (_dir, path) = make_file(&["4||4 #### 4", "no markers here"]);
        match CotDataset::from_file(&path, &tokenizer(), 1024) {
            Err(TrainError::Data { line, .. }) => assert_eq!(line, 2),
            other => panic!("expected data error, got {:?}", other.err()),
        }
    }

    #[test]
    fn empty_file_errors() {
        let (_dir, path) = make_file(&[]);
        assert!(CotDataset::from_file(&path, &tokenizer(), 1024).is_err());
    }

    #[test]
    fn batching_chunks_and_shuffles_deterministically() {
        let lines: Vec<String> = (0..5).map(|_| "4||4 #### 4".to_string()).collect();
        let raw: Vec<CotExample> = lines.iter().map(|l| CotExample::parse(l).unwrap()).collect();
        let ds = CotDataset::from_examples(&raw, &tokenizer(), 64).unwrap();

        let batches = ds.batches(2);
        assert_eq!(batches.len(), 3); // [2, 2, 1]
        assert_eq!(batches[2].len(), 1);
        assert_eq!(ds.num_batches(2), 3);

        let mut a = StdRng::seed_from_u64(9);
        let mut b = StdRng::seed_from_u64(9);
        let sa: Vec<_> = ds.shuffled_batches(2, &mut a).into_iter().map(|b| b.len()).collect();
        let sb: Vec<_> = ds.shuffled_batches(2, &mut b).into_iter().map(|b| b.len()).collect();
        assert_eq!(sa, sb);
    }
}
