//! # cotvae-train
//!
//! Variational chain-of-thought compression training.
//!
//! An *encoder* model reads `problem <e> trace <e> answer <e>` and its
//! per-layer hidden states are sampled at evenly spaced anchors inside the
//! trace. Those states, perturbed by a learned per-layer sigma, are injected
//! into a *student* model that only sees `problem <e> answer <e>`. Both
//! models and the sigmas are trained jointly on the student's answer
//! cross-entropy plus a KL-style penalty between the encoder's latents and
//! the student's own estimate of them.
//!
//! 1. [`span`] locates the trace span and plans the anchors of each example.
//! 2. [`latent`] gathers and perturbs the anchor states.
//! 3. [`objective`] scores the student (accuracy, NLL, KL, perplexity).
//! 4. [`optim`] accumulates gradients and clips each model independently.
//! 5. [`trainer`] drives epochs; [`evaluator`] beam-searches and scores
//!    exact-match answers.
//!
//! ## Usage
//!
//! ```text
//! cotvae train \
//!   --train data/src1_train.txt \
//!   --val   data/src1_valid.txt \
//!   --model ./models/gpt2 \
//!   --epochs 5 --batch-size 5 --lr 5e-5
//! ```

pub mod conditioned;
pub mod dataset;
pub mod error;
pub mod evaluator;
pub mod latent;
pub mod objective;
pub mod optim;
mod progress;
pub mod reform;
pub mod span;
pub mod trainer;

pub use dataset::{collate, CotBatch, CotDataset, CotExample, EncodedExample};
pub use error::{TrainError, TrainResult};
pub use evaluator::{normalize_answer, EvalReport, Evaluator};
pub use latent::{extract_latents, LatentSample, Sigmas};
pub use span::{anchor_positions, locate_trace_span, plan_batch, BatchPlan, TraceSpan, IGNORE_INDEX};
pub use trainer::{StepMetrics, TrainConfig, Trainer, TrainingStats};
