//! `cotvae train` — jointly train encoder, student and sigmas.
//!
//! ## Modes
//!
//! **Pretrained** (weights from the model directory):
//! ```text
//! cotvae train \
//!   --train data/src1_train.txt \
//!   --val   data/src1_valid.txt \
//!   --test  data/src1_test.txt \
//!   --model ./models/gpt2
//! ```
//!
//! **Fresh** (random weights, architecture from a size preset; only the
//! tokenizer is read from the model directory):
//! ```text
//! cotvae train --train ... --val ... --model ./models/gpt2 --size tiny
//! ```
//!
//! ## Dataset format
//!
//! One example per line: `problem||trace #### answer`.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use tracing::{info, warn};

use cotvae_core::{device_name, select_device, Gpt2Model, LatentModel, RunContext, SizePreset, Tokenizer};
use cotvae_train::{CotDataset, TrainConfig, Trainer};

use crate::config::{expand_home, expand_path, AppConfig};

/// Flags for `cotvae train`. Unset flags fall back to the loaded config.
#[derive(Debug, Args)]
pub struct TrainArgs {
    /// Training data (`problem||trace #### answer` per line).
    #[arg(long, value_name = "FILE")]
    pub train: PathBuf,

    /// Validation data, evaluated after every epoch.
    #[arg(long, value_name = "FILE")]
    pub val: PathBuf,

    /// Optional test data, evaluated once after training.
    #[arg(long, value_name = "FILE")]
    pub test: Option<PathBuf>,

    /// Model directory with config.json, tokenizer.json and optionally
    /// model.safetensors (default from config: model.dir).
    #[arg(long, short = 'm', value_name = "DIR")]
    pub model: Option<PathBuf>,

    /// Initialise both models from a size preset instead of loading weights.
    /// Valid values: tiny, small, medium.
    #[arg(long)]
    pub size: Option<String>,

    /// Number of training epochs.
    #[arg(long)]
    pub epochs: Option<usize>,

    /// Examples per micro-batch.
    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Micro-batches per optimizer step.
    #[arg(long)]
    pub accumulate: Option<usize>,

    /// AdamW learning rate.
    #[arg(long)]
    pub lr: Option<f64>,

    /// Gradient-norm ceiling applied to each model separately.
    #[arg(long)]
    pub max_grad_norm: Option<f64>,

    /// Drop examples whose full-trace sequence is longer than this.
    #[arg(long)]
    pub max_seq_len: Option<usize>,

    /// Seed for noise draws and shuffling.
    #[arg(long)]
    pub seed: Option<u64>,

    /// Log training metrics every N steps.
    #[arg(long)]
    pub log_every: Option<usize>,

    /// Beam width used during evaluation.
    #[arg(long)]
    pub beam_size: Option<usize>,

    /// Generation budget per evaluated example.
    #[arg(long)]
    pub max_new_tokens: Option<usize>,

    /// Prefer GPU acceleration (CUDA/Metal).
    #[arg(long)]
    pub gpu: bool,
}

impl TrainArgs {
    /// Config values overridden by whichever flags were given.
    pub fn train_config(&self, config: &AppConfig) -> TrainConfig {
        let base = config.train_config();
        TrainConfig {
            epochs: self.epochs.unwrap_or(base.epochs),
            batch_size: self.batch_size.unwrap_or(base.batch_size),
            accumulate: self.accumulate.unwrap_or(base.accumulate),
            learning_rate: self.lr.unwrap_or(base.learning_rate),
            max_grad_norm: self.max_grad_norm.unwrap_or(base.max_grad_norm),
            max_seq_len: self.max_seq_len.unwrap_or(base.max_seq_len),
            seed: self.seed.unwrap_or(base.seed),
            log_every: self.log_every.unwrap_or(base.log_every),
            beam_size: self.beam_size.unwrap_or(base.beam_size),
            max_new_tokens: self.max_new_tokens.unwrap_or(base.max_new_tokens),
            show_progress: base.show_progress,
        }
    }
}

pub fn run(args: &TrainArgs, config: &AppConfig) -> Result<()> {
    let train_config = args.train_config(config);
    train_config.validate().context("Invalid training configuration")?;
    info!(?train_config, "Training configuration");

    let model_dir = match &args.model {
        Some(dir) => expand_path(dir),
        None => expand_home(&config.model.dir),
    };

    // ── Tokenizer and data ────────────────────────────────────────────────────
    let tokenizer_path = model_dir.join("tokenizer.json");
    let tokenizer = Tokenizer::from_file(&tokenizer_path)
        .with_context(|| format!("Failed to load tokenizer from {}", tokenizer_path.display()))?;

    let load = |path: &PathBuf| {
        let path = expand_path(path);
        CotDataset::from_file(&path, &tokenizer, train_config.max_seq_len)
            .with_context(|| format!("Failed to load dataset {}", path.display()))
    };
    let train_set = load(&args.train)?;
    let val_set = load(&args.val)?;
    let test_set = args.test.as_ref().map(load).transpose()?;

    // ── Models ────────────────────────────────────────────────────────────────
    let device = select_device(args.gpu || config.device.prefer_gpu, config.device.cuda_device_id)?;
    let ctx = RunContext::new(device);
    info!(device = device_name(&ctx.device), dtype = ?ctx.dtype, "Run context ready");

    let (encoder, student) = match args.size.as_deref() {
        Some(size) => {
            let preset = SizePreset::parse(size)?;
            let gpt2 = preset.gpt2_config(tokenizer.vocab_size());
            info!(preset = preset.label(), vocab_size = gpt2.vocab_size, "Building models from size preset");
            (Gpt2Model::from_config(gpt2.clone(), &ctx)?, Gpt2Model::from_config(gpt2, &ctx)?)
        }
        None => (
            Gpt2Model::from_dir(&model_dir, &ctx).context("Failed to load encoder")?,
            Gpt2Model::from_dir(&model_dir, &ctx).context("Failed to load student")?,
        ),
    };
    if tokenizer.vocab_size() > student.vocab_size() {
        warn!(
            tokenizer = tokenizer.vocab_size(),
            model = student.vocab_size(),
            "Tokenizer vocabulary is larger than the model's embedding table"
        );
    }

    // ── Train ─────────────────────────────────────────────────────────────────
    let mut trainer = Trainer::new(encoder, student, tokenizer, train_config, ctx)?;
    let stats = trainer.fit(&train_set, Some(&val_set))?;

    info!(
        steps = stats.total_steps,
        optimizer_steps = stats.optimizer_steps,
        loss = stats.final_loss,
        elapsed = format!("{:.1}s", stats.elapsed_secs),
        tok_s = format!("{:.0}", stats.tokens_per_sec),
        "Training complete"
    );

    if let Some(test_set) = &test_set {
        let report = trainer.evaluate(test_set)?;
        info!(
            ppl = report.perplexity,
            accuracy = report.accuracy,
            token_accuracy = report.token_accuracy,
            "Test"
        );
    }

    let validation = stats
        .validation
        .as_ref()
        .map(|r| format!("{:.4} (ppl {:.3})", r.accuracy, r.perplexity))
        .unwrap_or_else(|| "n/a".to_string());
    println!(
        "\nTraining complete!\n\
         Steps: {} ({} optimizer steps)\n\
         Final loss: {:.4}\n\
         Validation accuracy: {}\n\
         Sigmas: {:?}\n\
         Elapsed: {:.1} s ({:.0} tok/s)",
        stats.total_steps,
        stats.optimizer_steps,
        stats.final_loss,
        validation,
        stats.sigmas,
        stats.elapsed_secs,
        stats.tokens_per_sec,
    );

    Ok(())
}
