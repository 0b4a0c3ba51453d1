//! Training orchestrator.
//!
//! Every step runs the encoder over the full-trace sequence, draws noisy
//! latents at the planned anchors, scores the no-trace sequence with the
//! student conditioned on them and minimises
//!
//! ```text
//! loss = nll(student) + Σ_l |zs0_l - zs_p_l|² / (2 σ_l² · valid_tokens)
//! ```
//!
//! jointly over the student, the encoder and the per-layer sigmas, with
//! gradient accumulation and independent clipping of both models.

use std::time::Instant;

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use cotvae_core::{BeamParams, CoreError, LatentModel, RunContext, Tokenizer};

use crate::conditioned::conditioned_forward;
use crate::dataset::{CotBatch, CotDataset};
use crate::error::{TrainError, TrainResult};
use crate::evaluator::{EvalReport, Evaluator};
use crate::latent::Sigmas;
use crate::objective::{kl_penalty, masked_nll, perplexity, token_accuracy};
use crate::optim::{AccumulatingOptimizer, ParamGroup, StepReport};
use crate::progress::{format_duration, hidden_bar, progress_bar};

// ── Config ────────────────────────────────────────────────────────────────────

/// Hyper-parameters for a training run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    /// Number of full passes over the training set.
    pub epochs: usize,
    /// Number of examples per micro-batch.
    pub batch_size: usize,
    /// Micro-batches summed into one optimizer step.
    pub accumulate: usize,
    /// AdamW learning rate.
    pub learning_rate: f64,
    /// Per-model gradient-norm ceiling.
    pub max_grad_norm: f64,
    /// Examples whose full-trace sequence is longer are dropped at load time.
    pub max_seq_len: usize,
    /// Seeds noise draws and batch shuffling.
    pub seed: u64,
    /// Log step metrics every this many micro-batches.
    pub log_every: usize,
    /// Beam width used during evaluation.
    pub beam_size: usize,
    /// Generation budget per evaluated example.
    pub max_new_tokens: usize,
    /// Draw progress bars.
    pub show_progress: bool,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            epochs: 5,
            batch_size: 5,
            accumulate: 1,
            learning_rate: 5e-5,
            max_grad_norm: 1.0,
            max_seq_len: 1024,
            seed: 1234,
            log_every: 100,
            beam_size: 5,
            max_new_tokens: 100,
            show_progress: true,
        }
    }
}

impl TrainConfig {
    pub fn validate(&self) -> TrainResult<()> {
        if self.batch_size == 0 {
            return Err(TrainError::Config("batch_size must be at least 1".into()));
        }
        if self.accumulate == 0 {
            return Err(TrainError::Config("accumulate must be at least 1".into()));
        }
        if self.beam_size == 0 {
            return Err(TrainError::Config("beam_size must be at least 1".into()));
        }
        if !self.max_grad_norm.is_finite() || self.max_grad_norm <= 0.0 {
            return Err(TrainError::Config(format!(
                "max_grad_norm must be positive, got {}",
                self.max_grad_norm
            )));
        }
        Ok(())
    }
}

// ── Statistics ────────────────────────────────────────────────────────────────

/// Scalars of one training micro-batch.
#[derive(Debug, Clone)]
pub struct StepMetrics {
    /// Global micro-batch index of this step.
    pub step: usize,
    /// `nll + kl`, before division by the accumulation factor.
    pub loss: f64,
    pub nll: f64,
    pub kl: f64,
    pub token_accuracy: f64,
    pub perplexity: f64,
    /// Perplexity of the reconstruction term alone.
    pub nll_perplexity: f64,
    /// Present when this step closed an accumulation window.
    pub optimizer_step: Option<StepReport>,
}

/// Summary returned after training completes.
#[derive(Debug, Clone)]
pub struct TrainingStats {
    pub total_steps: usize,
    pub optimizer_steps: usize,
    pub final_loss: f64,
    pub elapsed_secs: f64,
    pub tokens_per_sec: f64,
    pub sigmas: Vec<f32>,
    /// Report of the last per-epoch validation run.
    pub validation: Option<EvalReport>,
}

// ── Trainer ───────────────────────────────────────────────────────────────────

/// Owns both models, the sigmas, the optimizer and the run RNG.
pub struct Trainer<E: LatentModel, S: LatentModel> {
    encoder: E,
    student: S,
    sigmas: Sigmas,
    tokenizer: Tokenizer,
    config: TrainConfig,
    ctx: RunContext,
    optimizer: AccumulatingOptimizer,
    rng: StdRng,
    step: usize,
    optimizer_steps: usize,
}

impl<E: LatentModel, S: LatentModel> Trainer<E, S> {
    pub fn new(
        encoder: E,
        student: S,
        tokenizer: Tokenizer,
        config: TrainConfig,
        ctx: RunContext,
    ) -> TrainResult<Self> {
        config.validate()?;
        if encoder.num_layers() != student.num_layers() {
            return Err(CoreError::LatentLayers {
                expected: student.num_layers(),
                got: encoder.num_layers(),
            }
            .into());
        }

        let sigmas = Sigmas::new(student.num_layers(), &ctx)?;
        let groups = vec![
            ParamGroup {
                name: "student",
                vars: student.trainable_vars(),
                max_grad_norm: Some(config.max_grad_norm),
            },
            ParamGroup {
                name: "encoder",
                vars: encoder.trainable_vars(),
                max_grad_norm: Some(config.max_grad_norm),
            },
            ParamGroup { name: "sigma", vars: vec![sigmas.var().clone()], max_grad_norm: None },
        ];
        let optimizer = AccumulatingOptimizer::new(groups, config.learning_rate, config.accumulate)?;
        let rng = StdRng::seed_from_u64(config.seed);

        info!(
            layers = student.num_layers(),
            hidden = student.hidden_size(),
            lr = config.learning_rate,
            accumulate = config.accumulate,
            seed = config.seed,
            "Trainer ready"
        );

        Ok(Self {
            encoder,
            student,
            sigmas,
            tokenizer,
            config,
            ctx,
            optimizer,
            rng,
            step: 0,
            optimizer_steps: 0,
        })
    }

    pub fn config(&self) -> &TrainConfig {
        &self.config
    }

    pub fn sigmas(&self) -> &Sigmas {
        &self.sigmas
    }

    pub fn encoder(&self) -> &E {
        &self.encoder
    }

    pub fn student(&self) -> &S {
        &self.student
    }

    /// Micro-batches processed so far.
    pub fn step(&self) -> usize {
        self.step
    }

    pub fn beam_params(&self) -> BeamParams {
        BeamParams {
            beam_size: self.config.beam_size,
            max_new_tokens: self.config.max_new_tokens,
            ..BeamParams::new(self.tokenizer.eos_token_id())
        }
    }

    /// Forward, backward and (on an accumulation boundary) update on one
    /// micro-batch.
    pub fn train_step(&mut self, batch: &CotBatch) -> TrainResult<StepMetrics> {
        let pass = conditioned_forward(
            &self.encoder,
            &self.student,
            &self.sigmas,
            batch,
            &self.ctx.device,
            &mut self.rng,
        )?;

        let acc = token_accuracy(&pass.logits, &batch.labels_nocot)?;
        let nll = masked_nll(&pass.logits, &batch.labels_nocot)?;
        let kl = kl_penalty(&pass.sample.clean, &pass.predicted_latents, &self.sigmas, nll.valid_tokens)?;
        let loss = (&nll.loss + &kl)?;
        let scaled = (&loss / self.config.accumulate as f64)?;

        let step = self.step;
        let optimizer_step = self.optimizer.backward(&scaled, step)?;
        if optimizer_step.is_some() {
            self.optimizer_steps += 1;
        }
        self.step += 1;

        let loss = loss.to_scalar::<f32>()? as f64;
        let nll = nll.loss.to_scalar::<f32>()? as f64;
        let kl = kl.to_scalar::<f32>()? as f64;
        Ok(StepMetrics {
            step,
            loss,
            nll,
            kl,
            token_accuracy: acc.value(),
            perplexity: perplexity(loss),
            nll_perplexity: perplexity(nll),
            optimizer_step,
        })
    }

    /// Train for `config.epochs` epochs, evaluating on `validation` after
    /// each one.
    pub fn fit(&mut self, train: &CotDataset, validation: Option<&CotDataset>) -> TrainResult<TrainingStats> {
        if train.is_empty() {
            return Err(TrainError::Config("training set is empty".into()));
        }
        let batches_per_epoch = train.num_batches(self.config.batch_size);
        let total = (batches_per_epoch * self.config.epochs) as u64;
        let pb = if self.config.show_progress {
            progress_bar(total, "Training")
        } else {
            hidden_bar()
        };

        info!(
            examples = train.len(),
            epochs = self.config.epochs,
            batch_size = self.config.batch_size,
            "Starting training"
        );

        let start = Instant::now();
        let mut last_loss = f64::NAN;
        let mut total_tokens = 0usize;
        let mut last_validation = None;

        for epoch in 0..self.config.epochs {
            let batches = train.shuffled_batches(self.config.batch_size, &mut self.rng);
            for batch in &batches {
                let metrics = self.train_step(batch)?;
                last_loss = metrics.loss;
                total_tokens += batch.input_ids_cot.iter().map(Vec::len).sum::<usize>();

                if metrics.step % self.config.log_every.max(1) == 0 {
                    let sigmas = self.sigmas.values()?;
                    info!(
                        step = metrics.step,
                        ppl = metrics.perplexity,
                        loss = metrics.loss,
                        ppl0 = metrics.nll_perplexity,
                        kl = metrics.kl,
                        accuracy = metrics.token_accuracy,
                        ?sigmas,
                        "Step"
                    );
                }
                pb.set_message(format!(
                    "epoch {}/{} loss {:.4}",
                    epoch + 1,
                    self.config.epochs,
                    metrics.loss
                ));
                pb.inc(1);
            }

            if let Some(val) = validation {
                let report = self.evaluate(val)?;
                let sigmas = self.sigmas.values()?;
                info!(
                    epoch,
                    ppl = report.perplexity,
                    accuracy = report.accuracy,
                    token_accuracy = report.token_accuracy,
                    ?sigmas,
                    "Validation"
                );
                last_validation = Some(report);
            } else {
                info!(epoch, loss = last_loss, "Epoch complete");
            }
        }

        if self.optimizer.pending_micro_batches() > 0 {
            debug!(
                pending = self.optimizer.pending_micro_batches(),
                "Training ended inside an accumulation window; trailing gradients not applied"
            );
        }

        let elapsed = start.elapsed().as_secs_f64();
        pb.finish_with_message(format!(
            "Training complete in {} - final loss {last_loss:.4}",
            format_duration(elapsed as u64)
        ));

        Ok(TrainingStats {
            total_steps: self.step,
            optimizer_steps: self.optimizer_steps,
            final_loss: last_loss,
            elapsed_secs: elapsed,
            tokens_per_sec: if elapsed > 0.0 { total_tokens as f64 / elapsed } else { 0.0 },
            sigmas: self.sigmas.values()?,
            validation: last_validation,
        })
    }

    /// Evaluate on `dataset` with the current weights and sigmas.
    pub fn evaluate(&mut self, dataset: &CotDataset) -> TrainResult<EvalReport> {
        let batches = dataset.shuffled_batches(self.config.batch_size, &mut self.rng);
        let evaluator = Evaluator::new(
            &self.encoder,
            &self.student,
            &self.sigmas,
            &self.tokenizer,
            self.beam_params(),
        )
        .with_progress(self.config.show_progress);
        evaluator.run(&batches, &mut self.rng)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::CotExample;
    use cotvae_core::{Gpt2Model, SizePreset};

    const LINES: &[&str] = &[
        "1 + 2||1 + 2 = 3 #### 3",
        "2 + 2||2 + 2 = 4 #### 4",
        "1 + 3||1 + 3 = 4 #### 4",
        "2 + 1||2 + 1 = 3 #### 3",
        "1 + 1||1 + 1 = 2 #### 2",
    ];

    fn tokenizer() -> Tokenizer {
        Tokenizer::from_word_vocab(&["1", "2", "3", "4", "+", "=", ","]).unwrap()
    }

    fn dataset(tok: &Tokenizer) -> CotDataset {
        let raw: Vec<CotExample> = LINES.iter().map(|l| CotExample::parse(l).unwrap()).collect();
        CotDataset::from_examples(&raw, tok, 64).unwrap()
    }

    fn quiet_config() -> TrainConfig {
        TrainConfig {
            epochs: 1,
            batch_size: 2,
            accumulate: 2,
            learning_rate: 1e-2,
            log_every: 1,
            beam_size: 2,
            max_new_tokens: 3,
            show_progress: false,
            ..TrainConfig::default()
        }
    }

    fn trainer(config: TrainConfig) -> Trainer<Gpt2Model, Gpt2Model> {
        let ctx = RunContext::cpu();
        let tok = tokenizer();
        let cfg = SizePreset::Tiny.gpt2_config(tok.vocab_size());
        let encoder = Gpt2Model::from_config(cfg.clone(), &ctx).unwrap();
        let student = Gpt2Model::from_config(cfg, &ctx).unwrap();
        Trainer::new(encoder, student, tok, config, ctx).unwrap()
    }

    #[test]
    fn default_config_matches_reference_hyper_parameters() {
        let cfg = TrainConfig::default();
        assert_eq!(cfg.epochs, 5);
        assert_eq!(cfg.batch_size, 5);
        assert_eq!(cfg.accumulate, 1);
        assert!((cfg.learning_rate - 5e-5).abs() < 1e-12);
        assert!((cfg.max_grad_norm - 1.0).abs() < 1e-12);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn invalid_config_is_rejected() {
        let cfg = TrainConfig { accumulate: 0, ..TrainConfig::default() };
        assert!(cfg.validate().is_err());
        let cfg = TrainConfig { max_grad_norm: f64::NAN, ..TrainConfig::default() };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn train_step_follows_accumulation_windows() {
        let mut t = trainer(quiet_config());
        let tok = tokenizer();
        let ds = dataset(&tok);
        let batches = ds.batches(2);

        let first = t.train_step(&batches[0]).unwrap();
        assert_eq!(first.step, 0);
        assert!(first.optimizer_step.is_none());
        assert!(first.loss.is_finite());
        assert!(first.kl >= 0.0);
        assert!((first.loss - (first.nll + first.kl)).abs() < 1e-3);

        let second = t.train_step(&batches[1]).unwrap();
        let report = second.optimizer_step.expect("second micro-batch closes the window");
        let names: Vec<_> = report.grad_norms.iter().map(|(n, _)| *n).collect();
        assert_eq!(names, vec!["student", "encoder", "sigma"]);
        assert_eq!(t.step(), 2);
    }

    #[test]
    fn optimizer_step_moves_sigmas() {
        let mut t = trainer(TrainConfig { accumulate: 1, ..quiet_config() });
        let tok = tokenizer();
        let ds = dataset(&tok);
        let before = t.sigmas().values().unwrap();
        t.train_step(&ds.batches(2)[0]).unwrap();
        let after = t.sigmas().values().unwrap();
        assert_ne!(before, after);
    }

    #[test]
    fn fit_runs_an_epoch_and_validates() {
        let mut t = trainer(quiet_config());
        let tok = tokenizer();
        let ds = dataset(&tok);

        let stats = t.fit(&ds, Some(&ds)).unwrap();
        assert_eq!(stats.total_steps, 3);
        assert_eq!(stats.optimizer_steps, 1);
        assert_eq!(stats.sigmas.len(), 2);

        let report = stats.validation.unwrap();
        assert_eq!(report.examples, LINES.len());
        assert!((0.0..=1.0).contains(&report.accuracy));
        assert!((0.0..=1.0).contains(&report.token_accuracy));
        assert!(report.perplexity >= 1.0);
        assert_eq!(report.decode_errors, 0);
    }

    #[test]
    fn unsplittable_example_is_a_miss_not_an_abort() {
        let t = trainer(quiet_config());
        let tok = tokenizer();
        let eos = tok.eos_token_id();
        let mut batches = dataset(&tok).batches(2);

        // No separators left in the first row's no-trace sequence.
        for id in batches[0].input_ids_nocot[0].iter_mut() {
            if *id == eos {
                *id = 0;
            }
        }

        let report = Evaluator::new(t.encoder(), t.student(), t.sigmas(), &tok, t.beam_params())
            .with_progress(false)
            .run(&batches, &mut StdRng::seed_from_u64(7))
            .unwrap();
        assert_eq!(report.examples, LINES.len());
        assert_eq!(report.decode_errors, 1);
        assert!(report.correct < report.examples);
        assert!(report.loss.is_finite());
    }

    #[test]
    fn evaluation_leaves_parameters_untouched() {
        let mut t = trainer(quiet_config());
        let tok = tokenizer();
        let ds = dataset(&tok);
        let weights = |t: &Trainer<Gpt2Model, Gpt2Model>| {
            t.student().trainable_vars()[0].as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap()
        };

        let sigmas = t.sigmas().values().unwrap();
        let student = weights(&t);
        t.evaluate(&ds).unwrap();
        assert_eq!(t.sigmas().values().unwrap(), sigmas);
        assert_eq!(weights(&t), student);
    }

    #[test]
    fn mismatched_layer_counts_are_rejected() {
        let ctx = RunContext::cpu();
        let tok = tokenizer();
        let small = SizePreset::Tiny.gpt2_config(tok.vocab_size());
        let mut deeper = small.clone();
        deeper.n_layer = 3;
        let encoder = Gpt2Model::from_config(deeper, &ctx).unwrap();
        let student = Gpt2Model::from_config(small, &ctx).unwrap();
        assert!(Trainer::new(encoder, student, tok, quiet_config(), ctx).is_err());
    }
}
