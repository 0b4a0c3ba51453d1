use std::path::{Path, PathBuf};

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

use cotvae_train::TrainConfig;

/// Full runtime configuration loaded from TOML + env vars.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    pub training: TrainingConfig,
    pub evaluation: EvaluationConfig,
    pub model: ModelConfig,
    pub device: DeviceConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TrainingConfig {
    pub epochs: usize,
    pub batch_size: usize,
    pub accumulate: usize,
    pub learning_rate: f64,
    pub max_grad_norm: f64,
    pub max_seq_len: usize,
    pub seed: u64,
    pub log_every: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EvaluationConfig {
    pub beam_size: usize,
    pub max_new_tokens: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModelConfig {
    /// Directory holding `config.json`, `tokenizer.json` and optionally
    /// `model.safetensors`.
    pub dir: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeviceConfig {
    pub prefer_gpu: bool,
    pub cuda_device_id: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        let train = TrainConfig::default();
        Self {
            training: TrainingConfig {
                epochs: train.epochs,
                batch_size: train.batch_size,
                accumulate: train.accumulate,
                learning_rate: train.learning_rate,
                max_grad_norm: train.max_grad_norm,
                max_seq_len: train.max_seq_len,
                seed: train.seed,
                log_every: train.log_every,
            },
            evaluation: EvaluationConfig {
                beam_size: train.beam_size,
                max_new_tokens: train.max_new_tokens,
            },
            model: ModelConfig { dir: "~/.cache/cotvae/gpt2".to_string() },
            device: DeviceConfig { prefer_gpu: false, cuda_device_id: 0 },
        }
    }
}

impl AppConfig {
    /// Library-side training config with the configured values.
    pub fn train_config(&self) -> TrainConfig {
        TrainConfig {
            epochs: self.training.epochs,
            batch_size: self.training.batch_size,
            accumulate: self.training.accumulate,
            learning_rate: self.training.learning_rate,
            max_grad_norm: self.training.max_grad_norm,
            max_seq_len: self.training.max_seq_len,
            seed: self.training.seed,
            log_every: self.training.log_every,
            beam_size: self.evaluation.beam_size,
            max_new_tokens: self.evaluation.max_new_tokens,
            show_progress: true,
        }
    }
}

/// Load configuration from:
/// 1. Built-in defaults
/// 2. `config/default.toml` (if present)
/// 3. A custom config file path (if provided)
/// 4. Environment variables prefixed with `COTVAE_`, sections split by `__`
///    (e.g. `COTVAE_TRAINING__BATCH_SIZE=8`)
pub fn load_config(config_file: Option<&PathBuf>) -> Result<AppConfig, ConfigError> {
    let d = AppConfig::default();
    let mut builder = Config::builder()
        .set_default("training.epochs", d.training.epochs as i64)?
        .set_default("training.batch_size", d.training.batch_size as i64)?
        .set_default("training.accumulate", d.training.accumulate as i64)?
        .set_default("training.learning_rate", d.training.learning_rate)?
        .set_default("training.max_grad_norm", d.training.max_grad_norm)?
        .set_default("training.max_seq_len", d.training.max_seq_len as i64)?
        .set_default("training.seed", d.training.seed as i64)?
        .set_default("training.log_every", d.training.log_every as i64)?
        .set_default("evaluation.beam_size", d.evaluation.beam_size as i64)?
        .set_default("evaluation.max_new_tokens", d.evaluation.max_new_tokens as i64)?
        .set_default("model.dir", d.model.dir)?
        .set_default("device.prefer_gpu", d.device.prefer_gpu)?
        .set_default("device.cuda_device_id", d.device.cuda_device_id as i64)?
        .add_source(File::with_name("config/default").required(false));

    if let Some(path) = config_file {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(
        Environment::with_prefix("COTVAE")
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}

/// Expand a leading `~/` to the home directory.
pub fn expand_home(raw: &str) -> PathBuf {
    if let Some(rest) = raw.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(raw)
}

/// `expand_home` for paths that came from the command line.
pub fn expand_path(path: &Path) -> PathBuf {
    match path.to_str() {
        Some(s) => expand_home(s),
        None => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    // ── load_config defaults ──────────────────────────────────────────────────

    #[test]
    fn default_training_values() {
        let cfg = load_config(None).unwrap();
        assert_eq!(cfg.training.epochs, 5);
        assert_eq!(cfg.training.batch_size, 5);
        assert_eq!(cfg.training.accumulate, 1);
        assert!((cfg.training.learning_rate - 5e-5).abs() < f64::EPSILON);
        assert!((cfg.training.max_grad_norm - 1.0).abs() < f64::EPSILON);
        assert_eq!(cfg.training.seed, 1234);
    }

    #[test]
    fn default_evaluation_values() {
        let cfg = load_config(None).unwrap();
        assert_eq!(cfg.evaluation.beam_size, 5);
        assert_eq!(cfg.evaluation.max_new_tokens, 100);
    }

    #[test]
    fn default_device_is_cpu() {
        let cfg = load_config(None).unwrap();
        assert!(!cfg.device.prefer_gpu);
        assert_eq!(cfg.device.cuda_device_id, 0);
    }

    // ── load_config from a custom file ────────────────────────────────────────

    #[test]
    fn custom_config_file_overrides_defaults() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("custom.toml");
        std::fs::write(
            &file,
            "[training]\nbatch_size = 16\naccumulate = 4\n\n[evaluation]\nbeam_size = 3\n",
        )
        .unwrap();

        let cfg = load_config(Some(&file)).unwrap();
        assert_eq!(cfg.training.batch_size, 16);
        assert_eq!(cfg.training.accumulate, 4);
        assert_eq!(cfg.evaluation.beam_size, 3);
        assert_eq!(cfg.training.epochs, 5);
    }

    #[test]
    fn missing_custom_file_is_an_error() {
        let missing = PathBuf::from("/nonexistent/cotvae.toml");
        assert!(load_config(Some(&missing)).is_err());
    }

    // ── AppConfig → TrainConfig ───────────────────────────────────────────────

    #[test]
    fn train_config_carries_all_sections() {
        let mut cfg = AppConfig::default();
        cfg.training.accumulate = 3;
        cfg.evaluation.max_new_tokens = 7;
        let train = cfg.train_config();
        assert_eq!(train.accumulate, 3);
        assert_eq!(train.max_new_tokens, 7);
        assert!(train.validate().is_ok());
    }

    // ── expand_home ───────────────────────────────────────────────────────────

    #[test]
    fn expand_absolute_path_unchanged() {
        assert_eq!(expand_home("/models/gpt2"), PathBuf::from("/models/gpt2"));
    }

    #[test]
    fn expand_tilde_produces_non_tilde_prefix() {
        let path = expand_home("~/.cache/cotvae/gpt2");
        let s = path.to_string_lossy();
        assert!(!s.starts_with('~'), "Expanded path must not start with '~', got: {s}");
        assert!(s.ends_with("gpt2"), "Expanded path must keep its tail, got: {s}");
    }

    #[test]
    fn expand_relative_path_unchanged() {
        assert_eq!(expand_path(Path::new("relative/path")), PathBuf::from("relative/path"));
    }
}
