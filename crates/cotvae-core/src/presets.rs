//! Architecture size presets for fresh model initialisation.
//!
//! | Preset   | Layers | Hidden | Heads | Positions | ~Params |
//! |----------|--------|--------|-------|-----------|---------|
//! | `tiny`   | 2      | 32     | 2     | 256       | vocab-dominated |
//! | `small`  | 12     | 768    | 12    | 1024      | ~124M   |
//! | `medium` | 24     | 1024   | 16    | 1024      | ~355M   |

use crate::error::{CoreError, CoreResult};
use crate::gpt2::Gpt2Config;

/// GPT-2 architecture size preset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizePreset {
    /// Two-layer toy model for smoke runs and tests.
    Tiny,
    /// GPT-2 small.
    Small,
    /// GPT-2 medium.
    Medium,
}

impl SizePreset {
    /// Parse a user-supplied string (`"tiny"`, `"small"`, `"medium"`).
    pub fn parse(s: &str) -> CoreResult<Self> {
        match s.trim().to_lowercase().as_str() {
            "tiny" => Ok(Self::Tiny),
            "small" | "gpt2" => Ok(Self::Small),
            "medium" | "gpt2-medium" => Ok(Self::Medium),
            other => Err(CoreError::Config {
                field: "size".to_string(),
                reason: format!("unknown size preset '{other}'. Valid values: tiny, small, medium."),
            }),
        }
    }

    /// Human-readable label.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Tiny => "tiny",
            Self::Small => "small",
            Self::Medium => "medium",
        }
    }

    /// Build the [`Gpt2Config`] for this preset over `vocab_size` tokens.
    pub fn gpt2_config(&self, vocab_size: usize) -> Gpt2Config {
        let (n_layer, n_embd, n_head, n_positions) = match self {
            Self::Tiny => (2, 32, 2, 256),
            Self::Small => (12, 768, 12, 1024),
            Self::Medium => (24, 1024, 16, 1024),
        };
        Gpt2Config {
            vocab_size,
            n_positions,
            n_embd,
            n_layer,
            n_head,
            layer_norm_epsilon: 1e-5,
        }
    }
}
