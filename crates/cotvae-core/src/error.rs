use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Model config error: {field} — {reason}")]
    Config { field: String, reason: String },

    #[error("Latent mismatch: expected {expected} layers, got {got}")]
    LatentLayers { expected: usize, got: usize },

    #[error("Batch mismatch: expected {expected} rows, got {got}")]
    BatchMismatch { expected: usize, got: usize },

    #[error("First offset {offset} out of range for sequence length {seq_len}")]
    OffsetOutOfRange { offset: usize, seq_len: usize },

    #[error("Sequence too long: {got} tokens, max {max}")]
    SequenceTooLong { got: usize, max: usize },
}

pub type CoreResult<T> = Result<T, CoreError>;
