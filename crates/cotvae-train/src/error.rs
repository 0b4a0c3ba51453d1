use std::path::PathBuf;

use thiserror::Error;

use cotvae_core::CoreError;

#[derive(Debug, Error)]
pub enum TrainError {
    /// The trace mask of an example has no trace position at all.
    #[error("Malformed batch: example {example} has no reasoning-trace position in its trace mask")]
    MalformedBatch { example: usize },

    /// A separator expected in the no-trace sequence is missing.
    #[error("Decode boundary: example {example} has no separator closing its {segment}")]
    DecodeBoundary { example: usize, segment: &'static str },

    #[error("Data error at {}:{line}: {reason}", path.display())]
    Data { path: PathBuf, line: usize, reason: String },

    #[error("Invalid training config: {0}")]
    Config(String),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type TrainResult<T> = Result<T, TrainError>;
