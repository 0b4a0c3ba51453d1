//! # cotvae-core
//!
//! Model-side building blocks for variational chain-of-thought compression.
//!
//! | Item | Role |
//! |------|------|
//! | [`LatentModel`] | capability interface: hidden-state scoring, latent-conditioned forward and generation |
//! | [`Gpt2Model`] | GPT-2 style implementation of [`LatentModel`] backed by a trainable `VarMap` |
//! | [`Tokenizer`] | `tokenizers` wrapper exposing the end-of-segment id |
//! | [`beam::beam_search`] | beam search over any next-token scorer |
//! | [`RunContext`] | immutable device / dtype placement shared by every component |
//!
//! ## Feature Flags
//!
//! | Flag | Effect |
//! |---|---|
//! | `cuda` | Enable CUDA GPU acceleration |
//! | `metal` | Enable Apple Metal GPU acceleration |

pub mod beam;
pub mod device;
pub mod error;
pub mod gpt2;
pub mod model;
pub mod presets;
pub mod tokenizer;

pub use device::{device_name, select_device, RunContext};
pub use error::{CoreError, CoreResult};
pub use gpt2::{Gpt2Config, Gpt2Model};
pub use model::{select_positions, BeamParams, HiddenOutput, LatentModel, LatentOutput};
pub use presets::SizePreset;
pub use tokenizer::Tokenizer;
