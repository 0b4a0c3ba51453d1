//! GPT-2 style decoder that satisfies [`LatentModel`].
//!
//! Parameters live in a [`VarMap`] so the model can be trained directly. The
//! layout and parameter names follow the Hugging Face GPT-2 checkpoint
//! (`wte`, `wpe`, `h.{i}.attn.c_attn`, …, `ln_f`), so a `model.safetensors`
//! from the hub loads without renaming. The language-model head is tied to
//! the token embedding.
//!
//! ## Latent injection
//!
//! Before block `l` runs, the residual stream at each example's first-output
//! offset is read out as that layer's predicted latent and then overwritten
//! with the injected latent. Causal attention keeps every earlier position
//! independent of the injection.

use std::path::Path;

use candle_core::{Device, Module, Tensor, Var, D};
use candle_nn::{Embedding, Init, VarBuilder, VarMap};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::device::RunContext;
use crate::error::{CoreError, CoreResult};
use crate::model::{select_positions, HiddenOutput, LatentModel, LatentOutput};

const INIT_STD: f64 = 0.02;

/// Hugging Face `config.json` fields for GPT-2.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Gpt2Config {
    pub vocab_size: usize,
    pub n_positions: usize,
    pub n_embd: usize,
    pub n_layer: usize,
    pub n_head: usize,
    #[serde(default = "default_layer_norm_epsilon")]
    pub layer_norm_epsilon: f64,
}

fn default_layer_norm_epsilon() -> f64 {
    1e-5
}

impl Gpt2Config {
    fn validate(&self) -> CoreResult<()> {
        if self.n_head == 0 || self.n_embd % self.n_head != 0 {
            return Err(CoreError::Config {
                field: "n_head".to_string(),
                reason: format!("n_embd {} is not divisible by n_head {}", self.n_embd, self.n_head),
            });
        }
        if self.n_layer == 0 {
            return Err(CoreError::Config {
                field: "n_layer".to_string(),
                reason: "at least one transformer layer is required".to_string(),
            });
        }
        Ok(())
    }
}

// ── Building blocks ───────────────────────────────────────────────────────────

/// GPT-2 "Conv1D": a linear layer whose weight is stored `[in, out]`.
struct Conv1D {
    weight: Tensor,
    bias: Tensor,
}

impl Conv1D {
    fn load(d_in: usize, d_out: usize, vb: VarBuilder) -> CoreResult<Self> {
        let weight = vb.get_with_hints((d_in, d_out), "weight", Init::Randn { mean: 0.0, stdev: INIT_STD })?;
        let bias = vb.get_with_hints(d_out, "bias", Init::Const(0.0))?;
        Ok(Self { weight, bias })
    }

    fn forward(&self, x: &Tensor) -> CoreResult<Tensor> {
        Ok(x.broadcast_matmul(&self.weight)?.broadcast_add(&self.bias)?)
    }
}

/// Layer norm written with primitive ops so every step has a backward pass.
struct LayerNorm {
    weight: Tensor,
    bias: Tensor,
    eps: f64,
}

impl LayerNorm {
    fn load(size: usize, eps: f64, vb: VarBuilder) -> CoreResult<Self> {
        let weight = vb.get_with_hints(size, "weight", Init::Const(1.0))?;
        let bias = vb.get_with_hints(size, "bias", Init::Const(0.0))?;
        Ok(Self { weight, bias, eps })
    }

    fn forward(&self, x: &Tensor) -> CoreResult<Tensor> {
        let mean = x.mean_keepdim(D::Minus1)?;
        let centered = x.broadcast_sub(&mean)?;
        let var = centered.sqr()?.mean_keepdim(D::Minus1)?;
        let normed = centered.broadcast_div(&(var + self.eps)?.sqrt()?)?;
        Ok(normed.broadcast_mul(&self.weight)?.broadcast_add(&self.bias)?)
    }
}

struct Attention {
    c_attn: Conv1D,
    c_proj: Conv1D,
    n_head: usize,
    head_dim: usize,
}

impl Attention {
    fn load(config: &Gpt2Config, vb: VarBuilder) -> CoreResult<Self> {
        let c = config.n_embd;
        Ok(Self {
            c_attn: Conv1D::load(c, 3 * c, vb.pp("c_attn"))?,
            c_proj: Conv1D::load(c, c, vb.pp("c_proj"))?,
            n_head: config.n_head,
            head_dim: c / config.n_head,
        })
    }

    fn forward(&self, x: &Tensor, causal_mask: &Tensor) -> CoreResult<Tensor> {
        let (b, t, c) = x.dims3()?;
        let qkv = self.c_attn.forward(x)?;
        let heads = |i: usize| -> CoreResult<Tensor> {
            Ok(qkv
                .narrow(D::Minus1, i * c, c)?
                .reshape((b, t, self.n_head, self.head_dim))?
                .transpose(1, 2)?
                .contiguous()?)
        };
        let (q, k, v) = (heads(0)?, heads(1)?, heads(2)?);

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let scores = (q.matmul(&k.t()?.contiguous()?)? * scale)?.broadcast_add(causal_mask)?;
        let probs = candle_nn::ops::softmax(&scores, D::Minus1)?;
        let y = probs.matmul(&v)?.transpose(1, 2)?.reshape((b, t, c))?;
        self.c_proj.forward(&y)
    }
}

struct Mlp {
    c_fc: Conv1D,
    c_proj: Conv1D,
}

impl Mlp {
    fn load(config: &Gpt2Config, vb: VarBuilder) -> CoreResult<Self> {
        let c = config.n_embd;
        Ok(Self {
            c_fc: Conv1D::load(c, 4 * c, vb.pp("c_fc"))?,
            c_proj: Conv1D::load(4 * c, c, vb.pp("c_proj"))?,
        })
    }

    fn forward(&self, x: &Tensor) -> CoreResult<Tensor> {
        // GPT-2 uses the tanh approximation ("gelu_new").
        self.c_proj.forward(&self.c_fc.forward(x)?.gelu()?)
    }
}

struct Block {
    ln_1: LayerNorm,
    attn: Attention,
    ln_2: LayerNorm,
    mlp: Mlp,
}

impl Block {
    fn load(config: &Gpt2Config, vb: VarBuilder) -> CoreResult<Self> {
        let eps = config.layer_norm_epsilon;
        Ok(Self {
            ln_1: LayerNorm::load(config.n_embd, eps, vb.pp("ln_1"))?,
            attn: Attention::load(config, vb.pp("attn"))?,
            ln_2: LayerNorm::load(config.n_embd, eps, vb.pp("ln_2"))?,
            mlp: Mlp::load(config, vb.pp("mlp"))?,
        })
    }

    fn forward(&self, x: &Tensor, causal_mask: &Tensor) -> CoreResult<Tensor> {
        let x = (x + self.attn.forward(&self.ln_1.forward(x)?, causal_mask)?)?;
        Ok((&x + self.mlp.forward(&self.ln_2.forward(&x)?)?)?)
    }
}

// ── Gpt2Model ─────────────────────────────────────────────────────────────────

/// Trainable GPT-2 style decoder with per-layer latent injection.
pub struct Gpt2Model {
    wte: Embedding,
    wpe: Embedding,
    blocks: Vec<Block>,
    ln_f: LayerNorm,
    varmap: VarMap,
    config: Gpt2Config,
    ctx: RunContext,
}

impl std::fmt::Debug for Gpt2Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gpt2Model")
            .field("config", &self.config)
            .field("dtype", &self.ctx.dtype)
            .finish()
    }
}

impl Gpt2Model {
    /// Build a model with freshly initialised weights.
    pub fn from_config(config: Gpt2Config, ctx: &RunContext) -> CoreResult<Self> {
        config.validate()?;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, ctx.dtype, &ctx.device);

        let c = config.n_embd;
        let wte = vb.get_with_hints((config.vocab_size, c), "wte.weight", Init::Randn { mean: 0.0, stdev: INIT_STD })?;
        let wpe = vb.get_with_hints((config.n_positions, c), "wpe.weight", Init::Randn { mean: 0.0, stdev: 0.01 })?;
        let blocks = (0..config.n_layer)
            .map(|i| Block::load(&config, vb.pp(format!("h.{i}"))))
            .collect::<CoreResult<Vec<_>>>()?;
        let ln_f = LayerNorm::load(c, config.layer_norm_epsilon, vb.pp("ln_f"))?;

        Ok(Self {
            wte: Embedding::new(wte, c),
            wpe: Embedding::new(wpe, c),
            blocks,
            ln_f,
            varmap,
            config,
            ctx: ctx.clone(),
        })
    }

    /// Load a model directory holding a GPT-2 `config.json` and, optionally,
    /// `model.safetensors`. Without weights the model starts from random
    /// initialisation.
    pub fn from_dir(model_dir: &Path, ctx: &RunContext) -> CoreResult<Self> {
        let config_path = model_dir.join("config.json");
        let json = std::fs::read_to_string(&config_path)?;
        let config: Gpt2Config = serde_json::from_str(&json)?;

        info!(
            model_dir = %model_dir.display(),
            n_layer = config.n_layer,
            n_embd = config.n_embd,
            vocab_size = config.vocab_size,
            "Loading GPT-2 model"
        );

        let mut model = Self::from_config(config, ctx)?;

        // VarMap::load overwrites every registered parameter from the file.
        let weights = model_dir.join("model.safetensors");
        if weights.exists() {
            model.varmap.load(&weights)?;
            info!(path = %weights.display(), "Pre-trained weights loaded");
        } else {
            info!(model_dir = %model_dir.display(), "No model.safetensors found; using random initialisation");
        }
        Ok(model)
    }

    pub fn config(&self) -> &Gpt2Config {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.ctx.device
    }

    fn embed(&self, input_ids: &Tensor) -> CoreResult<Tensor> {
        let (_b, t) = input_ids.dims2()?;
        if t > self.config.n_positions {
            return Err(CoreError::SequenceTooLong { got: t, max: self.config.n_positions });
        }
        let positions = Tensor::arange(0u32, t as u32, &self.ctx.device)?;
        let tokens = self.wte.forward(input_ids)?;
        Ok(tokens.broadcast_add(&self.wpe.forward(&positions)?)?)
    }

    fn causal_mask(&self, t: usize) -> CoreResult<Tensor> {
        let mask: Vec<f32> = (0..t)
            .flat_map(|i| (0..t).map(move |j| if j > i { f32::NEG_INFINITY } else { 0.0 }))
            .collect();
        Ok(Tensor::from_vec(mask, (t, t), &self.ctx.device)?.to_dtype(self.ctx.dtype)?)
    }

    fn lm_head(&self, hidden: &Tensor) -> CoreResult<Tensor> {
        let normed = self.ln_f.forward(hidden)?;
        Ok(normed.broadcast_matmul(&self.wte.embeddings().t()?)?)
    }

    /// `[batch, seq, 1]` indicator of each example's first-output offset.
    fn offset_selector(&self, b: usize, t: usize, first_offsets: &[usize]) -> CoreResult<Tensor> {
        let mut sel = vec![0f32; b * t];
        for (row, &offset) in first_offsets.iter().enumerate() {
            sel[row * t + offset] = 1.0;
        }
        Ok(Tensor::from_vec(sel, (b, t, 1), &self.ctx.device)?.to_dtype(self.ctx.dtype)?)
    }
}

impl LatentModel for Gpt2Model {
    fn num_layers(&self) -> usize {
        self.config.n_layer
    }

    fn hidden_size(&self) -> usize {
        self.config.n_embd
    }

    fn vocab_size(&self) -> usize {
        self.config.vocab_size
    }

    fn trainable_vars(&self) -> Vec<Var> {
        self.varmap.all_vars()
    }

    fn forward_hidden(&self, input_ids: &Tensor) -> CoreResult<HiddenOutput> {
        let (_b, t) = input_ids.dims2()?;
        let mask = self.causal_mask(t)?;
        let mut h = self.embed(input_ids)?;
        let mut layer_states = Vec::with_capacity(self.blocks.len());
        for block in &self.blocks {
            layer_states.push(h.clone());
            h = block.forward(&h, &mask)?;
        }
        Ok(HiddenOutput { logits: self.lm_head(&h)?, layer_states })
    }

    fn forward_with_latents(
        &self,
        input_ids: &Tensor,
        latents: &[Tensor],
        first_offsets: &[usize],
    ) -> CoreResult<LatentOutput> {
        if latents.len() != self.blocks.len() {
            return Err(CoreError::LatentLayers { expected: self.blocks.len(), got: latents.len() });
        }
        let (b, t) = input_ids.dims2()?;
        if first_offsets.len() != b {
            return Err(CoreError::BatchMismatch { expected: b, got: first_offsets.len() });
        }
        if let Some(&offset) = first_offsets.iter().find(|&&o| o >= t) {
            return Err(CoreError::OffsetOutOfRange { offset, seq_len: t });
        }

        let mask = self.causal_mask(t)?;
        let select = self.offset_selector(b, t, first_offsets)?;
        let keep = select.affine(-1.0, 1.0)?;

        let mut h = self.embed(input_ids)?;
        let mut predicted_latents = Vec::with_capacity(self.blocks.len());
        for (block, z) in self.blocks.iter().zip(latents) {
            predicted_latents.push(select_positions(&h, first_offsets)?);
            let z = z.to_dtype(self.ctx.dtype)?.unsqueeze(1)?;
            h = (h.broadcast_mul(&keep)? + select.broadcast_mul(&z)?)?;
            h = block.forward(&h, &mask)?;
        }
        Ok(LatentOutput { logits: self.lm_head(&h)?, predicted_latents })
    }
}
