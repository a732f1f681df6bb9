//! GPT-NeoX forward pass with per-layer hidden state capture
//!
//! Custom implementation that runs layer-by-layer so tracking passes can
//! capture the residual stream at every layer boundary. Parameters are
//! built through a `VarMap`-backed `VarBuilder`, which keeps them trainable
//! and lets the suppression path overwrite feed-forward rows in place.
//!
//! Based on the GPT-NeoX architecture as shipped by the Pythia suite:
//! fused QKV attention with partial rotary embeddings (rotate-half
//! convention), LayerNorm with bias, parallel residual blocks, untied
//! output head.

use anyhow::{Context, Result};
use candle_core::{DType, Device, IndexOp, Module, Tensor, D};
use candle_nn::{embedding, layer_norm, linear, linear_no_bias, Embedding, LayerNorm, Linear, VarBuilder};
use serde::Deserialize;

use crate::cache::HiddenStateCache;
use crate::masks::create_causal_mask;

/// Model configuration (matches HuggingFace config.json for GPT-NeoX)
#[derive(Debug, Clone, Deserialize)]
pub struct NeoxConfig {
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_attention_heads: usize,
    pub num_hidden_layers: usize,
    pub vocab_size: usize,
    #[serde(default = "default_rotary_pct")]
    pub rotary_pct: f64,
    #[serde(default = "default_rotary_emb_base")]
    pub rotary_emb_base: f64,
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,
    #[serde(default = "default_use_parallel_residual")]
    pub use_parallel_residual: bool,
    #[serde(default)]
    pub eos_token_id: u32,
}

fn default_rotary_pct() -> f64 {
    0.25
}

fn default_rotary_emb_base() -> f64 {
    10_000.0
}

fn default_layer_norm_eps() -> f64 {
    1e-5
}

fn default_max_position_embeddings() -> usize {
    2048
}

fn default_use_parallel_residual() -> bool {
    true
}

impl NeoxConfig {
    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }

    /// Number of leading head dimensions rotary embeddings apply to
    pub fn rotary_ndims(&self) -> usize {
        (self.head_dim() as f64 * self.rotary_pct) as usize
    }
}

/// Rotary Position Embeddings, rotate-half convention
struct RotaryEmbedding {
    cos: Tensor,
    sin: Tensor,
    rotary_ndims: usize,
}

impl RotaryEmbedding {
    fn new(
        rotary_ndims: usize,
        max_seq_len: usize,
        base: f64,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        anyhow::ensure!(
            rotary_ndims % 2 == 0,
            "rotary dimension count must be even, got {rotary_ndims}"
        );
        let inv_freq: Vec<f64> = (0..rotary_ndims)
            .step_by(2)
            .map(|i| 1.0 / base.powf(i as f64 / rotary_ndims as f64))
            .collect();
        let inv_freq = Tensor::new(inv_freq, device)?.to_dtype(dtype)?;

        let positions: Vec<f64> = (0..max_seq_len).map(|i| i as f64).collect();
        let positions = Tensor::new(positions, device)?.to_dtype(dtype)?;

        // [seq_len, rotary_ndims]: frequencies duplicated across both halves
        let freqs = positions.unsqueeze(1)?.matmul(&inv_freq.unsqueeze(0)?)?;
        let emb = Tensor::cat(&[&freqs, &freqs], D::Minus1)?;

        Ok(Self {
            cos: emb.cos()?,
            sin: emb.sin()?,
            rotary_ndims,
        })
    }

    fn apply(&self, q: &Tensor, k: &Tensor) -> Result<(Tensor, Tensor)> {
        let seq_len = q.dim(2)?;
        let cos = self.cos.i(..seq_len)?.unsqueeze(0)?.unsqueeze(0)?;
        let sin = self.sin.i(..seq_len)?.unsqueeze(0)?.unsqueeze(0)?;
        Ok((
            rope_neox(q, &cos, &sin, self.rotary_ndims)?,
            rope_neox(k, &cos, &sin, self.rotary_ndims)?,
        ))
    }
}

/// Rotate the leading `rotary_ndims` of each head, pass the rest through
fn rope_neox(x: &Tensor, cos: &Tensor, sin: &Tensor, rotary_ndims: usize) -> Result<Tensor> {
    let head_dim = x.dim(D::Minus1)?;
    let x_rot = x.narrow(D::Minus1, 0, rotary_ndims)?;

    let half = rotary_ndims / 2;
    let x1 = x_rot.narrow(D::Minus1, 0, half)?;
    let x2 = x_rot.narrow(D::Minus1, half, half)?;
    let rotated = Tensor::cat(&[&x2.neg()?, &x1], D::Minus1)?;

    let out = (x_rot.broadcast_mul(cos)? + rotated.broadcast_mul(sin)?)?;
    if head_dim == rotary_ndims {
        Ok(out)
    } else {
        let x_pass = x.narrow(D::Minus1, rotary_ndims, head_dim - rotary_ndims)?;
        Ok(Tensor::cat(&[&out, &x_pass], D::Minus1)?)
    }
}

/// Multi-head attention with a fused QKV projection
struct Attention {
    query_key_value: Linear,
    dense: Linear,
    num_heads: usize,
    head_dim: usize,
}

impl Attention {
    fn load(vb: VarBuilder, config: &NeoxConfig) -> Result<Self> {
        let hidden = config.hidden_size;
        // QKV and output projections both carry biases in GPT-NeoX
        let query_key_value = linear(hidden, 3 * hidden, vb.pp("query_key_value"))?;
        let dense = linear(hidden, hidden, vb.pp("dense"))?;

        Ok(Self {
            query_key_value,
            dense,
            num_heads: config.num_attention_heads,
            head_dim: config.head_dim(),
        })
    }

    fn forward(&self, x: &Tensor, rotary: &RotaryEmbedding, mask: &Tensor) -> Result<Tensor> {
        let (b, seq_len, _) = x.dims3()?;

        // Fused projection, then per-head [q | k | v] split
        let qkv = self.query_key_value.forward(x)?;
        let qkv = qkv.reshape((b, seq_len, self.num_heads, 3 * self.head_dim))?;
        let q = qkv
            .narrow(D::Minus1, 0, self.head_dim)?
            .transpose(1, 2)?
            .contiguous()?;
        let k = qkv
            .narrow(D::Minus1, self.head_dim, self.head_dim)?
            .transpose(1, 2)?
            .contiguous()?;
        let v = qkv
            .narrow(D::Minus1, 2 * self.head_dim, self.head_dim)?
            .transpose(1, 2)?
            .contiguous()?;

        let (q, k) = rotary.apply(&q, &k)?;

        // Scaled dot-product attention
        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let attn_weights = (q.matmul(&k.transpose(2, 3)?)? * scale)?;
        let attn_weights = attn_weights.broadcast_add(mask)?;
        let attn_weights = candle_nn::ops::softmax_last_dim(&attn_weights)?;
        let attn_output = attn_weights.matmul(&v)?;

        // Reshape back
        let attn_output = attn_output.transpose(1, 2)?.reshape((b, seq_len, ()))?;
        Ok(self.dense.forward(&attn_output)?)
    }
}

/// Feed-forward block (expansion, GELU, projection)
struct Mlp {
    dense_h_to_4h: Linear,
    dense_4h_to_h: Linear,
}

impl Mlp {
    fn load(vb: VarBuilder, config: &NeoxConfig) -> Result<Self> {
        let dense_h_to_4h = linear(
            config.hidden_size,
            config.intermediate_size,
            vb.pp("dense_h_to_4h"),
        )?;
        let dense_4h_to_h = linear(
            config.intermediate_size,
            config.hidden_size,
            vb.pp("dense_4h_to_h"),
        )?;
        Ok(Self {
            dense_h_to_4h,
            dense_4h_to_h,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let hidden = self.dense_h_to_4h.forward(x)?.gelu_erf()?;
        Ok(self.dense_4h_to_h.forward(&hidden)?)
    }
}

/// One transformer block
struct Block {
    input_layernorm: LayerNorm,
    post_attention_layernorm: LayerNorm,
    attention: Attention,
    mlp: Mlp,
    use_parallel_residual: bool,
}

impl Block {
    fn load(vb: VarBuilder, config: &NeoxConfig) -> Result<Self> {
        let input_layernorm = layer_norm(
            config.hidden_size,
            config.layer_norm_eps,
            vb.pp("input_layernorm"),
        )?;
        let post_attention_layernorm = layer_norm(
            config.hidden_size,
            config.layer_norm_eps,
            vb.pp("post_attention_layernorm"),
        )?;
        let attention = Attention::load(vb.pp("attention"), config)?;
        let mlp = Mlp::load(vb.pp("mlp"), config)?;

        Ok(Self {
            input_layernorm,
            post_attention_layernorm,
            attention,
            mlp,
            use_parallel_residual: config.use_parallel_residual,
        })
    }

    fn forward(&self, x: &Tensor, rotary: &RotaryEmbedding, mask: &Tensor) -> Result<Tensor> {
        let attn_out =
            self.attention
                .forward(&self.input_layernorm.forward(x)?, rotary, mask)?;

        if self.use_parallel_residual {
            // x + attn(ln1(x)) + mlp(ln2(x))
            let mlp_out = self
                .mlp
                .forward(&self.post_attention_layernorm.forward(x)?)?;
            Ok(((x + attn_out)? + mlp_out)?)
        } else {
            let x = (x + attn_out)?;
            let mlp_out = self
                .mlp
                .forward(&self.post_attention_layernorm.forward(&x)?)?;
            Ok((x + mlp_out)?)
        }
    }
}

/// GPT-NeoX model with hidden-state capture
pub struct NeoxModel {
    embed_in: Embedding,
    layers: Vec<Block>,
    final_layer_norm: LayerNorm,
    embed_out: Linear,
    rotary: RotaryEmbedding,
}

impl NeoxModel {
    /// Build the module tree under the standard GPT-NeoX parameter paths
    /// (`gpt_neox.*` trunk, `embed_out` head).
    pub fn load(vb: VarBuilder, config: &NeoxConfig, device: &Device) -> Result<Self> {
        anyhow::ensure!(
            config.num_hidden_layers >= 2,
            "need at least two transformer blocks to target the second-to-last one"
        );

        let trunk = vb.pp("gpt_neox");
        let embed_in = embedding(config.vocab_size, config.hidden_size, trunk.pp("embed_in"))
            .context("Failed to build embed_in")?;

        let mut layers = Vec::with_capacity(config.num_hidden_layers);
        for i in 0..config.num_hidden_layers {
            layers.push(Block::load(trunk.pp(format!("layers.{i}")), config)?);
        }

        let final_layer_norm = layer_norm(
            config.hidden_size,
            config.layer_norm_eps,
            trunk.pp("final_layer_norm"),
        )?;
        let embed_out = linear_no_bias(config.hidden_size, config.vocab_size, vb.pp("embed_out"))?;

        let rotary = RotaryEmbedding::new(
            config.rotary_ndims(),
            config.max_position_embeddings,
            config.rotary_emb_base,
            device,
            DType::F32,
        )?;

        Ok(Self {
            embed_in,
            layers,
            final_layer_norm,
            embed_out,
            rotary,
        })
    }

    pub fn n_layers(&self) -> usize {
        self.layers.len()
    }

    /// Full forward pass to logits, shape `(batch, seq_len, vocab)`
    pub fn forward(&self, input_ids: &Tensor) -> Result<Tensor> {
        let (_b, seq_len) = input_ids.dims2()?;
        let mask = create_causal_mask(seq_len, input_ids.device(), DType::F32)?;

        let mut x = self.embed_in.forward(input_ids)?;
        for layer in &self.layers {
            x = layer.forward(&x, &self.rotary, &mask)?;
        }
        let x = self.final_layer_norm.forward(&x)?;
        Ok(self.embed_out.forward(&x)?)
    }

    /// Forward pass capturing the residual stream at every layer boundary.
    ///
    /// Entry 0 is the embedding output; entry `i` is the output of block
    /// `i - 1` (pre final-norm). Skips the output head: tracking passes
    /// only need hidden states.
    pub fn hidden_states(&self, input_ids: &Tensor) -> Result<HiddenStateCache> {
        let (_b, seq_len) = input_ids.dims2()?;
        let mask = create_causal_mask(seq_len, input_ids.device(), DType::F32)?;

        let mut cache = HiddenStateCache::with_capacity(self.layers.len() + 1);
        let mut x = self.embed_in.forward(input_ids)?;
        cache.push(x.i(0)?);
        for layer in &self.layers {
            x = layer.forward(&x, &self.rotary, &mask)?;
            cache.push(x.i(0)?);
        }
        Ok(cache)
    }
}
