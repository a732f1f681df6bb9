//! SendModel wrapper: device selection, checkpoint loading, trainable state
//!
//! Loads a revision-pinned Pythia checkpoint from HuggingFace into a
//! `VarMap` so the optimizer can update the weights and the suppression
//! path can overwrite feed-forward rows in place.

use anyhow::{anyhow, Context, Result};
use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{VarBuilder, VarMap};
use hf_hub::{api::sync::Api, Repo, RepoType};
use tokenizers::{PaddingParams, Tokenizer};
use tracing::{info, warn};

use crate::forward_neox::{NeoxConfig, NeoxModel};
use crate::suppression::{FeedForwardAccess, FeedForwardHandles};

/// High-level model wrapper for SEND training runs
pub struct SendModel {
    model: NeoxModel,
    tokenizer: Tokenizer,
    varmap: VarMap,
    device: Device,
    config: NeoxConfig,
    model_id: String,
    revision: String,
}

impl SendModel {
    /// Load a model from HuggingFace at a Pythia checkpoint step
    /// (revision `step{N}`). Tries CUDA, falls back to CPU.
    pub fn from_pretrained(model_id: &str, checkpoint_step: u64) -> Result<Self> {
        let revision = format!("step{checkpoint_step}");

        let device = match Device::cuda_if_available(0) {
            Ok(dev) if dev.is_cuda() => {
                info!("Using CUDA device");
                dev
            }
            _ => {
                // Surfaced rather than silent: the run proceeds, just slower
                warn!("CUDA not available, falling back to CPU");
                Device::Cpu
            }
        };

        info!("Loading model: {} @ {}", model_id, revision);
        let api = Api::new()?;
        let repo = api.repo(Repo::with_revision(
            model_id.to_string(),
            RepoType::Model,
            revision.clone(),
        ));

        let tokenizer_path = repo
            .get("tokenizer.json")
            .context("Failed to download tokenizer.json")?;
        let mut tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| anyhow!("Tokenizer error: {e}"))?;

        let config_path = repo
            .get("config.json")
            .context("Failed to download config.json")?;
        let config: NeoxConfig = serde_json::from_str(&std::fs::read_to_string(&config_path)?)
            .context("Failed to parse model config")?;

        // The tokenizer pads with its end-of-sequence token
        if let Some(eos) = tokenizer.id_to_token(config.eos_token_id) {
            tokenizer.with_padding(Some(PaddingParams {
                pad_id: config.eos_token_id,
                pad_token: eos,
                ..Default::default()
            }));
        }

        // Build the module tree over a VarMap, then fill it from the
        // checkpoint so every parameter stays trainable.
        let mut varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = NeoxModel::load(vb, &config, &device)?;

        let weights_path = repo
            .get("model.safetensors")
            .context("Failed to download model.safetensors")?;
        varmap
            .load(&weights_path)
            .context("Failed to load checkpoint weights")?;

        info!(
            "Model ready: {} layers, {} hidden",
            config.num_hidden_layers, config.hidden_size
        );

        Ok(Self {
            model,
            tokenizer,
            varmap,
            device,
            config,
            model_id: model_id.to_string(),
            revision,
        })
    }

    pub fn n_layers(&self) -> usize {
        self.config.num_hidden_layers
    }

    pub fn hidden_size(&self) -> usize {
        self.config.hidden_size
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn device_name(&self) -> &'static str {
        match self.device {
            Device::Cpu => "cpu",
            Device::Cuda(_) => "cuda",
            Device::Metal(_) => "metal",
        }
    }

    pub fn config(&self) -> &NeoxConfig {
        &self.config
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn revision(&self) -> &str {
        &self.revision
    }

    /// The feed-forward block suppression targets: second-to-last
    pub fn suppression_block(&self) -> usize {
        self.config.num_hidden_layers - 2
    }

    /// All trainable parameters, for the optimizer
    pub fn trainable_vars(&self) -> Vec<Var> {
        self.varmap.all_vars()
    }

    /// Tokenize one text, truncating to `max_length` tokens.
    ///
    /// Returns shape `(1, seq_len)`.
    pub fn encode_text(&self, text: &str, max_length: usize) -> Result<Tensor> {
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| anyhow!("Tokenizer error: {e}"))?;
        let mut ids = encoding.get_ids().to_vec();
        ids.truncate(max_length);
        anyhow::ensure!(!ids.is_empty(), "text produced no tokens");
        let len = ids.len();
        Ok(Tensor::from_vec(ids, (1, len), &self.device)?)
    }

    /// Next-token cross-entropy loss over one tokenized text
    pub fn forward_loss(&self, input_ids: &Tensor) -> Result<Tensor> {
        let seq_len = input_ids.dim(1)?;
        anyhow::ensure!(seq_len >= 2, "need at least two tokens for next-token loss");

        let logits = self.model.forward(input_ids)?;
        let vocab = logits.dim(2)?;
        let preds = logits.narrow(1, 0, seq_len - 1)?.reshape((seq_len - 1, vocab))?;
        let targets = input_ids.narrow(1, 1, seq_len - 1)?.reshape((seq_len - 1,))?;
        Ok(candle_nn::loss::cross_entropy(&preds, &targets)?)
    }

    /// The tracked embedding for one text: second-to-last layer's hidden
    /// state at the second-to-last token position.
    pub fn hidden_embedding(&self, text: &str, max_length: usize) -> Result<Vec<f64>> {
        let input_ids = self.encode_text(text, max_length)?;
        let seq_len = input_ids.dim(1)?;
        anyhow::ensure!(
            seq_len >= 2,
            "text tokenizes to fewer than two tokens; no second-to-last position"
        );

        let cache = self.model.hidden_states(&input_ids)?;
        let layer = cache.len() - 2;
        let position = seq_len - 2;
        let values: Vec<f32> = cache
            .position(layer, position)?
            .to_dtype(DType::F32)?
            .to_vec1()?;
        Ok(values.into_iter().map(f64::from).collect())
    }

    fn var(&self, name: &str) -> Result<Var> {
        let data = self
            .varmap
            .data()
            .lock()
            .map_err(|_| anyhow!("parameter table poisoned"))?;
        data.get(name)
            .cloned()
            .ok_or_else(|| anyhow!("parameter {name} not found"))
    }
}

impl FeedForwardAccess for SendModel {
    fn feed_forward(&self, block: usize) -> Result<FeedForwardHandles> {
        anyhow::ensure!(
            block < self.config.num_hidden_layers,
            "block {block} out of range ({} layers)",
            self.config.num_hidden_layers
        );
        let prefix = format!("gpt_neox.layers.{block}.mlp");
        Ok(FeedForwardHandles {
            expand_weight: self.var(&format!("{prefix}.dense_h_to_4h.weight"))?,
            expand_bias: self.var(&format!("{prefix}.dense_h_to_4h.bias"))?,
            project_weight: self.var(&format!("{prefix}.dense_4h_to_h.weight"))?,
            project_bias: self.var(&format!("{prefix}.dense_4h_to_h.bias"))?,
        })
    }
}
