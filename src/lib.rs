// Pedantic clippy configuration for ML/math codebase
// These are acceptable in numerical/ML code:
#![allow(clippy::cast_precision_loss)] // usize→f64/f32 intentional in ML
#![allow(clippy::cast_possible_truncation)] // f64→usize in selection counts
#![allow(clippy::cast_sign_loss)] // f64→usize when value is known positive
#![allow(clippy::many_single_char_names)] // x, y, i, j standard in math
#![allow(clippy::similar_names)] // related variables like `t_cur`/`t_prev`
#![allow(clippy::module_name_repetitions)] // SendModel in model.rs is fine
// Documentation pedantic - acceptable for research code:
#![allow(clippy::doc_markdown)] // backticks for every technical term is excessive
#![allow(clippy::missing_errors_doc)] // # Errors section for every Result fn
#![allow(clippy::missing_panics_doc)] // # Panics section for every panic
// Method style pedantic:
#![allow(clippy::must_use_candidate)] // #[must_use] on every pure fn is excessive

//! SEND-rs: Sensitive-unit dropout during fine-tuning
//!
//! Fine-tunes a causal language model while periodically identifying and
//! zeroing the most sensitive hidden units of one feed-forward block, and
//! tracks a spectral representation-stability metric (the eigenscore)
//! across epochs.
//!
//! ## Architecture
//!
//! - `model`: SendModel wrapper for checkpoint loading and trainable state
//! - `forward_neox`: GPT-NeoX forward pass with hidden-state capture
//! - `cache`: per-layer hidden states from a forward pass
//! - `masks`: shared causal attention mask utilities
//! - `dataset`: text-column loading and deterministic splitting
//! - `collector`: embedding snapshot gathering and canonical-width padding
//! - `history`: bounded rolling history of per-epoch snapshots
//! - `sensitivity`: per-unit sensitivity scoring and top-k selection
//! - `suppression`: suppression window state machine and unit zeroing
//! - `spectral`: exact and stochastic-Chebyshev eigenscore estimators
//! - `metrics`: structured JSONL metrics sink
//! - `trainer`: epoch-loop orchestrator

pub mod cache;
pub mod collector;
pub mod dataset;
pub mod forward_neox;
pub mod history;
pub mod masks;
pub mod metrics;
pub mod model;
pub mod sensitivity;
pub mod spectral;
pub mod suppression;
pub mod trainer;

pub use cache::HiddenStateCache;
pub use collector::{collect_embeddings, pad_to_width, EmbeddingSnapshot};
pub use dataset::{DatasetSplits, TextDataset};
pub use forward_neox::{NeoxConfig, NeoxModel};
pub use history::EmbeddingHistory;
pub use masks::create_causal_mask;
pub use metrics::{MetricRecord, MetricsLogger};
pub use model::SendModel;
pub use sensitivity::{
    combined_sensitivity, net_change, net_variability, score_and_select, SensitivityMap,
};
pub use spectral::{EigenscoreEstimator, EstimatorMode, DEFAULT_ALPHA};
pub use suppression::{
    suppress_units, FeedForwardAccess, FeedForwardHandles, SuppressionController,
};
pub use trainer::{Trainer, TrainerConfig};
