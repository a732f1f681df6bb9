//! Training loop orchestrator
//!
//! Drives epochs and wires the components together at epoch boundaries:
//! suppression tick, train pass, tracking snapshot, periodic sensitivity
//! recompute, eigenscore evaluation. All mutable run state lives here and
//! is threaded explicitly; there is no ambient global state.

use anyhow::{Context, Result};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::{info, warn};

use crate::collector::collect_embeddings;
use crate::dataset::TextDataset;
use crate::history::EmbeddingHistory;
use crate::metrics::{MetricRecord, MetricsLogger};
use crate::model::SendModel;
use crate::sensitivity::score_and_select;
use crate::spectral::{EigenscoreEstimator, EstimatorMode, DEFAULT_ALPHA};
use crate::suppression::SuppressionController;

/// Configuration for a SEND training run
#[derive(Debug, Clone)]
pub struct TrainerConfig {
    /// HuggingFace model identifier
    pub model_id: String,
    /// Pythia checkpoint step (revision `step{N}`)
    pub checkpoint_step: u64,
    /// Number of training epochs
    pub epochs: usize,
    /// AdamW learning rate
    pub learning_rate: f64,
    /// Batch size (config echo only; the loop trains one text at a time)
    pub batch_size: usize,
    /// Token truncation length per text
    pub max_length: usize,
    /// Dataset row cap
    pub sample_cap: usize,
    /// Recompute cadence T: sensitivity runs every T epochs, and T is also
    /// the suppression window length
    pub epoch_threshold: usize,
    /// Rolling history depth W
    pub history_window: usize,
    /// Canonical embedding width snapshots are padded to
    pub canonical_width: usize,
    /// Forward passes per evaluation text for the eigenscore batch
    pub eval_passes: usize,
    /// Fraction of most-sensitive units to suppress
    pub top_k_fraction: f64,
    /// Eigenscore regularization constant
    pub alpha: f64,
    /// Chebyshev expansion order for the approximate estimator
    pub expansion_order: usize,
    /// Hutchinson probe count for the approximate estimator
    pub probe_count: usize,
    /// Directory holding `{dataset}.csv` files
    pub dataset_dir: String,
    /// JSONL metrics output path
    pub metrics_path: String,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            model_id: "EleutherAI/pythia-1B".to_string(),
            checkpoint_step: 143_000,
            epochs: 20,
            learning_rate: 1e-4,
            batch_size: 1,
            max_length: 512,
            sample_cap: 200,
            epoch_threshold: 3,
            history_window: 3,
            canonical_width: 2048,
            eval_passes: 10,
            top_k_fraction: 0.1,
            alpha: DEFAULT_ALPHA,
            expansion_order: 20,
            probe_count: 20,
            dataset_dir: "data".to_string(),
            metrics_path: "metrics.jsonl".to_string(),
        }
    }
}

/// Epoch-loop driver owning the run's mutable state
pub struct Trainer {
    config: TrainerConfig,
    model: SendModel,
    metrics: MetricsLogger,
    history: EmbeddingHistory,
    suppression: SuppressionController,
    estimator: EigenscoreEstimator,
    rng: StdRng,
}

impl Trainer {
    pub fn new(model: SendModel, config: TrainerConfig, metrics: MetricsLogger) -> Self {
        let history = EmbeddingHistory::new(config.history_window);
        let suppression = SuppressionController::new(config.epoch_threshold);
        let estimator = EigenscoreEstimator {
            alpha: config.alpha,
            expansion_order: config.expansion_order,
            probe_count: config.probe_count,
        };
        Self {
            config,
            model,
            metrics,
            history,
            suppression,
            estimator,
            rng: StdRng::from_entropy(),
        }
    }

    /// Run the full training loop over the dataset
    pub fn run(&mut self, dataset: &TextDataset) -> Result<()> {
        let splits = dataset.split();
        info!(
            "Split: {} train, {} tracking, {} evaluation",
            splits.train.len(),
            splits.tracking.len(),
            splits.evaluation.len()
        );
        anyhow::ensure!(
            !splits.train.is_empty() && !splits.tracking.is_empty() && !splits.evaluation.is_empty(),
            "dataset too small: every split needs at least one text"
        );

        self.metrics.log(&MetricRecord::Config {
            model_id: self.model.model_id(),
            revision: self.model.revision(),
            epochs: self.config.epochs,
            batch_size: self.config.batch_size,
            learning_rate: self.config.learning_rate,
            top_k_fraction: self.config.top_k_fraction,
            epoch_threshold: self.config.epoch_threshold,
            dataset_size: splits.train.len() + splits.tracking.len(),
            device: self.model.device_name(),
        })?;

        let mut optimizer = AdamW::new(
            self.model.trainable_vars(),
            ParamsAdamW {
                lr: self.config.learning_rate,
                ..Default::default()
            },
        )?;
        let block = self.model.suppression_block();

        for epoch in 0..self.config.epochs {
            // Re-apply the active unit set while its window is open
            if let Some((count, remaining)) = self.suppression.tick(&self.model, block)? {
                self.metrics.log(&MetricRecord::SensitiveUnits {
                    epoch: epoch + 1,
                    count,
                    remaining,
                })?;
            }

            let epoch_loss = self.train_epoch(&mut optimizer, &splits.train, epoch)?;
            info!(
                epoch = epoch + 1,
                total = self.config.epochs,
                loss = epoch_loss,
                "epoch complete"
            );
            self.metrics.log(&MetricRecord::EpochLoss {
                epoch: epoch + 1,
                loss: epoch_loss,
            })?;

            // Tracking snapshot into the rolling history
            let snapshot = collect_embeddings(
                &self.model,
                &splits.tracking,
                1,
                self.config.canonical_width,
                self.config.max_length,
            )?;
            self.history.push(snapshot);

            // Periodic recompute: score the most recent T snapshots and open
            // a fresh suppression window
            if (epoch + 1) % self.config.epoch_threshold == 0 {
                let recent = self.history.recent(self.config.epoch_threshold);
                let map = score_and_select(&recent, self.config.top_k_fraction)?;
                self.metrics.log(&MetricRecord::SensitiveUnits {
                    epoch: epoch + 1,
                    count: map.len(),
                    remaining: self.config.epoch_threshold,
                })?;
                self.suppression.install(map);
            }

            // Representation-drift metric over the held-out set
            let eval_batch = collect_embeddings(
                &self.model,
                &splits.evaluation,
                self.config.eval_passes,
                self.config.canonical_width,
                self.config.max_length,
            )?;
            let eigenscore = self.estimator.estimate(
                eval_batch.data(),
                EstimatorMode::Approximate,
                &mut self.rng,
            )?;
            self.metrics.log(&MetricRecord::Eigenscore {
                epoch: epoch + 1,
                average_eigenscore: eigenscore,
            })?;
        }

        info!("training complete");
        Ok(())
    }

    /// One shuffled pass over the training split. Returns the mean batch loss.
    fn train_epoch(
        &mut self,
        optimizer: &mut AdamW,
        train_texts: &[String],
        epoch: usize,
    ) -> Result<f64> {
        let mut running_loss = 0.0;
        let mut batches = 0usize;

        let mut order: Vec<usize> = (0..train_texts.len()).collect();
        order.shuffle(&mut self.rng);

        for (i, &sample) in order.iter().enumerate() {
            let input_ids = self
                .model
                .encode_text(&train_texts[sample], self.config.max_length)
                .with_context(|| format!("failed to tokenize training text {sample}"))?;
            if input_ids.dim(1)? < 2 {
                warn!(batch = i, "skipping text with fewer than two tokens");
                continue;
            }

            let loss = self.model.forward_loss(&input_ids)?;
            optimizer.backward_step(&loss)?;

            let loss_value = f64::from(loss.to_scalar::<f32>()?);
            running_loss += loss_value;
            batches += 1;
            self.metrics.log(&MetricRecord::BatchLoss {
                epoch: epoch + 1,
                batch: i,
                loss: loss_value,
            })?;
        }

        Ok(running_loss / batches.max(1) as f64)
    }
}
