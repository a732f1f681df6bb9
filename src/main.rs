//! SEND-rs CLI: sensitive-unit dropout fine-tuning with eigenscore tracking

use anyhow::Result;
use clap::Parser;
use send_rs::{MetricsLogger, SendModel, TextDataset, Trainer, TrainerConfig};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "send-rs")]
#[command(about = "Fine-tune a model while suppressing its most sensitive hidden units")]
#[command(version)]
struct Cli {
    /// Dataset name: reads data/{name}.csv, `texts` column
    dataset_name: String,

    /// Fraction of top sensitive units to suppress, in (0, 1]
    k: f64,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = TrainerConfig {
        top_k_fraction: cli.k,
        metrics_path: format!("send-{}-metrics.jsonl", cli.dataset_name),
        ..TrainerConfig::default()
    };

    println!("=== SEND-rs: sensitive-unit dropout training ===");
    println!("Model:   {} @ step{}", config.model_id, config.checkpoint_step);
    println!("Dataset: {}/{}.csv", config.dataset_dir, cli.dataset_name);
    println!("Top-k:   {}", cli.k);

    let dataset_path = format!("{}/{}.csv", config.dataset_dir, cli.dataset_name);
    let dataset = TextDataset::load(&dataset_path, "texts", config.sample_cap)?;
    info!(samples = dataset.len(), "dataset loaded");

    let model = SendModel::from_pretrained(&config.model_id, config.checkpoint_step)?;
    let metrics = MetricsLogger::create(&config.metrics_path)?;

    let mut trainer = Trainer::new(model, config, metrics);
    trainer.run(&dataset)?;

    println!("Training complete!");
    Ok(())
}
