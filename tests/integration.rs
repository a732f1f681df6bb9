//! Integration tests for SEND-rs
//!
//! Note: Tests marked with #[ignore] require GPU and model download.
//! Run them explicitly with: cargo test -- --ignored

use send_rs::{
    score_and_select, EmbeddingHistory, EmbeddingSnapshot, SuppressionController, TextDataset,
    TrainerConfig,
};
use std::io::Write;
use tempfile::NamedTempFile;

/// Test CSV loading with quoting edge cases
#[test]
fn test_dataset_loading() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "id,texts").unwrap();
    writeln!(file, "1,plain text").unwrap();
    writeln!(file, "2,\"with, a comma\"").unwrap();
    writeln!(file, "3,\"multi\nline\"").unwrap();
    writeln!(file, "4,\"escaped \"\"quote\"\"\"").unwrap();

    let dataset = TextDataset::load(file.path(), "texts", 200).unwrap();
    assert_eq!(dataset.len(), 4);
    assert_eq!(dataset.texts()[0], "plain text");
    assert_eq!(dataset.texts()[1], "with, a comma");
    assert_eq!(dataset.texts()[2], "multi\nline");
    assert_eq!(dataset.texts()[3], "escaped \"quote\"");
}

/// Test the row cap is applied after column extraction
#[test]
fn test_dataset_sample_cap() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "texts").unwrap();
    for i in 0..50 {
        writeln!(file, "sample {i}").unwrap();
    }

    let dataset = TextDataset::load(file.path(), "texts", 10).unwrap();
    assert_eq!(dataset.len(), 10);
    assert_eq!(dataset.texts()[9], "sample 9");
}

/// Missing column is a hard error
#[test]
fn test_dataset_missing_column() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "other").unwrap();
    writeln!(file, "row").unwrap();

    assert!(TextDataset::load(file.path(), "texts", 10).is_err());
}

/// Test 80/10/10 positional split on a full-size corpus
#[test]
fn test_split_proportions() {
    let dataset = TextDataset::from_texts((0..200).map(|i| format!("t{i}")).collect());
    let splits = dataset.split();
    assert_eq!(splits.train.len(), 160);
    assert_eq!(splits.tracking.len(), 20);
    assert_eq!(splits.evaluation.len(), 20);
    // Positional slicing: the head of the file trains
    assert_eq!(splits.train[0], "t0");
    assert_eq!(splits.tracking[0], "t160");
    assert_eq!(splits.evaluation[0], "t180");
}

/// Test trainer config defaults
#[test]
fn test_trainer_config_defaults() {
    let config = TrainerConfig::default();
    assert_eq!(config.model_id, "EleutherAI/pythia-1B");
    assert_eq!(config.checkpoint_step, 143_000);
    assert_eq!(config.sample_cap, 200);
    assert_eq!(config.max_length, 512);
    assert_eq!(config.batch_size, 1);
}

/// Scoring plus suppression wired together: history window of 3, eight
/// units, k = 0.25 selects two units, and a window of 3 ticks expires.
#[test]
fn test_selection_feeds_suppression_lifecycle() {
    let mut history = EmbeddingHistory::new(3);
    for epoch in 0..3 {
        let mut rows = vec![vec![0.0; 8]; 4];
        for (r, row) in rows.iter_mut().enumerate() {
            // Unit 3 moves most, unit 5 second; the rest stay flat
            row[3] = (r * r) as f64 * 10.0 + epoch as f64;
            row[5] = r as f64 + epoch as f64;
        }
        history.push(EmbeddingSnapshot::from_rows(rows, 8).unwrap());
    }

    let map = score_and_select(&history.recent(3), 0.25).unwrap();
    assert_eq!(map.len(), 2);
    assert_eq!(map.indices(), vec![3, 5]);

    let mut controller = SuppressionController::new(3);
    controller.install(map);
    assert_eq!(controller.remaining(), 3);
}

/// GPU-dependent test: checkpoint loading
#[test]
#[ignore = "requires GPU and model download"]
fn test_model_loading() {
    use send_rs::SendModel;

    let model = SendModel::from_pretrained("EleutherAI/pythia-1B", 143_000).unwrap();
    assert_eq!(model.n_layers(), 16);
    assert_eq!(model.hidden_size(), 2048);
    assert_eq!(model.suppression_block(), 14);
}

/// GPU-dependent test: tracked embedding extraction
#[test]
#[ignore = "requires GPU and model download"]
fn test_hidden_embedding_extraction() {
    use send_rs::SendModel;

    let model = SendModel::from_pretrained("EleutherAI/pythia-1B", 143_000).unwrap();
    let embedding = model
        .hidden_embedding("The patient presented with acute symptoms.", 512)
        .unwrap();
    assert_eq!(embedding.len(), 2048);
}
