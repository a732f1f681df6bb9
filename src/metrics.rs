//! Structured metrics sink for training telemetry
//!
//! One JSON object per line, mirrored to the tracing log. The run-level
//! config is echoed once at start; batch/epoch records stream during
//! training.

use anyhow::{Context, Result};
use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::debug;

/// A single telemetry record
#[derive(Debug, Serialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum MetricRecord<'a> {
    /// Run-level configuration echo
    Config {
        model_id: &'a str,
        revision: &'a str,
        epochs: usize,
        batch_size: usize,
        learning_rate: f64,
        top_k_fraction: f64,
        epoch_threshold: usize,
        dataset_size: usize,
        device: &'a str,
    },
    BatchLoss {
        epoch: usize,
        batch: usize,
        loss: f64,
    },
    EpochLoss {
        epoch: usize,
        loss: f64,
    },
    /// Sensitive unit count plus suppression epochs remaining
    SensitiveUnits {
        epoch: usize,
        count: usize,
        remaining: usize,
    },
    Eigenscore {
        epoch: usize,
        average_eigenscore: f64,
    },
}

/// Append-only JSONL writer
pub struct MetricsLogger {
    writer: BufWriter<File>,
}

impl MetricsLogger {
    /// Create (truncating) the metrics file at `path`
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::create(path)
            .with_context(|| format!("Failed to create metrics file {}", path.display()))?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }

    /// Serialize one record as a JSON line and flush it
    pub fn log(&mut self, record: &MetricRecord) -> Result<()> {
        let line = serde_json::to_string(record)?;
        debug!(target: "metrics", "{line}");
        writeln!(self.writer, "{line}")?;
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn test_records_written_as_json_lines() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let mut logger = MetricsLogger::create(file.path()).unwrap();

        logger
            .log(&MetricRecord::EpochLoss {
                epoch: 1,
                loss: 2.5,
            })
            .unwrap();
        logger
            .log(&MetricRecord::SensitiveUnits {
                epoch: 1,
                count: 12,
                remaining: 2,
            })
            .unwrap();

        let mut content = String::new();
        File::open(file.path())
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["record"], "epoch_loss");
        assert_eq!(first["loss"], 2.5);

        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["record"], "sensitive_units");
        assert_eq!(second["count"], 12);
        assert_eq!(second["remaining"], 2);
    }
}
