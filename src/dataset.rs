//! Text dataset loading for SEND fine-tuning runs

use anyhow::{anyhow, Context, Result};
use std::path::Path;
use tracing::warn;

/// A text corpus loaded from one column of a CSV file
#[derive(Debug, Clone)]
pub struct TextDataset {
    texts: Vec<String>,
}

/// Deterministic positional split into training / tracking / evaluation subsets
#[derive(Debug, Clone)]
pub struct DatasetSplits {
    /// 80% head: fine-tuning set
    pub train: Vec<String>,
    /// next 10%: tracked for sensitivity scoring
    pub tracking: Vec<String>,
    /// final 10%: held out for eigenscore evaluation
    pub evaluation: Vec<String>,
}

impl TextDataset {
    /// Load a dataset from a CSV file, taking the named column and truncating
    /// to `cap` rows.
    pub fn load(path: impl AsRef<Path>, column: &str, cap: usize) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read dataset file {}", path.display()))?;
        let records = parse_records(&content);

        let header = records
            .first()
            .ok_or_else(|| anyhow!("dataset file {} is empty", path.display()))?;
        let col = header
            .iter()
            .position(|h| h == column)
            .ok_or_else(|| anyhow!("column '{column}' not found in {}", path.display()))?;

        let mut skipped = 0usize;
        let texts: Vec<String> = records[1..]
            .iter()
            .filter(|record| {
                let ok = record.len() > col;
                if !ok {
                    skipped += 1;
                }
                ok
            })
            .map(|record| record[col].clone())
            .take(cap)
            .collect();
        if skipped > 0 {
            warn!(skipped, "dropped rows missing the '{column}' column");
        }

        Ok(Self { texts })
    }

    /// Build a dataset directly from in-memory texts
    pub fn from_texts(texts: Vec<String>) -> Self {
        Self { texts }
    }

    /// Split 80/10/10 by position. No shuffling: the cut points are
    /// `floor(0.8 n)` and `floor(0.9 n)` into the file's row order.
    pub fn split(&self) -> DatasetSplits {
        let n = self.texts.len();
        let train_end = (0.8 * n as f64) as usize;
        let tracking_end = (0.9 * n as f64) as usize;

        DatasetSplits {
            train: self.texts[..train_end].to_vec(),
            tracking: self.texts[train_end..tracking_end].to_vec(),
            evaluation: self.texts[tracking_end..].to_vec(),
        }
    }

    /// Total number of samples
    pub fn len(&self) -> usize {
        self.texts.len()
    }

    /// Check if the dataset is empty
    pub fn is_empty(&self) -> bool {
        self.texts.is_empty()
    }

    /// Get all texts
    pub fn texts(&self) -> &[String] {
        &self.texts
    }
}

/// Minimal RFC 4180 record parser: quoted fields, doubled-quote escapes,
/// newlines inside quotes, CRLF line endings.
fn parse_records(content: &str) -> Vec<Vec<String>> {
    let mut records = Vec::new();
    let mut record = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;

    let mut chars = content.chars().peekable();
    while let Some(c) = chars.next() {
        if in_quotes {
            if c == '"' {
                if chars.peek() == Some(&'"') {
                    chars.next();
                    field.push('"');
                } else {
                    in_quotes = false;
                }
            } else {
                field.push(c);
            }
        } else {
            match c {
                '"' => in_quotes = true,
                ',' => record.push(std::mem::take(&mut field)),
                '\r' => {}
                '\n' => {
                    record.push(std::mem::take(&mut field));
                    records.push(std::mem::take(&mut record));
                }
                _ => field.push(c),
            }
        }
    }
    if !field.is_empty() || !record.is_empty() {
        record.push(field);
        records.push(record);
    }

    records
}
