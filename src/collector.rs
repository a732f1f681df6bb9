//! Embedding collection over tracking and evaluation texts
//!
//! Gathers one hidden-state vector per forward pass (second-to-last layer,
//! second-to-last token) and stacks them into an [`EmbeddingSnapshot`],
//! padded up to the canonical width.

use anyhow::Result;
use ndarray::{s, Array2};

use crate::model::SendModel;

/// One epoch's worth of tracked embeddings: rows = samples, columns = units.
///
/// Immutable after creation; owned by the rolling history.
#[derive(Debug, Clone)]
pub struct EmbeddingSnapshot {
    data: Array2<f64>,
}

impl EmbeddingSnapshot {
    /// Stack equally-sized rows into a snapshot, padding to `target_width`.
    pub fn from_rows(rows: Vec<Vec<f64>>, target_width: usize) -> Result<Self> {
        anyhow::ensure!(!rows.is_empty(), "snapshot needs at least one sample");
        let width = rows[0].len();
        anyhow::ensure!(
            rows.iter().all(|r| r.len() == width),
            "all embedding rows must have the same width"
        );

        let n = rows.len();
        let flat: Vec<f64> = rows.into_iter().flatten().collect();
        let data = Array2::from_shape_vec((n, width), flat)?;
        Ok(Self {
            data: pad_to_width(data, target_width),
        })
    }

    /// Rows = samples, columns = units
    pub fn data(&self) -> &Array2<f64> {
        &self.data
    }

    pub fn n_samples(&self) -> usize {
        self.data.nrows()
    }

    pub fn width(&self) -> usize {
        self.data.ncols()
    }
}

/// Pad embeddings with trailing zero columns up to `target_width`.
///
/// Matrices already at or above the target width pass through untouched:
/// padding never truncates. Idempotent, and the original columns are
/// preserved bit-identically.
pub fn pad_to_width(embeddings: Array2<f64>, target_width: usize) -> Array2<f64> {
    let (rows, width) = embeddings.dim();
    if width >= target_width {
        return embeddings;
    }
    let mut padded = Array2::zeros((rows, target_width));
    padded.slice_mut(s![.., ..width]).assign(&embeddings);
    padded
}

/// Collect an [`EmbeddingSnapshot`] by running `passes` forward passes over
/// each text (passes outer, texts inner, in row order).
pub fn collect_embeddings(
    model: &SendModel,
    texts: &[String],
    passes: usize,
    target_width: usize,
    max_length: usize,
) -> Result<EmbeddingSnapshot> {
    let mut rows = Vec::with_capacity(passes * texts.len());
    for _ in 0..passes {
        for text in texts {
            rows.push(model.hidden_embedding(text, max_length)?);
        }
    }
    EmbeddingSnapshot::from_rows(rows, target_width)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pad_narrower_matrix() {
        let m = Array2::from_shape_vec((2, 3), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let padded = pad_to_width(m.clone(), 5);
        assert_eq!(padded.dim(), (2, 5));
        // Original columns bit-identical
        for r in 0..2 {
            for c in 0..3 {
                assert_eq!(padded[[r, c]], m[[r, c]]);
            }
        }
        // Extra columns zero-filled
        for r in 0..2 {
            for c in 3..5 {
                assert_eq!(padded[[r, c]], 0.0);
            }
        }
    }

    #[test]
    fn test_pad_is_idempotent() {
        let m = Array2::from_shape_vec((2, 3), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let once = pad_to_width(m, 6);
        let twice = pad_to_width(once.clone(), 6);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_pad_wider_passes_through() {
        // No truncation: wider-than-canonical matrices are left alone
        let m = Array2::from_shape_vec((1, 4), vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let padded = pad_to_width(m.clone(), 2);
        assert_eq!(padded, m);
    }

    #[test]
    fn test_snapshot_from_rows_pads() {
        let snapshot =
            EmbeddingSnapshot::from_rows(vec![vec![1.0, 2.0], vec![3.0, 4.0]], 4).unwrap();
        assert_eq!(snapshot.n_samples(), 2);
        assert_eq!(snapshot.width(), 4);
        assert_eq!(snapshot.data()[[0, 0]], 1.0);
        assert_eq!(snapshot.data()[[1, 3]], 0.0);
    }

    #[test]
    fn test_snapshot_rejects_ragged_rows() {
        let result = EmbeddingSnapshot::from_rows(vec![vec![1.0, 2.0], vec![3.0]], 4);
        assert!(result.is_err());
    }

    #[test]
    fn test_snapshot_rejects_empty() {
        assert!(EmbeddingSnapshot::from_rows(Vec::new(), 4).is_err());
    }
}
