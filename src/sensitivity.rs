//! Per-unit sensitivity scoring and top-k selection
//!
//! The scorer averages the rolling history of embedding snapshots across
//! epochs first, then measures each unit's drift and dispersion along the
//! sample axis of that single averaged matrix. The averaging-before-diff
//! ordering is deliberate; see DESIGN.md before changing it.

use anyhow::Result;
use ndarray::{Array1, Array2, Axis};
use std::cmp::Ordering;
use tracing::warn;

use crate::collector::EmbeddingSnapshot;

/// Top-k sensitive units: `(unit index, score)` pairs in descending score
/// order. Immutable after creation.
#[derive(Debug, Clone)]
pub struct SensitivityMap {
    entries: Vec<(usize, f64)>,
}

impl SensitivityMap {
    fn new(entries: Vec<(usize, f64)>) -> Self {
        Self { entries }
    }

    /// Selected unit indices, highest score first
    pub fn indices(&self) -> Vec<usize> {
        self.entries.iter().map(|&(i, _)| i).collect()
    }

    /// `(unit index, score)` pairs, highest score first
    pub fn entries(&self) -> &[(usize, f64)] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Net change per unit: sum of absolute consecutive row differences of the
/// averaged matrix, walking down the sample axis.
pub fn net_change(averaged: &Array2<f64>) -> Array1<f64> {
    let (rows, cols) = averaged.dim();
    let mut change = Array1::zeros(cols);
    for r in 1..rows {
        let diff = &averaged.row(r) - &averaged.row(r - 1);
        change += &diff.mapv(f64::abs);
    }
    change
}

/// Net variability per unit: population variance across rows (samples).
pub fn net_variability(averaged: &Array2<f64>) -> Array1<f64> {
    let (rows, cols) = averaged.dim();
    let n = rows as f64;
    let mean = averaged.sum_axis(Axis(0)) / n;
    let mut var = Array1::zeros(cols);
    for r in 0..rows {
        let dev = &averaged.row(r) - &mean;
        var += &dev.mapv(|v| v * v);
    }
    var /= n;
    var
}

/// Combined sensitivity: elementwise product of net change and variability.
///
/// A unit that is constant across all tracked samples has zero variance and
/// therefore scores exactly zero, whatever its change term.
pub fn combined_sensitivity(averaged: &Array2<f64>) -> Array1<f64> {
    net_change(averaged) * net_variability(averaged)
}

/// Score the history window and select the top `ceil(k * D)` units.
///
/// Snapshots are averaged elementwise across epochs before scoring. The
/// selection is capped at `D`; a stable descending sort breaks exact score
/// ties in favor of the lower unit index. `k <= 0` yields an empty map,
/// which disables suppression downstream.
pub fn score_and_select(snapshots: &[&EmbeddingSnapshot], k: f64) -> Result<SensitivityMap> {
    anyhow::ensure!(!snapshots.is_empty(), "sensitivity scoring needs at least one snapshot");
    let shape = snapshots[0].data().dim();
    anyhow::ensure!(
        snapshots.iter().all(|s| s.data().dim() == shape),
        "all snapshots in the history window must share one shape"
    );

    let mut averaged = Array2::<f64>::zeros(shape);
    for snapshot in snapshots {
        averaged += snapshot.data();
    }
    averaged /= snapshots.len() as f64;

    let scores = combined_sensitivity(&averaged);
    let d = scores.len();
    let count = if k <= 0.0 {
        warn!(k, "non-positive top-k fraction: empty selection, suppression disabled");
        0
    } else {
        ((k * d as f64).ceil() as usize).min(d)
    };

    let mut indices: Vec<usize> = (0..d).collect();
    indices.sort_by(|&a, &b| scores[b].partial_cmp(&scores[a]).unwrap_or(Ordering::Equal));

    let entries = indices
        .into_iter()
        .take(count)
        .map(|i| (i, scores[i]))
        .collect();
    Ok(SensitivityMap::new(entries))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot_from(rows: Vec<Vec<f64>>) -> EmbeddingSnapshot {
        let width = rows[0].len();
        EmbeddingSnapshot::from_rows(rows, width).unwrap()
    }

    #[test]
    fn test_constant_unit_scores_zero() {
        // Unit 0 holds [5, 5, 5]: large or small, zero variance wipes it out
        let averaged = Array2::from_shape_vec(
            (3, 2),
            vec![
                5.0, 1.0, //
                5.0, 4.0, //
                5.0, 9.0,
            ],
        )
        .unwrap();
        let scores = combined_sensitivity(&averaged);
        assert_eq!(scores[0], 0.0);
        assert!(scores[1] > 0.0);
    }

    #[test]
    fn test_net_change_sums_absolute_diffs() {
        let averaged =
            Array2::from_shape_vec((3, 1), vec![1.0, 4.0, 2.0]).unwrap();
        let change = net_change(&averaged);
        assert!((change[0] - 5.0).abs() < 1e-12); // |4-1| + |2-4|
    }

    #[test]
    fn test_selection_size_is_ceil_k_d() {
        let snap = snapshot_from(vec![
            (0..8).map(|i| i as f64).collect(),
            (0..8).map(|i| (i * i) as f64).collect(),
            (0..8).map(|i| (i * 3) as f64).collect(),
        ]);
        let map = score_and_select(&[&snap], 0.25).unwrap();
        assert_eq!(map.len(), 2); // ceil(0.25 * 8)

        let map = score_and_select(&[&snap], 0.3).unwrap();
        assert_eq!(map.len(), 3); // ceil(2.4)

        let map = score_and_select(&[&snap], 1.0).unwrap();
        assert_eq!(map.len(), 8);

        // Over-unity k never selects more than D units
        let map = score_and_select(&[&snap], 2.0).unwrap();
        assert_eq!(map.len(), 8);
    }

    #[test]
    fn test_non_positive_k_selects_nothing() {
        let snap = snapshot_from(vec![vec![1.0, 2.0], vec![3.0, 4.0]]);
        let map = score_and_select(&[&snap], 0.0).unwrap();
        assert!(map.is_empty());
        let map = score_and_select(&[&snap], -0.5).unwrap();
        assert!(map.is_empty());
    }

    #[test]
    fn test_top_units_selected_regardless_of_tail_order() {
        // 8 units, k = 0.25 -> 2 selected. Units 3 and 5 carry all the
        // movement; everything else is constant and scores zero.
        let mut rows = vec![vec![0.0; 8], vec![0.0; 8], vec![0.0; 8], vec![0.0; 8]];
        for (r, row) in rows.iter_mut().enumerate() {
            row[3] = (r * r) as f64 * 10.0;
            row[5] = r as f64;
        }
        let snap = snapshot_from(rows);
        let map = score_and_select(&[&snap], 0.25).unwrap();
        assert_eq!(map.indices(), vec![3, 5]);
    }

    #[test]
    fn test_exact_ties_prefer_lower_index() {
        // Units 0 and 2 have identical columns, hence identical scores
        let snap = snapshot_from(vec![
            vec![1.0, 0.0, 1.0],
            vec![2.0, 0.0, 2.0],
            vec![4.0, 0.0, 4.0],
        ]);
        let map = score_and_select(&[&snap], 0.3).unwrap();
        assert_eq!(map.indices(), vec![0]);

        // Full ordering: tied units keep ascending index order
        let map = score_and_select(&[&snap], 1.0).unwrap();
        assert_eq!(map.indices(), vec![0, 2, 1]);
    }

    #[test]
    fn test_history_is_averaged_before_scoring() {
        // Two snapshots whose average is constant per unit: scores collapse
        // to zero even though each epoch individually has variance.
        let a = snapshot_from(vec![vec![1.0], vec![3.0]]);
        let b = snapshot_from(vec![vec![3.0], vec![1.0]]);
        let map = score_and_select(&[&a, &b], 1.0).unwrap();
        assert_eq!(map.entries()[0].1, 0.0);
    }

    #[test]
    fn test_mismatched_snapshot_shapes_rejected() {
        let a = snapshot_from(vec![vec![1.0, 2.0]]);
        let b = snapshot_from(vec![vec![1.0, 2.0, 3.0]]);
        assert!(score_and_select(&[&a, &b], 0.5).is_err());
    }
}
