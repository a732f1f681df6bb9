//! Unit suppression: irreversible zeroing of feed-forward units
//!
//! A selected unit set is zeroed out of one feed-forward block for a bounded
//! window of epochs. Zeroing overwrites the weights in place with no
//! snapshot or restore, so successive windows compound: once a unit is
//! zeroed it stays zeroed for the rest of the run (and further training may
//! or may not regrow it). Callers wanting reversible masking need a
//! different mechanism.

use anyhow::Result;
use candle_core::{Tensor, Var};
use tracing::{debug, info, warn};

use crate::sensitivity::SensitivityMap;

/// Mutable handles on one feed-forward block's parameters.
///
/// `Var`s are shallow clones sharing storage with the live model, so writes
/// through them are visible to subsequent forward passes.
pub struct FeedForwardHandles {
    /// Expansion weight, shape `(intermediate, hidden)`; units index rows
    pub expand_weight: Var,
    /// Expansion bias, shape `(intermediate,)`
    pub expand_bias: Var,
    /// Projection weight, shape `(hidden, intermediate)`; units index columns
    pub project_weight: Var,
    /// Projection bias, shape `(hidden,)`
    pub project_bias: Var,
}

/// Capability to hand out feed-forward parameter handles by block index,
/// decoupling suppression from any specific model's layer addressing.
pub trait FeedForwardAccess {
    fn feed_forward(&self, block: usize) -> Result<FeedForwardHandles>;
}

/// Zero the given unit indices out of a feed-forward block.
///
/// For each unit this clears the expansion weight row and bias entry, and
/// the projection weight column and bias entry. The overwrite is in-place
/// and irreversible: original values are not saved anywhere.
pub fn suppress_units(ffn: &FeedForwardHandles, units: &[usize]) -> Result<()> {
    zero_rows(&ffn.expand_weight, units)?;
    zero_entries(&ffn.expand_bias, units)?;
    zero_columns(&ffn.project_weight, units)?;
    zero_entries(&ffn.project_bias, units)?;
    Ok(())
}

/// Multiplicative mask: ones everywhere, zero at the given unit indices
fn unit_mask(len: usize, units: &[usize], var: &Var) -> Result<Tensor> {
    let mut mask = vec![1f32; len];
    for &unit in units {
        anyhow::ensure!(unit < len, "unit index {unit} out of range for dimension {len}");
        mask[unit] = 0.0;
    }
    Ok(Tensor::from_vec(mask, len, var.device())?.to_dtype(var.dtype())?)
}

fn zero_rows(weight: &Var, units: &[usize]) -> Result<()> {
    let (rows, _cols) = weight.dims2()?;
    let mask = unit_mask(rows, units, weight)?.reshape((rows, 1))?;
    let next = weight.as_tensor().broadcast_mul(&mask)?;
    weight.set(&next)?;
    Ok(())
}

fn zero_columns(weight: &Var, units: &[usize]) -> Result<()> {
    let (_rows, cols) = weight.dims2()?;
    let mask = unit_mask(cols, units, weight)?.reshape((1, cols))?;
    let next = weight.as_tensor().broadcast_mul(&mask)?;
    weight.set(&next)?;
    Ok(())
}

fn zero_entries(bias: &Var, units: &[usize]) -> Result<()> {
    let len = bias.dims1()?;
    let mask = unit_mask(len, units, bias)?;
    let next = bias.as_tensor().broadcast_mul(&mask)?;
    bias.set(&next)?;
    Ok(())
}

/// Suppression window state machine.
///
/// Inactive until a non-empty [`SensitivityMap`] is installed; then active
/// for `window` epoch ticks, re-applying the zeroing each tick, after which
/// it clears back to inactive until the next recompute.
#[derive(Debug)]
pub struct SuppressionController {
    active: Option<SensitivityMap>,
    remaining: usize,
    window: usize,
}

impl SuppressionController {
    pub fn new(window: usize) -> Self {
        Self {
            active: None,
            remaining: 0,
            window: window.max(1),
        }
    }

    /// Replace the active unit set and reset the window.
    ///
    /// An empty map deactivates suppression entirely.
    pub fn install(&mut self, map: SensitivityMap) {
        if map.is_empty() {
            warn!("empty sensitivity selection: suppression disabled until next recompute");
            self.active = None;
            self.remaining = 0;
            return;
        }
        info!(
            units = map.len(),
            window = self.window,
            "installing sensitive unit set"
        );
        self.active = Some(map);
        self.remaining = self.window;
    }

    /// Epoch tick: while a window is open, re-apply the current set to the
    /// designated block and decrement the counter.
    ///
    /// Returns `Some((unit count, epochs remaining))` when suppression was
    /// applied this tick, `None` otherwise.
    pub fn tick(
        &mut self,
        model: &dyn FeedForwardAccess,
        block: usize,
    ) -> Result<Option<(usize, usize)>> {
        let Some(map) = self.active.take() else {
            return Ok(None);
        };
        if self.remaining == 0 {
            // Window already exhausted: stay inactive until the next install
            return Ok(None);
        }

        let ffn = model.feed_forward(block)?;
        suppress_units(&ffn, &map.indices())?;
        let count = map.len();
        self.remaining -= 1;
        if self.remaining == 0 {
            debug!("suppression window exhausted");
        } else {
            self.active = Some(map);
        }
        Ok(Some((count, self.remaining)))
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    pub fn remaining(&self) -> usize {
        self.remaining
    }

    pub fn active_units(&self) -> Option<&SensitivityMap> {
        self.active.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::EmbeddingSnapshot;
    use crate::sensitivity::score_and_select;
    use candle_core::{DType, Device};

    /// In-memory feed-forward block standing in for a live model
    struct StubBlock {
        handles: FeedForwardHandles,
    }

    impl StubBlock {
        fn new(hidden: usize, intermediate: usize) -> Self {
            let device = Device::Cpu;
            let ones =
                |shape: Vec<usize>| Var::ones(shape, DType::F32, &device).unwrap();
            Self {
                handles: FeedForwardHandles {
                    expand_weight: ones(vec![intermediate, hidden]),
                    expand_bias: ones(vec![intermediate]),
                    project_weight: ones(vec![hidden, intermediate]),
                    project_bias: ones(vec![hidden]),
                },
            }
        }
    }

    impl FeedForwardAccess for StubBlock {
        fn feed_forward(&self, _block: usize) -> Result<FeedForwardHandles> {
            Ok(FeedForwardHandles {
                expand_weight: self.handles.expand_weight.clone(),
                expand_bias: self.handles.expand_bias.clone(),
                project_weight: self.handles.project_weight.clone(),
                project_bias: self.handles.project_bias.clone(),
            })
        }
    }

    fn selection(units: &[usize], width: usize) -> SensitivityMap {
        // Build snapshots whose movement concentrates on the wanted units
        let mut rows = vec![vec![0.0; width]; 3];
        for (rank, &u) in units.iter().enumerate() {
            for (r, row) in rows.iter_mut().enumerate() {
                row[u] = (r * r) as f64 * (units.len() - rank) as f64;
            }
        }
        let snap = EmbeddingSnapshot::from_rows(rows, width).unwrap();
        let k = units.len() as f64 / width as f64;
        score_and_select(&[&snap], k).unwrap()
    }

    #[test]
    fn test_suppress_units_zeroes_rows_columns_and_biases() {
        let block = StubBlock::new(4, 8);
        let ffn = block.feed_forward(0).unwrap();
        suppress_units(&ffn, &[1, 3]).unwrap();

        let expand: Vec<Vec<f32>> = ffn.expand_weight.as_tensor().to_vec2().unwrap();
        assert!(expand[1].iter().all(|&v| v == 0.0));
        assert!(expand[3].iter().all(|&v| v == 0.0));
        assert!(expand[0].iter().all(|&v| v == 1.0));

        let expand_bias: Vec<f32> = ffn.expand_bias.as_tensor().to_vec1().unwrap();
        assert_eq!(expand_bias[1], 0.0);
        assert_eq!(expand_bias[0], 1.0);

        let project: Vec<Vec<f32>> = ffn.project_weight.as_tensor().to_vec2().unwrap();
        for row in &project {
            assert_eq!(row[1], 0.0);
            assert_eq!(row[3], 0.0);
            assert_eq!(row[0], 1.0);
        }

        let project_bias: Vec<f32> = ffn.project_bias.as_tensor().to_vec1().unwrap();
        assert_eq!(project_bias[3], 0.0);
        assert_eq!(project_bias[2], 1.0);
    }

    #[test]
    fn test_suppress_units_rejects_out_of_range() {
        let block = StubBlock::new(4, 8);
        let ffn = block.feed_forward(0).unwrap();
        assert!(suppress_units(&ffn, &[4]).is_err()); // project_bias has 4 entries
    }

    #[test]
    fn test_window_lifecycle() {
        let block = StubBlock::new(4, 8);
        let mut controller = SuppressionController::new(3);

        // Nothing installed: ticks are no-ops
        assert!(controller.tick(&block, 0).unwrap().is_none());

        controller.install(selection(&[1], 4));
        assert!(controller.is_active());
        assert_eq!(controller.remaining(), 3);

        assert_eq!(controller.tick(&block, 0).unwrap(), Some((1, 2)));
        assert_eq!(controller.tick(&block, 0).unwrap(), Some((1, 1)));
        assert_eq!(controller.tick(&block, 0).unwrap(), Some((1, 0)));

        // 4th tick: window exhausted, inactive again
        assert!(!controller.is_active());
        assert_eq!(controller.remaining(), 0);
        assert!(controller.tick(&block, 0).unwrap().is_none());
    }

    #[test]
    fn test_install_resets_window() {
        let block = StubBlock::new(4, 8);
        let mut controller = SuppressionController::new(3);
        controller.install(selection(&[1], 4));
        controller.tick(&block, 0).unwrap();
        assert_eq!(controller.remaining(), 2);

        controller.install(selection(&[2], 4));
        assert_eq!(controller.remaining(), 3);
    }

    #[test]
    fn test_empty_map_deactivates() {
        let snap = EmbeddingSnapshot::from_rows(vec![vec![1.0, 2.0]], 2).unwrap();
        let empty = score_and_select(&[&snap], 0.0).unwrap();
        let mut controller = SuppressionController::new(3);
        controller.install(empty);
        assert!(!controller.is_active());
        assert_eq!(controller.remaining(), 0);
    }
}
