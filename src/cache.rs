//! Hidden-state cache for storing intermediate transformer states
//!
//! Stores the full residual stream at every token position for every layer
//! boundary of a forward pass: entry 0 is the embedding output, entry `i`
//! (for `i >= 1`) is the output of block `i - 1`. Each tensor has shape
//! `(seq_len, hidden)`.

use anyhow::Result;
use candle_core::{IndexOp, Tensor};

/// Per-layer hidden states captured during a forward pass
#[derive(Debug)]
pub struct HiddenStateCache {
    /// Residual stream per layer boundary, each shape (seq_len, hidden)
    states: Vec<Tensor>,
}

impl HiddenStateCache {
    /// Create an empty cache with capacity for n_states entries
    pub fn with_capacity(n_states: usize) -> Self {
        Self {
            states: Vec::with_capacity(n_states),
        }
    }

    /// Add a layer boundary's hidden states to the cache.
    ///
    /// Tensor should have shape `(seq_len, hidden)`.
    pub fn push(&mut self, tensor: Tensor) {
        self.states.push(tensor);
    }

    /// Get the full hidden-state tensor at a layer boundary.
    ///
    /// Returns shape `(seq_len, hidden)`.
    pub fn get(&self, index: usize) -> Option<&Tensor> {
        self.states.get(index)
    }

    /// Get the hidden state at a specific layer boundary and token position.
    ///
    /// Returns shape `(hidden,)`.
    pub fn position(&self, index: usize, position: usize) -> Result<Tensor> {
        let state = self
            .states
            .get(index)
            .ok_or_else(|| anyhow::anyhow!("Layer boundary {index} not in cache"))?;
        let seq_len = state.dim(0)?;
        anyhow::ensure!(
            position < seq_len,
            "Position {position} out of range (seq_len={seq_len})"
        );
        Ok(state.i(position)?)
    }

    /// Number of cached layer boundaries (embedding output + one per block)
    pub fn len(&self) -> usize {
        self.states.len()
    }

    /// Get the sequence length (from the first cached tensor)
    pub fn seq_len(&self) -> Result<usize> {
        let first = self
            .states
            .first()
            .ok_or_else(|| anyhow::anyhow!("Cache is empty"))?;
        Ok(first.dim(0)?)
    }

    /// Check if cache is empty
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}
