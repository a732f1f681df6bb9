//! Eigenscore estimation for representation-drift tracking
//!
//! The eigenscore is a log-determinant-like statistic of the regularized
//! sample covariance of an embedding batch. Two estimators are provided:
//!
//! - **Exact**: mean-center, take singular values, sum regularized logs.
//! - **Approximate**: mean-center *and* standardize, rescale by the dominant
//!   singular value (power iteration), then estimate the spectral correction
//!   between the raw and rescaled spectra with a stochastic Chebyshev trace
//!   estimator (Hutchinson probes over a three-term recurrence with a
//!   parallel derivative recurrence), and add back the regularized term from
//!   a full decomposition of the rescaled matrix.
//!
//! Exact mode centers only; approximate mode also standardizes. The
//! asymmetry is intentional; see DESIGN.md before changing it.
//!
//! The Chebyshev coefficients expand the *antiderivative* of the correction
//! function; the derivative recurrence then recovers the function itself.
//! This is why the order-0 coefficient never appears: the derivative of the
//! constant term vanishes.

use anyhow::{bail, Result};
use nalgebra::DMatrix;
use ndarray::{Array1, Array2, Axis};
use rand::rngs::StdRng;
use rand_distr::{Distribution, StandardNormal};
use std::f64::consts::PI;
use tracing::warn;

/// Regularization floor added to every eigenvalue before the log
pub const DEFAULT_ALPHA: f64 = 1e-3;

/// Floor for degenerate column standard deviations and vanishing norms
const STD_FLOOR: f64 = 1e-12;

const POWER_ITERATION_CAP: usize = 100;
const POWER_ITERATION_TOL: f64 = 1e-7;

/// Which estimator to run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EstimatorMode {
    /// Full singular value decomposition
    Exact,
    /// Stochastic Chebyshev trace estimation, hybridized with an exact
    /// regularized term
    Approximate,
}

/// Eigenscore estimator configuration
#[derive(Debug, Clone)]
pub struct EigenscoreEstimator {
    /// Regularization constant added to each eigenvalue
    pub alpha: f64,
    /// Chebyshev expansion order L
    pub expansion_order: usize,
    /// Number of Hutchinson probe vectors Nz
    pub probe_count: usize,
}

impl Default for EigenscoreEstimator {
    fn default() -> Self {
        Self {
            alpha: DEFAULT_ALPHA,
            expansion_order: 20,
            probe_count: 20,
        }
    }
}

impl EigenscoreEstimator {
    /// Estimate the eigenscore of `embeddings` (rows = samples).
    pub fn estimate(
        &self,
        embeddings: &Array2<f64>,
        mode: EstimatorMode,
        rng: &mut StdRng,
    ) -> Result<f64> {
        match mode {
            EstimatorMode::Exact => self.exact(embeddings),
            EstimatorMode::Approximate => self.approximate(embeddings, rng),
        }
    }

    /// Exact eigenscore: `sum_i ln(s_i^2 / (n-1) + alpha) / n` over the
    /// singular values of the mean-centered matrix.
    pub fn exact(&self, embeddings: &Array2<f64>) -> Result<f64> {
        let n = embeddings.nrows();
        if n < 2 {
            bail!("eigenscore needs at least two sample rows, got {n}");
        }
        let centered = center_columns(embeddings);
        let denom = (n - 1) as f64;
        let sum: f64 = singular_values(&centered)
            .iter()
            .map(|s| (s * s / denom + self.alpha).ln())
            .sum();
        Ok(sum / n as f64)
    }

    /// Approximate eigenscore via stochastic Chebyshev trace estimation.
    pub fn approximate(&self, embeddings: &Array2<f64>, rng: &mut StdRng) -> Result<f64> {
        let n = embeddings.nrows();
        if n < 2 {
            bail!("eigenscore needs at least two sample rows, got {n}");
        }
        if self.expansion_order == 0 || self.probe_count == 0 {
            bail!("chebyshev expansion order and probe count must be positive");
        }

        let centered = center_columns(embeddings);
        let (normalized, degenerate) = standardize_columns(&centered);
        if degenerate > 0 {
            warn!(
                columns = degenerate,
                "degenerate column standard deviation floored during standardization"
            );
        }

        let sigma = power_iteration(&normalized);
        if sigma < STD_FLOOR {
            bail!("spectral norm vanished: embedding batch is constant");
        }
        let rescaled = &normalized / sigma;

        let denom = (n - 1) as f64;
        let alpha = self.alpha;
        let sigma_sq = sigma * sigma;
        // Correction between the unrescaled and rescaled spectra, expressed
        // on the mapped Gram eigenvalue range x in [-1, 1], mu = (x + 1) / 2.
        // Vanishes at x = -1 so null-space eigenvalues contribute nothing.
        let correction = move |x: f64| {
            let mu = (x + 1.0) / 2.0;
            (sigma_sq * mu / denom + alpha).ln() - (mu / denom + alpha).ln()
        };

        let fhat = chebyshev_coefficients(&correction, self.expansion_order + 1);
        let coeffs = integrated_coefficients(&fhat);
        let trace = chebyshev_trace(&rescaled, &coeffs, self.probe_count, rng);

        let regularized: f64 = singular_values(&rescaled)
            .iter()
            .map(|t| (t * t / denom + alpha).ln())
            .sum();

        Ok((trace + regularized) / n as f64)
    }
}

/// Subtract column means
fn center_columns(x: &Array2<f64>) -> Array2<f64> {
    let mean = x.sum_axis(Axis(0)) / x.nrows() as f64;
    x - &mean
}

/// Divide each (already centered) column by its population standard
/// deviation, flooring degenerate deviations. Returns the normalized matrix
/// and the number of floored columns.
fn standardize_columns(centered: &Array2<f64>) -> (Array2<f64>, usize) {
    let n = centered.nrows() as f64;
    let mut degenerate = 0usize;
    let std = centered.map_axis(Axis(0), |col| {
        let var = col.iter().map(|v| v * v).sum::<f64>() / n;
        let s = var.sqrt();
        if s < STD_FLOOR {
            degenerate += 1;
            STD_FLOOR
        } else {
            s
        }
    });
    (centered / &std, degenerate)
}

/// Singular values via full decomposition
fn singular_values(x: &Array2<f64>) -> Vec<f64> {
    let (n, d) = x.dim();
    let mat = DMatrix::from_row_iterator(n, d, x.iter().copied());
    mat.singular_values().iter().copied().collect()
}

/// Dominant singular value via power iteration on the Gram operator.
///
/// Repeated `v <- X^T X v` with L2 renormalization until the estimate
/// stabilizes or the iteration cap is hit.
pub(crate) fn power_iteration(x: &Array2<f64>) -> f64 {
    let d = x.ncols();
    let mut v = Array1::from_elem(d, 1.0 / (d as f64).sqrt());
    let mut sigma = 0.0;
    for _ in 0..POWER_ITERATION_CAP {
        let w = x.t().dot(&x.dot(&v));
        let norm = w.dot(&w).sqrt();
        if norm < STD_FLOOR {
            return 0.0;
        }
        v = w / norm;
        let xv = x.dot(&v);
        let next = xv.dot(&xv).sqrt();
        if (next - sigma).abs() <= POWER_ITERATION_TOL * next.max(1.0) {
            return next;
        }
        sigma = next;
    }
    sigma
}

/// Chebyshev coefficients `fhat_0 ..= fhat_max_order` of `f` on [-1, 1] by
/// Chebyshev-Gauss quadrature. `fhat_0` comes back at full quadrature value
/// (twice the mean); the integration identity below consumes it as such.
fn chebyshev_coefficients(f: &dyn Fn(f64) -> f64, max_order: usize) -> Vec<f64> {
    let nodes = 8 * (max_order + 1);
    let mut fhat = vec![0.0; max_order + 1];
    for k in 0..nodes {
        let theta = PI * (k as f64 + 0.5) / nodes as f64;
        let fx = f(theta.cos());
        for (m, slot) in fhat.iter_mut().enumerate() {
            *slot += fx * (m as f64 * theta).cos();
        }
    }
    for slot in &mut fhat {
        *slot *= 2.0 / nodes as f64;
    }
    fhat
}

/// Coefficients `c_1 ..= c_L` of the antiderivative:
/// `c_m = (fhat_{m-1} - fhat_{m+1}) / (2 m)`.
///
/// Differentiating `sum_m c_m T_m` term-wise through the derivative
/// recurrence recovers `f`; the antiderivative's constant term drops out.
fn integrated_coefficients(fhat: &[f64]) -> Vec<f64> {
    let l = fhat.len() - 2;
    (1..=l)
        .map(|m| (fhat[m - 1] - fhat[m + 1]) / (2.0 * m as f64))
        .collect()
}

/// Hutchinson estimate of `tr(sum_m c_m T'_m(B))` for the mapped Gram
/// operator `B = 2 Y^T Y - I` of the rescaled matrix `y`.
///
/// Runs the three-term Chebyshev recurrence `T_m = 2 B T_{m-1} - T_{m-2}`
/// and the parallel derivative recurrence
/// `D_m = 2 T_{m-1} + 2 B D_{m-1} - D_{m-2}` over all probes at once; each
/// order contributes `c_m * mean_j(z_j . D_m z_j)`.
fn chebyshev_trace(y: &Array2<f64>, coeffs: &[f64], probe_count: usize, rng: &mut StdRng) -> f64 {
    let d = y.ncols();
    let z = Array2::from_shape_fn((d, probe_count), |_| StandardNormal.sample(rng));
    let apply = |t: &Array2<f64>| y.t().dot(&y.dot(t)) * 2.0 - t;
    let hutchinson =
        |dm: &Array2<f64>| (&z * dm).sum() / probe_count as f64;

    // T_0 = Z, T_1 = B Z; D_0 = 0, D_1 = Z
    let mut t_prev = z.clone();
    let mut t_cur = apply(&z);
    let mut d_prev = Array2::<f64>::zeros((d, probe_count));
    let mut d_cur = z.clone();

    let mut total = coeffs[0] * hutchinson(&d_cur);
    for &c in &coeffs[1..] {
        let d_next = &t_cur * 2.0 + apply(&d_cur) * 2.0 - &d_prev;
        let t_next = apply(&t_cur) * 2.0 - &t_prev;
        total += c * hutchinson(&d_next);
        t_prev = std::mem::replace(&mut t_cur, t_next);
        d_prev = std::mem::replace(&mut d_cur, d_next);
    }
    total
}
