//! Iterative classification/refit loop for one block of magnitude samples.
//!
//! A block is a `(voxels, K)` matrix: spatial positions flattened on the rows,
//! repeated acquisitions along the columns. The estimator alternates between
//! classifying voxels as noise-only under trial sigma values and refitting the
//! distribution parameters from the classified subset, until the estimates
//! stop moving or the iteration budget runs out.

use ndarray::{Array1, ArrayView2};

use crate::distribution::{fit_noise_distribution, gamma_quantile, FitMethod};

// =============================================================================
// Constants
// =============================================================================

/// Default lower bound on the coil count during classification.
pub const DEFAULT_N_MIN: f64 = 1.0;

/// Default upper bound on the coil count during classification.
pub const DEFAULT_N_MAX: f64 = 12.0;

/// Default two-sided significance level for the noise acceptance band.
pub const DEFAULT_ALPHA: f64 = 0.05;

/// Default convergence tolerance on sigma and N (absolute or relative).
pub const DEFAULT_EPS: f64 = 1e-3;

/// Default cap on classify/refit iterations per block.
pub const DEFAULT_MAX_ITER: usize = 100;

/// Default length of the initial candidate-sigma scan.
pub const DEFAULT_PHI_LEN: usize = 50;

/// Length of the refined candidate scan once an estimate exists.
const REFINE_PHI_LEN: usize = 11;

/// Relative span of the refined scan around the current sigma estimate.
const REFINE_LO: f64 = 0.95;
const REFINE_HI: f64 = 1.05;

// =============================================================================
// Types
// =============================================================================

/// Tunable constants of the block estimator. The defaults match the
/// published characterization method; tests override individual fields.
#[derive(Debug, Clone)]
pub struct EstimatorOpts {
    /// Lower bound on N for the classification band.
    pub n_min: f64,
    /// Upper bound on N for the classification band.
    pub n_max: f64,
    /// Two-sided significance level of the acceptance band.
    pub alpha: f64,
    /// Convergence tolerance on both parameters.
    pub eps: f64,
    /// Iteration cap for the classify/refit loop.
    pub max_iter: usize,
    /// Number of trial sigmas in the initial scan.
    pub phi_len: usize,
}

impl Default for EstimatorOpts {
    fn default() -> Self {
        Self {
            n_min: DEFAULT_N_MIN,
            n_max: DEFAULT_N_MAX,
            alpha: DEFAULT_ALPHA,
            eps: DEFAULT_EPS,
            max_iter: DEFAULT_MAX_ITER,
            phi_len: DEFAULT_PHI_LEN,
        }
    }
}

impl EstimatorOpts {
    /// Validate the options.
    pub fn validate(&self) -> Result<(), String> {
        if !(self.n_min > 0.0) || !(self.n_max >= self.n_min) {
            return Err(format!(
                "coil count bounds must satisfy 0 < n_min <= n_max, got {} and {}",
                self.n_min, self.n_max
            ));
        }
        if !(self.alpha > 0.0 && self.alpha < 1.0) {
            return Err(format!("alpha must lie in (0, 1), got {}", self.alpha));
        }
        if !(self.eps > 0.0) || !self.eps.is_finite() {
            return Err(format!("eps must be a positive finite value, got {}", self.eps));
        }
        if self.max_iter == 0 {
            return Err("max_iter must be > 0".to_string());
        }
        if self.phi_len == 0 {
            return Err("phi_len must be > 0".to_string());
        }
        Ok(())
    }
}

/// Result of one block estimation. A failed block carries the `(0, 0)`
/// sentinel and an all-false mask; a block that hit the iteration cap carries
/// the last estimate with `converged = false`.
#[derive(Debug, Clone)]
pub struct BlockEstimate {
    pub sigma: f64,
    pub n: f64,
    /// Per-voxel noise classification under the final parameters.
    pub mask: Array1<bool>,
    /// Classify/refit iterations actually run.
    pub iterations: usize,
    pub converged: bool,
}

impl BlockEstimate {
    fn failed(n_vox: usize, iterations: usize) -> Self {
        Self {
            sigma: 0.0,
            n: 0.0,
            mask: Array1::from_elem(n_vox, false),
            iterations,
            converged: false,
        }
    }

    /// True when the block produced the degenerate-data sentinel.
    pub fn is_sentinel(&self) -> bool {
        self.sigma == 0.0 || self.n == 0.0
    }
}

/// Loop state of the estimator. Classify and Refit alternate; Converged and
/// Failed are terminal.
enum State {
    Classify,
    Refit { mask: Array1<bool> },
    Converged { sigma: f64, n: f64, mask: Array1<bool> },
    Failed,
}

// =============================================================================
// Estimation
// =============================================================================

/// Run the classify/refit loop on one block.
///
/// `prior_median` seeds the initial sigma guess through the gamma median
/// relationship `sigma0 = median / sqrt(2 * Q(n_max, 1/2))`. `exclude` marks
/// voxels removed from estimation outright; they are never part of any
/// returned mask.
pub fn estimate_block(
    block: ArrayView2<f64>,
    prior_median: f64,
    exclude: Option<&Array1<bool>>,
    method: FitMethod,
    opts: &EstimatorOpts,
) -> BlockEstimate {
    let n_vox = block.nrows();

    if let Some(ex) = exclude {
        debug_assert_eq!(ex.len(), n_vox, "exclusion mask length mismatch");
        if ex.iter().all(|&b| b) {
            // Nothing left to classify
            return BlockEstimate::failed(n_vox, 0);
        }
    }

    // Per-voxel squared sum and effective repeat count over the K axis.
    // Zeros and non-finite entries drop out of both, so K varies per voxel.
    // These are loop invariants of the whole estimation.
    let mut sum_sq = Array1::<f64>::zeros(n_vox);
    let mut counts = vec![0usize; n_vox];
    for (v, row) in block.outer_iter().enumerate() {
        for &x in row.iter() {
            if x != 0.0 && x.is_finite() {
                sum_sq[v] += x * x;
                counts[v] += 1;
            }
        }
    }
    let k_max = counts.iter().copied().max().unwrap_or(0);

    let sigma_init = prior_median / (2.0 * gamma_quantile(opts.n_max, 0.5)).sqrt();
    let mut phi: Vec<f64> = (1..=opts.phi_len)
        .map(|i| i as f64 * sigma_init / opts.phi_len as f64)
        .collect();

    let mut n_lo = opts.n_min;
    let mut n_hi = opts.n_max;
    let mut sigma_prev = -1.0;
    let mut n_prev = -1.0;
    let mut last: Option<(f64, f64, Array1<bool>)> = None;

    let mut iteration = 0;
    let mut state = State::Classify;

    loop {
        state = match state {
            State::Classify => {
                if iteration == opts.max_iter {
                    // Budget exhausted: the last estimate is the best effort
                    return match last.take() {
                        Some((sigma, n, mask)) => BlockEstimate {
                            sigma,
                            n,
                            mask,
                            iterations: iteration,
                            converged: false,
                        },
                        None => BlockEstimate::failed(n_vox, iteration),
                    };
                }
                iteration += 1;

                let mut mask = classify(&sum_sq, &counts, k_max, n_lo, n_hi, &phi, opts.alpha);
                if let Some(ex) = exclude {
                    for (m, &e) in mask.iter_mut().zip(ex.iter()) {
                        *m = *m && !e;
                    }
                }

                if mask.iter().any(|&b| b) {
                    State::Refit { mask }
                } else {
                    State::Failed
                }
            }

            State::Refit { mask } => {
                let samples: Vec<f64> = mask
                    .iter()
                    .zip(block.outer_iter())
                    .filter(|(&m, _)| m)
                    .flat_map(|(_, row)| row.to_vec())
                    .collect();

                let (sigma, n) = fit_noise_distribution(&samples, method);
                if sigma == 0.0 || n == 0.0 {
                    State::Failed
                } else {
                    // Absolute test first, then relative, early-exit on either
                    let abs_ok =
                        (n - n_prev).abs() < opts.eps && (sigma - sigma_prev).abs() < opts.eps;
                    let rel_ok = (n - n_prev).abs() / n < opts.eps
                        && (sigma - sigma_prev).abs() / sigma < opts.eps;

                    if abs_ok || rel_ok {
                        State::Converged { sigma, n, mask }
                    } else {
                        n_prev = n;
                        sigma_prev = sigma;

                        // Collapse the coil-count search onto the estimate and
                        // rescan a narrow sigma neighborhood
                        let collapsed = n.round();
                        n_lo = collapsed;
                        n_hi = collapsed;
                        phi = (0..REFINE_PHI_LEN)
                            .map(|i| {
                                let t = i as f64 / (REFINE_PHI_LEN - 1) as f64;
                                (REFINE_LO + (REFINE_HI - REFINE_LO) * t) * sigma
                            })
                            .collect();

                        last = Some((sigma, n, mask));
                        State::Classify
                    }
                }
            }

            State::Converged { sigma, n, mask } => {
                return BlockEstimate {
                    sigma,
                    n,
                    mask,
                    iterations: iteration,
                    converged: true,
                };
            }

            State::Failed => return BlockEstimate::failed(n_vox, iteration),
        };
    }
}

/// One classification pass: scan the candidate sigmas and keep the mask of
/// the trial that accepts the most voxels.
fn classify(
    sum_sq: &Array1<f64>,
    counts: &[usize],
    k_max: usize,
    n_lo: f64,
    n_hi: f64,
    phi: &[f64],
    alpha: f64,
) -> Array1<bool> {
    let n_vox = sum_sq.len();

    // Acceptance band per effective repeat count; count 0 collapses to the
    // quantile floor and rejects the voxel.
    let bounds: Vec<(f64, f64)> = (0..=k_max)
        .map(|k| {
            (
                gamma_quantile(n_lo * k as f64, alpha / 2.0),
                gamma_quantile(n_hi * k as f64, 1.0 - alpha / 2.0),
            )
        })
        .collect();

    let accepted = |sigma: f64, v: usize| -> bool {
        let s = sum_sq[v] / (2.0 * sigma * sigma);
        let (lo, hi) = bounds[counts[v]];
        lo < s && s < hi
    };

    let mut best_sigma = f64::NAN;
    let mut best_count = 0usize;
    for &sigma in phi {
        let count = (0..n_vox).filter(|&v| accepted(sigma, v)).count();
        if count > best_count {
            best_count = count;
            best_sigma = sigma;
        }
    }

    if best_count == 0 {
        Array1::from_elem(n_vox, false)
    } else {
        Array1::from_shape_fn(n_vox, |v| accepted(best_sigma, v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rand_distr::Distribution;

    /// Pure-noise block: (voxels, K) magnitudes with x^2/(2 sigma^2) ~ Gamma(n, 1).
    fn noise_block(sigma: f64, n: f64, voxels: usize, k: usize, seed: u64) -> Array2<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        let gamma = rand_distr::Gamma::new(n, 1.0).unwrap();
        Array2::from_shape_fn((voxels, k), |_| {
            sigma * (2.0 * gamma.sample(&mut rng)).sqrt()
        })
    }

    fn block_median(block: &Array2<f64>) -> f64 {
        let mut values: Vec<f64> = block.iter().copied().collect();
        crate::utils::median_of_slice(&mut values)
    }

    // ==================== Degenerate Block Tests ====================

    #[test]
    fn test_all_excluded_block_fails_without_iterating() {
        let block = noise_block(5.0, 4.0, 100, 8, 1);
        let exclude = Array1::from_elem(100, true);

        let est = estimate_block(
            block.view(),
            block_median(&block),
            Some(&exclude),
            FitMethod::Moments,
            &EstimatorOpts::default(),
        );

        assert!(est.is_sentinel());
        assert_eq!(est.iterations, 0, "should not have entered the loop");
        assert!(est.mask.iter().all(|&b| !b));
    }

    #[test]
    fn test_all_zero_block_fails() {
        let block = Array2::<f64>::zeros((50, 8));

        let est = estimate_block(
            block.view(),
            0.0,
            None,
            FitMethod::Moments,
            &EstimatorOpts::default(),
        );

        assert!(est.is_sentinel());
        assert!(est.mask.iter().all(|&b| !b));
    }

    // ==================== Recovery Tests ====================

    #[test]
    fn test_recovers_parameters_on_pure_noise() {
        let (sigma, n) = (5.0, 4.0);
        let block = noise_block(sigma, n, 4000, 8, 42);

        let est = estimate_block(
            block.view(),
            block_median(&block),
            None,
            FitMethod::Moments,
            &EstimatorOpts::default(),
        );

        assert!(est.converged, "pure noise should converge");
        assert!(
            (est.sigma - sigma).abs() / sigma < 0.1,
            "sigma {} should be within 10% of {}",
            est.sigma,
            sigma
        );
        assert!(
            (est.n - n).abs() / n < 0.25,
            "N {} should be near {}",
            est.n,
            n
        );

        let accepted = est.mask.iter().filter(|&&b| b).count();
        assert!(
            accepted > 2000,
            "most pure-noise voxels should be classified as noise, got {}",
            accepted
        );
    }

    #[test]
    fn test_recovers_parameters_maxlk() {
        let (sigma, n) = (5.0, 4.0);
        let block = noise_block(sigma, n, 4000, 8, 43);

        let est = estimate_block(
            block.view(),
            block_median(&block),
            None,
            FitMethod::Maxlk,
            &EstimatorOpts::default(),
        );

        assert!(
            (est.sigma - sigma).abs() / sigma < 0.1,
            "maxlk sigma {} should be within 10% of {}",
            est.sigma,
            sigma
        );
    }

    #[test]
    fn test_hotspot_voxels_rejected() {
        let (sigma, n) = (5.0, 4.0);
        let mut block = noise_block(sigma, n, 2000, 8, 7);

        // Strong signal in the first 50 voxels
        for v in 0..50 {
            for k in 0..8 {
                block[[v, k]] *= 10.0;
            }
        }

        let est = estimate_block(
            block.view(),
            block_median(&block),
            None,
            FitMethod::Moments,
            &EstimatorOpts::default(),
        );

        assert!(!est.is_sentinel());
        for v in 0..50 {
            assert!(
                !est.mask[v],
                "hot-spot voxel {} must not be classified as noise",
                v
            );
        }
    }

    // ==================== Exclusion Tests ====================

    #[test]
    fn test_excluded_voxels_never_in_mask() {
        let block = noise_block(5.0, 4.0, 1000, 8, 9);
        let exclude = Array1::from_shape_fn(1000, |v| v % 3 == 0);

        let est = estimate_block(
            block.view(),
            block_median(&block),
            Some(&exclude),
            FitMethod::Moments,
            &EstimatorOpts::default(),
        );

        for (v, (&m, &e)) in est.mask.iter().zip(exclude.iter()).enumerate() {
            assert!(
                !(m && e),
                "excluded voxel {} leaked into the noise mask",
                v
            );
        }
    }

    // ==================== Iteration Budget Tests ====================

    #[test]
    fn test_iteration_cap_returns_best_effort() {
        let block = noise_block(5.0, 4.0, 1000, 8, 11);
        let opts = EstimatorOpts {
            max_iter: 1,
            ..Default::default()
        };

        let est = estimate_block(
            block.view(),
            block_median(&block),
            None,
            FitMethod::Moments,
            &opts,
        );

        // One iteration can never satisfy the convergence test (the previous
        // estimate starts as a sentinel), so the cap path must fire
        assert!(!est.converged);
        assert_eq!(est.iterations, 1);
        assert!(
            !est.is_sentinel(),
            "cap without degenerate data is best-effort, not failure"
        );
    }

    // ==================== Options Tests ====================

    #[test]
    fn test_opts_validation() {
        assert!(EstimatorOpts::default().validate().is_ok());

        let bad = EstimatorOpts {
            n_min: 0.0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());

        let bad = EstimatorOpts {
            alpha: 1.5,
            ..Default::default()
        };
        assert!(bad.validate().is_err());

        let bad = EstimatorOpts {
            max_iter: 0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());

        let bad = EstimatorOpts {
            phi_len: 0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }
}
