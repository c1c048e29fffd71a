//! Volume-level orchestration of the block estimator.
//!
//! Two operating modes over a 4-D magnitude volume `(X, Y, Z, K)`:
//!
//! - **Slice mode** (diffusion-weighted data): one spatial axis is assumed to
//!   carry a uniform noise profile; every slab along it is an independent
//!   block, producing per-slab `(sigma, N)` and a full-volume noise mask.
//! - **Window mode** (noise maps): a small cubic window slides over the
//!   volume, either at every voxel offset (overlapping, averaged) or on a
//!   disjoint grid (subsampled, upsampled back to full resolution).
//!
//! Blocks never share mutable state: the volume and exclusion mask are
//! read-only views, each work unit writes its own result slot, and the only
//! synchronization point is the sequential gather after the parallel map.
//! A block that degenerates to the `(0, 0)` sentinel contributes zeros and an
//! empty mask at its location; it never aborts the run.

use log::{info, warn};
use ndarray::{s, Array1, Array2, Array3, ArrayView3, ArrayView4, Axis};
use rayon::prelude::*;

use crate::distribution::{fit_noise_distribution, FitMethod};
use crate::estimator::{estimate_block, BlockEstimate, EstimatorOpts};
use crate::patches::Patches;
use crate::utils::{
    broadcast_axis_profile, median_of_slice, median_with_positive_fallback, zoom3_linear,
};

// =============================================================================
// Constants
// =============================================================================

/// Default edge length of the cubic estimation window in noise-map mode.
const DEFAULT_WINDOW_SIZE: usize = 5;

/// Default slab axis for slice mode.
const DEFAULT_AXIS: usize = 2;

/// Repeat count above which the whole-volume median gets expensive enough to
/// suggest the fast per-repeat-median path.
const FAST_MEDIAN_HINT_REPEATS: usize = 100;

// =============================================================================
// Types
// =============================================================================

/// Configuration shared by both orchestration modes.
///
/// Numeric tolerances live in [`EstimatorOpts`]; everything here is validated
/// before any parallel work is dispatched.
#[derive(Debug, Clone)]
pub struct NoiseEstimateConfig {
    /// Spatial axis (0, 1 or 2) assumed to carry a uniform noise profile.
    pub axis: usize,
    /// Parameter-estimation method.
    pub method: FitMethod,
    /// Edge length of the cubic window in noise-map mode.
    pub size: usize,
    /// Run the full classify/refit loop inside each window instead of a
    /// single direct fit over all window samples.
    pub use_rejection: bool,
    /// Seed the sigma guess from the median of per-repeat medians instead of
    /// one whole-volume median.
    pub fast_median: bool,
    /// Worker threads for the parallel map; `None` uses the ambient pool.
    pub workers: Option<usize>,
    /// Estimator tolerances and bounds.
    pub opts: EstimatorOpts,
}

impl Default for NoiseEstimateConfig {
    fn default() -> Self {
        Self {
            axis: DEFAULT_AXIS,
            method: FitMethod::default(),
            size: DEFAULT_WINDOW_SIZE,
            use_rejection: false,
            fast_median: false,
            workers: None,
            opts: EstimatorOpts::default(),
        }
    }
}

impl NoiseEstimateConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate the configuration. Must pass before any block is dispatched.
    pub fn validate(&self) -> Result<(), String> {
        if self.axis > 2 {
            return Err(format!("axis must be 0, 1 or 2, got {}", self.axis));
        }
        if self.size == 0 {
            return Err("window size must be > 0".to_string());
        }
        if self.workers == Some(0) {
            return Err("workers must be > 0 when specified".to_string());
        }
        self.opts.validate()
    }
}

/// Per-block diagnostic handed to the progress observer: which block finished,
/// its estimate, and whether the loop actually converged (the non-convergence
/// diagnostic that does not change the return contract).
#[derive(Debug, Clone, Copy)]
pub struct BlockReport {
    pub index: usize,
    pub sigma: f64,
    pub n: f64,
    pub iterations: usize,
    pub converged: bool,
}

/// Progress observer injected into the orchestrator. Called once per finished
/// block, from worker threads.
pub type BlockObserver<'a> = &'a (dyn Fn(BlockReport) + Sync);

/// Slice-mode result: per-slab scalars along the chosen axis plus the
/// full-volume noise mask.
#[derive(Debug, Clone)]
pub struct SliceEstimate {
    pub sigma: Array1<f64>,
    pub n: Array1<f64>,
    pub mask: Array3<bool>,
    axis: usize,
}

impl SliceEstimate {
    /// Broadcast the per-slab scalars to full volume shape for a result sink
    /// that expects volume-shaped sigma and N.
    pub fn into_volume(self) -> (Array3<f64>, Array3<f64>, Array3<bool>) {
        let shape = self.mask.dim();
        let sigma = broadcast_axis_profile(&self.sigma, self.axis, shape);
        let n = broadcast_axis_profile(&self.n, self.axis, shape);
        (sigma, n, self.mask)
    }
}

// =============================================================================
// Median Seeds
// =============================================================================

fn volume_median(data: ArrayView4<f64>) -> f64 {
    let mut values: Vec<f64> = data.iter().copied().collect();
    median_with_positive_fallback(&mut values)
}

/// Median of per-repeat medians. Avoids holding a sorted copy of the whole
/// volume at once on large multi-repeat acquisitions.
fn median_of_repeat_medians(data: ArrayView4<f64>) -> f64 {
    let nk = data.dim().3;
    let mut medians: Vec<f64> = (0..nk)
        .map(|q| {
            let mut chunk: Vec<f64> = data.index_axis(Axis(3), q).iter().copied().collect();
            median_with_positive_fallback(&mut chunk)
        })
        .collect();
    median_of_slice(&mut medians)
}

// =============================================================================
// Worker Pool
// =============================================================================

/// Run `job` on the ambient rayon pool, or on a dedicated pool of the
/// requested width. Results are identical either way: work units are
/// order-independent and written by position.
fn run_with_pool<T: Send>(
    workers: Option<usize>,
    job: impl FnOnce() -> T + Send,
) -> Result<T, String> {
    match workers {
        None => Ok(job()),
        Some(threads) => {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(threads)
                .build()
                .map_err(|e| format!("failed to build worker pool: {}", e))?;
            Ok(pool.install(job))
        }
    }
}

// =============================================================================
// Slice Mode
// =============================================================================

/// Estimate `(sigma, N)` per slab along `config.axis` of a diffusion-weighted
/// volume, plus the full-volume noise mask.
///
/// Slabs are fully independent and processed as a parallel map; the observer,
/// when provided, receives one [`BlockReport`] per finished slab.
pub fn estimate_from_dwis(
    data: ArrayView4<f64>,
    exclude: Option<ArrayView3<bool>>,
    config: &NoiseEstimateConfig,
    observer: Option<BlockObserver>,
) -> Result<SliceEstimate, String> {
    config.validate()?;

    let (nx, ny, nz, nk) = data.dim();
    if let Some(ex) = exclude {
        if ex.dim() != (nx, ny, nz) {
            return Err(format!(
                "exclusion mask shape {:?} does not match volume spatial shape {:?}",
                ex.dim(),
                (nx, ny, nz)
            ));
        }
    }

    if !config.fast_median && nk > FAST_MEDIAN_HINT_REPEATS {
        warn!(
            "computing one median over {} repeats; consider fast_median to bound memory",
            nk
        );
    }
    let median = if config.fast_median {
        median_of_repeat_medians(data)
    } else {
        volume_median(data)
    };

    let axis = config.axis;
    let extent = [nx, ny, nz][axis];
    info!(
        "estimating {} slabs along axis {} with method = {}",
        extent, axis, config.method
    );

    let results: Vec<BlockEstimate> = run_with_pool(config.workers, || {
        (0..extent)
            .into_par_iter()
            .map(|i| {
                let slab = data.index_axis(Axis(axis), i);
                let (d1, d2, k) = slab.dim();

                let block =
                    Array2::from_shape_fn((d1 * d2, k), |(v, q)| slab[[v / d2, v % d2, q]]);
                let slab_exclude = exclude.map(|ex| {
                    let ex_slab = ex.index_axis(Axis(axis), i);
                    Array1::from_shape_fn(d1 * d2, |v| ex_slab[[v / d2, v % d2]])
                });

                let est = estimate_block(
                    block.view(),
                    median,
                    slab_exclude.as_ref(),
                    config.method,
                    &config.opts,
                );
                if let Some(report) = observer {
                    report(BlockReport {
                        index: i,
                        sigma: est.sigma,
                        n: est.n,
                        iterations: est.iterations,
                        converged: est.converged,
                    });
                }
                est
            })
            .collect()
    })?;

    // Sequential gather: write every slab result by position
    let mut sigma = Array1::zeros(extent);
    let mut n_out = Array1::zeros(extent);
    let mut mask = Array3::from_elem((nx, ny, nz), false);

    for (i, est) in results.into_iter().enumerate() {
        sigma[i] = est.sigma;
        n_out[i] = est.n;

        let mut mask_slab = mask.index_axis_mut(Axis(axis), i);
        let (d1, d2) = mask_slab.dim();
        for a in 0..d1 {
            for b in 0..d2 {
                mask_slab[[a, b]] = est.mask[a * d2 + b];
            }
        }
    }

    Ok(SliceEstimate {
        sigma,
        n: n_out,
        mask,
        axis,
    })
}

// =============================================================================
// Window Mode
// =============================================================================

/// Fit one cubic window. `block` is `(size^3, K)`.
///
/// Without rejection this is a single direct fit over every sample in the
/// window, with an all-true voxel mask on success. With rejection the full
/// classify/refit loop runs over the window's samples taken individually; a
/// voxel is kept when any of its repeats is accepted.
fn fit_window(block: &Array2<f64>, median: f64, config: &NoiseEstimateConfig) -> BlockEstimate {
    let (n_vox, k) = block.dim();

    if config.use_rejection {
        let column = Array2::from_shape_fn((n_vox * k, 1), |(i, _)| block[[i / k, i % k]]);
        let est = estimate_block(column.view(), median, None, config.method, &config.opts);

        let voxel_mask = Array1::from_shape_fn(n_vox, |v| (0..k).any(|q| est.mask[v * k + q]));
        BlockEstimate {
            mask: voxel_mask,
            ..est
        }
    } else {
        let samples: Vec<f64> = block.iter().copied().collect();
        let (sigma, n) = fit_noise_distribution(&samples, config.method);
        let ok = sigma != 0.0 && n != 0.0;
        BlockEstimate {
            sigma,
            n,
            mask: Array1::from_elem(n_vox, ok),
            iterations: 1,
            converged: ok,
        }
    }
}

fn flatten_window(
    patches: &Patches<'_, f64>,
    pos: &[usize; 3],
    size: usize,
    nk: usize,
) -> Array2<f64> {
    let win = patches.get(&[pos[0], pos[1], pos[2], 0]);
    Array2::from_shape_fn((size * size * size, nk), |(v, q)| {
        win[[v / (size * size), (v / size) % size, v % size, q]]
    })
}

fn check_window_fits(size: usize, dims: (usize, usize, usize)) -> Result<(), String> {
    let (nx, ny, nz) = dims;
    if size > nx.min(ny).min(nz) {
        return Err(format!(
            "window size {} exceeds volume extents ({}, {}, {})",
            size, nx, ny, nz
        ));
    }
    Ok(())
}

/// Estimate over noise maps with a window at every voxel offset.
///
/// Each window's scalars accumulate over the voxels of its contribution
/// region (anchored half a window in from its origin) and are averaged by the
/// per-voxel contribution count afterwards. The returned mask holds the
/// occupancy count of the last window covering each voxel (the number of
/// voxels the window itself classified as noise), not a boolean.
pub fn estimate_from_nmaps_overlapping(
    data: ArrayView4<f64>,
    config: &NoiseEstimateConfig,
    observer: Option<BlockObserver>,
) -> Result<(Array3<f64>, Array3<f64>, Array3<i32>), String> {
    config.validate()?;

    let (nx, ny, nz, nk) = data.dim();
    let size = config.size;
    check_window_fits(size, (nx, ny, nz))?;

    let median = volume_median(data);
    info!(
        "estimating over noise maps with a window of size {} and overlapping windows",
        size
    );

    let patches = Patches::new(data.into_dyn(), &[size, size, size, nk], &[1, 1, 1, nk])?;
    let positions: Vec<[usize; 3]> = patches
        .indices()
        .map(|idx| [idx[0], idx[1], idx[2]])
        .collect();

    let results: Vec<BlockEstimate> = run_with_pool(config.workers, || {
        positions
            .par_iter()
            .enumerate()
            .map(|(i, pos)| {
                let block = flatten_window(&patches, pos, size, nk);
                let est = fit_window(&block, median, config);
                if let Some(report) = observer {
                    report(BlockReport {
                        index: i,
                        sigma: est.sigma,
                        n: est.n,
                        iterations: est.iterations,
                        converged: est.converged,
                    });
                }
                est
            })
            .collect()
    })?;

    let mut sigma = Array3::<f64>::zeros((nx, ny, nz));
    let mut n_out = Array3::<f64>::zeros((nx, ny, nz));
    let mut count = Array3::<f64>::zeros((nx, ny, nz));
    let mut mask = Array3::<i32>::zeros((nx, ny, nz));

    let half = size / 2;
    for (pos, est) in positions.iter().zip(results.into_iter()) {
        let occupancy = est.mask.iter().filter(|&&b| b).count() as i32;

        // Contribution region: anchored at the window center, clipped at the
        // far volume boundary
        let (x0, y0, z0) = (pos[0] + half, pos[1] + half, pos[2] + half);
        let (x1, y1, z1) = (
            (x0 + size).min(nx),
            (y0 + size).min(ny),
            (z0 + size).min(nz),
        );
        let region = s![x0..x1, y0..y1, z0..z1];

        sigma.slice_mut(region).map_inplace(|v| *v += est.sigma);
        n_out.slice_mut(region).map_inplace(|v| *v += est.n);
        count.slice_mut(region).map_inplace(|v| *v += 1.0);
        mask.slice_mut(region).fill(occupancy);
    }

    // Average over the overlap; voxels no window reached stay zero
    for ((s_val, n_val), &c) in sigma.iter_mut().zip(n_out.iter_mut()).zip(count.iter()) {
        if c > 0.0 {
            *s_val /= c;
            *n_val /= c;
        }
    }

    Ok((sigma, n_out, mask))
}

/// Estimate over noise maps with disjoint windows on a coarse grid.
///
/// Per-window scalars are broadcast to the window for the mask, and the
/// coarse scalar grids are upsampled back to full resolution with order-1
/// interpolation; the ragged remainder past the last full window stays zero.
pub fn estimate_from_nmaps_subsampled(
    data: ArrayView4<f64>,
    config: &NoiseEstimateConfig,
    observer: Option<BlockObserver>,
) -> Result<(Array3<f64>, Array3<f64>, Array3<bool>), String> {
    config.validate()?;

    let (nx, ny, nz, nk) = data.dim();
    let size = config.size;
    check_window_fits(size, (nx, ny, nz))?;

    let median = volume_median(data);
    info!(
        "estimating over noise maps with a window of size {} and non-overlapping windows",
        size
    );

    let patches = Patches::new(
        data.into_dyn(),
        &[size, size, size, nk],
        &[size, size, size, nk],
    )?;
    let grid = patches.grid_shape().to_vec();
    let (gx, gy, gz) = (grid[0], grid[1], grid[2]);
    let positions: Vec<[usize; 3]> = patches
        .indices()
        .map(|idx| [idx[0], idx[1], idx[2]])
        .collect();

    let results: Vec<BlockEstimate> = run_with_pool(config.workers, || {
        positions
            .par_iter()
            .enumerate()
            .map(|(i, pos)| {
                let block = flatten_window(&patches, pos, size, nk);
                let est = fit_window(&block, median, config);
                if let Some(report) = observer {
                    report(BlockReport {
                        index: i,
                        sigma: est.sigma,
                        n: est.n,
                        iterations: est.iterations,
                        converged: est.converged,
                    });
                }
                est
            })
            .collect()
    })?;

    let mut coarse_sigma = Array3::<f64>::zeros((gx, gy, gz));
    let mut coarse_n = Array3::<f64>::zeros((gx, gy, gz));
    let mut mask = Array3::from_elem((nx, ny, nz), false);

    for (pos, est) in positions.iter().zip(results.into_iter()) {
        coarse_sigma[[pos[0], pos[1], pos[2]]] = est.sigma;
        coarse_n[[pos[0], pos[1], pos[2]]] = est.n;

        let (x0, y0, z0) = (pos[0] * size, pos[1] * size, pos[2] * size);
        let mut region = mask.slice_mut(s![x0..x0 + size, y0..y0 + size, z0..z0 + size]);
        for a in 0..size {
            for b in 0..size {
                for c in 0..size {
                    region[[a, b, c]] = est.mask[(a * size + b) * size + c];
                }
            }
        }
    }

    // Upsample the coarse grids into the covered region of the full volume
    let (ux, uy, uz) = (gx * size, gy * size, gz * size);
    let mut sigma = Array3::<f64>::zeros((nx, ny, nz));
    let mut n_out = Array3::<f64>::zeros((nx, ny, nz));
    sigma
        .slice_mut(s![..ux, ..uy, ..uz])
        .assign(&zoom3_linear(coarse_sigma.view(), size));
    n_out
        .slice_mut(s![..ux, ..uy, ..uz])
        .assign(&zoom3_linear(coarse_n.view(), size));

    Ok((sigma, n_out, mask))
}
