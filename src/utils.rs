//! Shared numeric helpers for medians, upsampling and axis broadcasting.

use ndarray::{Array1, Array3, ArrayView3};

/// Median of a mutable slice in O(n) via `select_nth_unstable`.
/// Even-length inputs average the two middle elements.
pub fn median_of_slice(data: &mut [f64]) -> f64 {
    let len = data.len();
    if len == 0 {
        return 0.0;
    }
    let mid = len / 2;

    let (_, &mut median, _) = data.select_nth_unstable_by(mid, |a, b| a.total_cmp(b));

    if len % 2 == 1 {
        median
    } else {
        // select_nth_unstable left everything <= median before mid
        let prev = data[..mid]
            .iter()
            .fold(f64::NEG_INFINITY, |a, &b| if b > a { b } else { a });
        (prev + median) / 2.0
    }
}

/// Median of `values`, substituting the median of the strictly-positive
/// entries when the plain median lands on zero (masked volumes have large
/// zero-filled regions that would otherwise swamp the estimate).
pub fn median_with_positive_fallback(values: &mut Vec<f64>) -> f64 {
    let median = median_of_slice(values);

    if median == 0.0 {
        let mut positives: Vec<f64> = values.iter().copied().filter(|&x| x > 0.0).collect();
        if positives.is_empty() {
            return 0.0;
        }
        return median_of_slice(&mut positives);
    }
    median
}

/// Upsample a 3-D scalar field by an integer factor with trilinear
/// interpolation. Output extent is `input * factor` per axis; sample
/// coordinates are endpoint-aligned, so the first and last input samples map
/// onto the first and last output samples.
pub fn zoom3_linear(coarse: ArrayView3<f64>, factor: usize) -> Array3<f64> {
    let (nx, ny, nz) = coarse.dim();
    let (ox, oy, oz) = (nx * factor, ny * factor, nz * factor);

    // Endpoint-aligned source coordinate for output index i along an axis.
    let src_coord = |i: usize, in_len: usize, out_len: usize| -> f64 {
        if out_len <= 1 || in_len <= 1 {
            0.0
        } else {
            i as f64 * (in_len - 1) as f64 / (out_len - 1) as f64
        }
    };

    Array3::from_shape_fn((ox, oy, oz), |(i, j, k)| {
        let x = src_coord(i, nx, ox);
        let y = src_coord(j, ny, oy);
        let z = src_coord(k, nz, oz);

        let (x0, y0, z0) = (x.floor() as usize, y.floor() as usize, z.floor() as usize);
        let (x1, y1, z1) = (
            (x0 + 1).min(nx - 1),
            (y0 + 1).min(ny - 1),
            (z0 + 1).min(nz - 1),
        );
        let (fx, fy, fz) = (x - x0 as f64, y - y0 as f64, z - z0 as f64);

        let lerp = |a: f64, b: f64, t: f64| a + (b - a) * t;

        let c00 = lerp(coarse[[x0, y0, z0]], coarse[[x1, y0, z0]], fx);
        let c10 = lerp(coarse[[x0, y1, z0]], coarse[[x1, y1, z0]], fx);
        let c01 = lerp(coarse[[x0, y0, z1]], coarse[[x1, y0, z1]], fx);
        let c11 = lerp(coarse[[x0, y1, z1]], coarse[[x1, y1, z1]], fx);

        let c0 = lerp(c00, c10, fy);
        let c1 = lerp(c01, c11, fy);

        lerp(c0, c1, fz)
    })
}

/// Broadcast a 1-D per-slab profile to a full 3-D volume along `axis`.
pub fn broadcast_axis_profile(
    profile: &Array1<f64>,
    axis: usize,
    shape: (usize, usize, usize),
) -> Array3<f64> {
    Array3::from_shape_fn(shape, |idx| {
        let i = match axis {
            0 => idx.0,
            1 => idx.1,
            _ => idx.2,
        };
        profile[i]
    })
}
