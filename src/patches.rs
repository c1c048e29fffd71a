//! N-dimensional patch extraction over strided views.
//!
//! `Patches` enumerates fixed-size sub-blocks of an n-dimensional array on a
//! regular grid: the grid indexes patch position, each grid cell resolves to a
//! borrowed view of patch content. Construction is O(1): only the grid shape
//! is computed, and no data is copied until a patch is materialized through
//! [`Patches::flatten`].

use ndarray::{ArrayD, ArrayViewD, Slice};

/// Lazy patch grid over a borrowed n-dimensional array.
///
/// The grid extent along axis `i` is `(extent_i - patch_i) / step_i + 1`,
/// so a patch/step pair that does not divide the extent cleanly simply stops
/// short of the trailing remainder.
#[derive(Debug)]
pub struct Patches<'a, A> {
    source: ArrayViewD<'a, A>,
    patch_shape: Vec<usize>,
    step: Vec<usize>,
    grid: Vec<usize>,
}

impl<'a, A> Patches<'a, A> {
    /// Build a patch grid over `source`.
    ///
    /// Fails when `patch_shape` or `step` does not match the array rank, when
    /// any step is zero, or when a patch exceeds the array extent along any
    /// axis (a zero patch count is a caller error, not silently clamped).
    pub fn new(
        source: ArrayViewD<'a, A>,
        patch_shape: &[usize],
        step: &[usize],
    ) -> Result<Self, String> {
        let rank = source.ndim();

        if patch_shape.len() != rank {
            return Err(format!(
                "patch shape rank {} does not match array rank {}",
                patch_shape.len(),
                rank
            ));
        }
        if step.len() != rank {
            return Err(format!(
                "extraction step rank {} does not match array rank {}",
                step.len(),
                rank
            ));
        }
        if let Some(axis) = step.iter().position(|&s| s == 0) {
            return Err(format!("extraction step is zero along axis {}", axis));
        }
        if patch_shape.contains(&0) {
            return Err("patch shape must be strictly positive along every axis".to_string());
        }

        let mut grid = Vec::with_capacity(rank);
        for (axis, ((&extent, &patch), &st)) in source
            .shape()
            .iter()
            .zip(patch_shape.iter())
            .zip(step.iter())
            .enumerate()
        {
            if patch > extent {
                return Err(format!(
                    "patch extent {} exceeds array extent {} along axis {}",
                    patch, extent, axis
                ));
            }
            grid.push((extent - patch) / st + 1);
        }

        Ok(Self {
            source,
            patch_shape: patch_shape.to_vec(),
            step: step.to_vec(),
            grid,
        })
    }

    /// Shape of the patch-position grid (first n logical dimensions).
    pub fn grid_shape(&self) -> &[usize] {
        &self.grid
    }

    /// Total number of patches in the grid.
    pub fn num_patches(&self) -> usize {
        self.grid.iter().product()
    }

    /// Borrowed view of the patch at grid position `index`. No copy.
    ///
    /// Panics if `index` is out of the grid (internal callers always iterate
    /// the grid returned by [`Patches::indices`]).
    pub fn get(&self, index: &[usize]) -> ArrayViewD<'_, A> {
        assert_eq!(index.len(), self.grid.len(), "patch index rank mismatch");

        self.source.slice_each_axis(|ax| {
            let axis = ax.axis.index();
            debug_assert!(index[axis] < self.grid[axis], "patch index out of grid");
            let start = (index[axis] * self.step[axis]) as isize;
            Slice::new(start, Some(start + self.patch_shape[axis] as isize), 1)
        })
    }

    /// Row-major enumeration of all grid positions.
    pub fn indices(&self) -> PatchIndices {
        PatchIndices {
            grid: self.grid.clone(),
            next: Some(vec![0; self.grid.len()]),
        }
    }

    /// Materialize every patch into an owned array, in grid row-major order.
    /// This is the flatten mode: the single place a copy happens.
    pub fn flatten(&self) -> Vec<ArrayD<A>>
    where
        A: Clone,
    {
        self.indices()
            .map(|idx| self.get(&idx).to_owned())
            .collect()
    }
}

/// Odometer iterator over patch grid positions, last axis fastest.
pub struct PatchIndices {
    grid: Vec<usize>,
    next: Option<Vec<usize>>,
}

impl Iterator for PatchIndices {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Vec<usize>> {
        let current = self.next.take()?;

        // Advance the odometer for the following call
        let mut advanced = current.clone();
        for axis in (0..advanced.len()).rev() {
            advanced[axis] += 1;
            if advanced[axis] < self.grid[axis] {
                self.next = Some(advanced);
                break;
            }
            advanced[axis] = 0;
        }

        Some(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{ArrayD, IxDyn};

    fn arange(shape: &[usize]) -> ArrayD<f64> {
        let len: usize = shape.iter().product();
        ArrayD::from_shape_vec(IxDyn(shape), (0..len).map(|i| i as f64).collect()).unwrap()
    }

    // ==================== Grid Shape Tests ====================

    #[test]
    fn test_grid_shape_1d() {
        // (extent, patch, step) -> expected grid
        let cases = [
            (vec![10], vec![1], vec![1], vec![10]),
            (vec![10], vec![2], vec![1], vec![9]),
            (vec![11], vec![3], vec![4], vec![3]),
            (vec![10], vec![8], vec![2], vec![2]),
        ];

        for (shape, patch, step, expected) in cases {
            let arr = arange(&shape);
            let patches = Patches::new(arr.view(), &patch, &step).unwrap();
            assert_eq!(
                patches.grid_shape(),
                expected.as_slice(),
                "grid mismatch for shape {:?} patch {:?} step {:?}",
                shape,
                patch,
                step
            );
        }
    }

    #[test]
    fn test_grid_shape_2d() {
        let cases = [
            (vec![10, 20], vec![2, 2], vec![5, 5], vec![2, 4]),
            (vec![10, 20], vec![10, 10], vec![3, 10], vec![1, 2]),
            (vec![10, 20], vec![10, 11], vec![3, 4], vec![1, 3]),
            (vec![11, 20], vec![6, 6], vec![4, 2], vec![2, 8]),
        ];

        for (shape, patch, step, expected) in cases {
            let arr = arange(&shape);
            let patches = Patches::new(arr.view(), &patch, &step).unwrap();
            assert_eq!(
                patches.grid_shape(),
                expected.as_slice(),
                "grid mismatch for shape {:?} patch {:?} step {:?}",
                shape,
                patch,
                step
            );
        }
    }

    #[test]
    fn test_grid_shape_3d() {
        let cases = [
            (vec![5, 4, 3], vec![2, 2, 3], vec![1, 2, 10], vec![4, 2, 1]),
            (vec![3, 3, 3], vec![2, 2, 2], vec![1, 1, 1], vec![2, 2, 2]),
            (vec![7, 8, 9], vec![1, 7, 3], vec![2, 1, 3], vec![4, 2, 3]),
            (vec![7, 8, 9], vec![1, 3, 3], vec![3, 3, 4], vec![3, 2, 2]),
        ];

        for (shape, patch, step, expected) in cases {
            let arr = arange(&shape);
            let patches = Patches::new(arr.view(), &patch, &step).unwrap();
            assert_eq!(
                patches.grid_shape(),
                expected.as_slice(),
                "grid mismatch for shape {:?} patch {:?} step {:?}",
                shape,
                patch,
                step
            );
        }
    }

    // ==================== Content Tests ====================

    #[test]
    fn test_last_patch_matches_source_slice() {
        // The final patch must align exactly with the corresponding source
        // slice, with no off-by-one drift, including non-divisible extents.
        let cases = [
            (vec![11], vec![3], vec![4]),
            (vec![10], vec![8], vec![2]),
            (vec![11, 20], vec![6, 6], vec![4, 2]),
            (vec![7, 8, 9], vec![1, 3, 3], vec![3, 3, 4]),
        ];

        for (shape, patch, step) in cases {
            let arr = arange(&shape);
            let patches = Patches::new(arr.view(), &patch, &step).unwrap();

            let last: Vec<usize> = patches.grid_shape().iter().map(|&g| g - 1).collect();
            let view = patches.get(&last);

            let expected = arr.slice_each_axis(|ax| {
                let a = ax.axis.index();
                let start = (last[a] * step[a]) as isize;
                Slice::new(start, Some(start + patch[a] as isize), 1)
            });

            assert_eq!(
                view, expected,
                "last patch drifted for shape {:?} patch {:?} step {:?}",
                shape, patch, step
            );
        }
    }

    #[test]
    fn test_first_patch_is_origin_corner() {
        let arr = arange(&[6, 6]);
        let patches = Patches::new(arr.view(), &[2, 3], &[2, 3]).unwrap();

        let first = patches.get(&[0, 0]);
        assert_eq!(first[[0, 0]], 0.0);
        assert_eq!(first[[0, 2]], 2.0);
        assert_eq!(first[[1, 0]], 6.0);
    }

    #[test]
    fn test_enumeration_covers_all_positions() {
        let arr = arange(&[4, 6]);
        let patches = Patches::new(arr.view(), &[2, 2], &[2, 2]).unwrap();

        let all: Vec<Vec<usize>> = patches.indices().collect();
        assert_eq!(all.len(), patches.num_patches());
        assert_eq!(all.len(), 6);
        assert_eq!(all[0], vec![0, 0]);
        assert_eq!(all[1], vec![0, 1]); // last axis fastest
        assert_eq!(all[5], vec![1, 2]);
    }

    #[test]
    fn test_flatten_materializes_every_patch() {
        let arr = arange(&[4, 4]);
        let patches = Patches::new(arr.view(), &[2, 2], &[2, 2]).unwrap();

        let flat = patches.flatten();
        assert_eq!(flat.len(), 4);
        assert_eq!(flat[0][[0, 0]], 0.0);
        assert_eq!(flat[3][[1, 1]], 15.0);
    }

    // ==================== Error Tests ====================

    #[test]
    fn test_rank_mismatch_rejected() {
        let arr = arange(&[4, 4]);

        let err = Patches::new(arr.view(), &[2], &[1, 1]).unwrap_err();
        assert!(
            err.contains("rank"),
            "error should name the rank mismatch: {}",
            err
        );

        let err = Patches::new(arr.view(), &[2, 2], &[1]).unwrap_err();
        assert!(err.contains("rank"), "step rank mismatch: {}", err);
    }

    #[test]
    fn test_zero_step_rejected() {
        let arr = arange(&[4, 4]);
        let err = Patches::new(arr.view(), &[2, 2], &[1, 0]).unwrap_err();
        assert!(
            err.contains("axis 1"),
            "error should name the offending axis: {}",
            err
        );
    }

    #[test]
    fn test_oversized_patch_rejected() {
        let arr = arange(&[4, 4]);
        let err = Patches::new(arr.view(), &[5, 2], &[1, 1]).unwrap_err();
        assert!(
            err.contains("exceeds"),
            "oversized patch should be a caller error: {}",
            err
        );
    }

    #[test]
    fn test_patch_equals_extent_single_cell() {
        let arr = arange(&[4, 4]);
        let patches = Patches::new(arr.view(), &[4, 4], &[1, 1]).unwrap();
        assert_eq!(patches.grid_shape(), &[1, 1]);
        assert_eq!(patches.get(&[0, 0]), arr.view());
    }
}
