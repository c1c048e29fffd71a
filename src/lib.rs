//! Noise Distribution Estimation Library
//!
//! Pure Rust implementation of automated noise characterization for magnitude
//! MR data. Magnitude samples over background voxels follow a gamma /
//! noncentral-chi family; this crate estimates the underlying Gaussian noise
//! scale (sigma) and effective coil count (N) per slice or per local window,
//! along with a mask of the voxels identified as pure noise.

pub mod distribution;
pub mod estimator;
pub mod orchestration;
pub mod patches;
pub mod utils;

// Re-export commonly used types at the crate root
pub use distribution::{fit_noise_distribution, gamma_quantile, inv_digamma, trigamma, FitMethod};
pub use estimator::{estimate_block, BlockEstimate, EstimatorOpts};
pub use orchestration::{
    estimate_from_dwis, estimate_from_nmaps_overlapping, estimate_from_nmaps_subsampled,
    BlockObserver, BlockReport, NoiseEstimateConfig, SliceEstimate,
};
pub use patches::Patches;
