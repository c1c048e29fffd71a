//! Gamma-distribution parameter estimation for magnitude noise.
//!
//! Background magnitude samples `x` satisfy `x^2 / (2 sigma^2) ~ Gamma(N, 1)`,
//! where `sigma` is the underlying Gaussian noise standard deviation and `N`
//! the effective number of coils. This module recovers `(sigma, N)` from a
//! bag of samples via either raw moments or maximum likelihood, and hosts the
//! digamma-inversion and quantile helpers the estimation loop relies on.

use statrs::distribution::{ContinuousCDF, Gamma};
use statrs::function::gamma::digamma;
use std::str::FromStr;

// =============================================================================
// Constants
// =============================================================================

/// Absolute step tolerance for the Newton root-finders.
const NEWTON_EPS: f64 = 1e-8;

/// Iteration budget for the Newton root-finders. The last iterate is
/// returned when the budget runs out; no convergence failure is signaled.
const NEWTON_MAX_ITER: usize = 100;

/// Floor applied to gamma quantiles, standing in for values where the
/// quantile is undefined (zero shape) or numerically degenerate.
const QUANTILE_FLOOR: f64 = 1e-7;

/// Switch point for the `inv_digamma` initial guess.
const INV_DIGAMMA_GUESS_SPLIT: f64 = -2.22;

/// Argument above which the trigamma asymptotic series is accurate.
const TRIGAMMA_SERIES_MIN: f64 = 6.0;

// =============================================================================
// Types
// =============================================================================

/// Parameter-estimation method for the distribution fitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FitMethod {
    /// Closed-form estimates from the second and fourth raw moments.
    #[default]
    Moments,
    /// Maximum likelihood via Newton root-finding on the gamma likelihood.
    Maxlk,
}

impl FromStr for FitMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "moments" => Ok(FitMethod::Moments),
            "maxlk" => Ok(FitMethod::Maxlk),
            other => Err(format!("Invalid method name {}", other)),
        }
    }
}

impl std::fmt::Display for FitMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FitMethod::Moments => write!(f, "moments"),
            FitMethod::Maxlk => write!(f, "maxlk"),
        }
    }
}

// =============================================================================
// Special Functions
// =============================================================================

/// Trigamma function psi'(x) for x > 0.
///
/// Upward recurrence `psi'(x) = psi'(x+1) + 1/x^2` until the argument is
/// large enough for the asymptotic series.
pub fn trigamma(x: f64) -> f64 {
    if x <= 0.0 || !x.is_finite() {
        return f64::NAN;
    }

    let mut x = x;
    let mut acc = 0.0;
    while x < TRIGAMMA_SERIES_MIN {
        acc += 1.0 / (x * x);
        x += 1.0;
    }

    // psi'(x) ~ 1/x + 1/(2x^2) + 1/(6x^3) - 1/(30x^5) + 1/(42x^7) - 1/(30x^9)
    let inv = 1.0 / x;
    let inv2 = inv * inv;
    let series = inv
        + 0.5 * inv2
        + inv * inv2
            * (1.0 / 6.0 - inv2 * (1.0 / 30.0 - inv2 * (1.0 / 42.0 - inv2 / 30.0)));

    acc + series
}

/// Numerical inverse of the digamma function by Newton root-finding.
///
/// The initial guess follows the usual two-regime approximation: `exp(y)+0.5`
/// on the right branch, `-1/(y - psi(1))` close to the pole at zero.
pub fn inv_digamma(y: f64) -> f64 {
    let mut xold = if y >= INV_DIGAMMA_GUESS_SPLIT {
        y.exp() + 0.5
    } else {
        -1.0 / (y - digamma(1.0))
    };
    let mut xnew = xold;

    for _ in 0..NEWTON_MAX_ITER {
        xnew = xold - (digamma(xold) - y) / trigamma(xold);

        if (xold - xnew).abs() < NEWTON_EPS {
            break;
        }
        xold = xnew;
    }

    xnew
}

/// Quantile of the unit-rate gamma distribution: the inverse of the
/// regularized lower incomplete gamma function in its shape argument.
///
/// Degenerate shapes (zero, NaN) and non-finite quantiles collapse to a small
/// positive floor rather than an error, matching how the classification
/// thresholds treat voxels with no usable repeats.
pub fn gamma_quantile(shape: f64, p: f64) -> f64 {
    if !shape.is_finite() || shape <= 0.0 {
        return QUANTILE_FLOOR;
    }

    match Gamma::new(shape, 1.0) {
        Ok(dist) => {
            let q = dist.inverse_cdf(p);
            if q.is_finite() {
                q.max(QUANTILE_FLOOR)
            } else {
                QUANTILE_FLOOR
            }
        }
        Err(_) => QUANTILE_FLOOR,
    }
}

// =============================================================================
// Fitting
// =============================================================================

/// Maximum-likelihood estimate of sigma from gamma-distributed magnitudes.
///
/// Newton iteration on
/// `f(s) = psi(S / (2 K s^2)) - (1/K) sum(ln x^2) + ln(2 s^2)`
/// with the derivative expressed through the trigamma function. Starts from
/// the sample standard deviation and returns the last iterate after at most
/// [`NEWTON_MAX_ITER`] steps; there is no divergence guard.
pub fn maxlk_sigma(samples: &[f64]) -> f64 {
    let k = samples.len() as f64;
    let sum_m2: f64 = samples.iter().map(|&x| x * x).sum();
    let sum_log_m2: f64 = samples.iter().map(|&x| (x * x).ln()).sum();

    let f = |s: f64| digamma(sum_m2 / (2.0 * k * s * s)) - sum_log_m2 / k + (2.0 * s * s).ln();
    let fprime = |s: f64| {
        -sum_m2 * trigamma(sum_m2 / (2.0 * k * s * s)) / (k * s * s * s) + 2.0 / s
    };

    // Population standard deviation as the starting point
    let mean = samples.iter().sum::<f64>() / k;
    let var = samples.iter().map(|&x| (x - mean) * (x - mean)).sum::<f64>() / k;
    let mut xold = var.sqrt();
    let mut xnew = xold;

    for _ in 0..NEWTON_MAX_ITER {
        xnew = xold - f(xold) / fprime(xold);

        if (xold - xnew).abs() < NEWTON_EPS {
            break;
        }
        xold = xnew;
    }

    xnew
}

/// Estimate `(sigma, N)` from a bag of gamma-distributed magnitude samples.
///
/// Non-positive and non-finite entries are dropped first: only strictly
/// positive magnitudes are valid observations. An empty or zero-variance
/// remainder returns the `(0.0, 0.0)` sentinel, the expected outcome for
/// degenerate blocks rather than an error.
pub fn fit_noise_distribution(samples: &[f64], method: FitMethod) -> (f64, f64) {
    let data: Vec<f64> = samples.iter().copied().filter(|&x| x > 0.0).collect();

    if data.is_empty() {
        return (0.0, 0.0);
    }

    let k = data.len() as f64;
    let mean = data.iter().sum::<f64>() / k;
    let var = data.iter().map(|&x| (x - mean) * (x - mean)).sum::<f64>() / k;
    if var == 0.0 {
        return (0.0, 0.0);
    }

    let sigma = match method {
        FitMethod::Moments => {
            let m2 = data.iter().map(|&x| x * x).sum::<f64>() / k;
            let m4 = data.iter().map(|&x| x * x * x * x).sum::<f64>() / k;
            (m4 / m2 - m2).sqrt() / std::f64::consts::SQRT_2
        }
        FitMethod::Maxlk => maxlk_sigma(&data),
    };

    let n = match method {
        FitMethod::Moments => {
            data.iter().map(|&x| x * x / (2.0 * sigma * sigma)).sum::<f64>() / k
        }
        FitMethod::Maxlk => {
            let y = data
                .iter()
                .map(|&x| (x * x / (2.0 * sigma * sigma)).ln())
                .sum::<f64>()
                / k;
            inv_digamma(y)
        }
    };

    (sigma, n)
}
