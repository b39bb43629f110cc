//! Calibration of the noise multiplier against a privacy budget.

use dp_engine_core::{DpError, Result};

use crate::conversion::get_privacy_spent;
use crate::rdp::{compose_steps, compute_rdp};

/// Largest noise multiplier tried before giving up.
const MAX_NOISE_MULTIPLIER: f64 = 1e6;

/// Epsilon spent after `steps` steps of the subsampled Gaussian mechanism.
pub fn epsilon_for(
    noise_multiplier: f64,
    target_delta: f64,
    sample_rate: f64,
    steps: u64,
    alphas: &[f64],
) -> Result<f64> {
    let rdp = compute_rdp(sample_rate, noise_multiplier, 1.0, alphas)?;
    let (eps, _) = get_privacy_spent(alphas, &compose_steps(&rdp, steps), target_delta)?;
    Ok(eps)
}

/// Smallest noise multiplier (up to `tol`) keeping epsilon at or below the target.
///
/// The upper bracket is doubled from 1 until the target is met, then the
/// bracket is bisected. The returned value always satisfies the target.
pub fn calibrate_noise_multiplier(
    target_epsilon: f64,
    target_delta: f64,
    sample_rate: f64,
    steps: u64,
    alphas: &[f64],
    tol: f64,
) -> Result<f64> {
    if !target_epsilon.is_finite() || target_epsilon <= 0.0 {
        return Err(DpError::invalid(format!(
            "target epsilon must be finite and positive, got {target_epsilon}"
        )));
    }
    if !tol.is_finite() || tol <= 0.0 {
        return Err(DpError::invalid(format!("tolerance must be positive, got {tol}")));
    }

    let epsilon_at = |nm: f64| epsilon_for(nm, target_delta, sample_rate, steps, alphas);

    let mut lo = 0.0;
    let mut hi = 1.0;
    while epsilon_at(hi)? > target_epsilon {
        lo = hi;
        hi *= 2.0;
        if hi > MAX_NOISE_MULTIPLIER {
            return Err(DpError::numerical(format!(
                "no noise multiplier up to {MAX_NOISE_MULTIPLIER} reaches epsilon {target_epsilon}"
            )));
        }
    }

    // Bisect for the smallest multiplier with epsilon <= target.
    for _ in 0..200 {
        if hi - lo <= tol {
            break;
        }
        let mid = 0.5 * (lo + hi);
        if epsilon_at(mid)? <= target_epsilon {
            hi = mid;
        } else {
            lo = mid;
        }
    }

    Ok(hi)
}
