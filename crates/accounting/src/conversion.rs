//! Conversion of accumulated RDP into (epsilon, delta) guarantees.

use dp_engine_core::{DpError, Result};

use crate::rdp::check_alphas;

fn check_lengths(alphas: &[f64], rdp: &[f64]) -> Result<()> {
    check_alphas(alphas)?;
    if alphas.len() != rdp.len() {
        return Err(DpError::invalid(format!(
            "{} orders but {} RDP values",
            alphas.len(),
            rdp.len()
        )));
    }
    Ok(())
}

/// Pick the smallest non-NaN candidate and its order.
fn argmin(alphas: &[f64], candidates: impl Iterator<Item = f64>) -> Result<(f64, f64)> {
    candidates
        .zip(alphas.iter().copied())
        .filter(|(v, _)| !v.is_nan())
        .fold(None, |best: Option<(f64, f64)>, (v, a)| match best {
            Some((b, _)) if b <= v => best,
            _ => Some((v, a)),
        })
        .ok_or_else(|| DpError::numerical("every order produced NaN"))
}

/// Tightest epsilon for a total RDP vector at failure probability `target_delta`.
///
/// Returns `(epsilon, best_alpha)` where
/// `epsilon = min over alpha of rdp(alpha) + ln(1/delta) / (alpha - 1)`.
pub fn get_privacy_spent(alphas: &[f64], rdp: &[f64], target_delta: f64) -> Result<(f64, f64)> {
    check_lengths(alphas, rdp)?;
    if !(target_delta > 0.0 && target_delta < 1.0) {
        return Err(DpError::invalid(format!(
            "target delta must lie in (0, 1), got {target_delta}"
        )));
    }
    let log_inv_delta = -target_delta.ln();
    argmin(
        alphas,
        alphas
            .iter()
            .zip(rdp)
            .map(|(&a, &r)| r + log_inv_delta / (a - 1.0)),
    )
}

/// Smallest delta achievable at `target_epsilon` for a total RDP vector.
///
/// Returns `(delta, best_alpha)` with
/// `delta = min over alpha of exp((alpha - 1) * (rdp(alpha) - epsilon))`, capped at 1.
pub fn compute_delta(alphas: &[f64], rdp: &[f64], target_epsilon: f64) -> Result<(f64, f64)> {
    check_lengths(alphas, rdp)?;
    if !target_epsilon.is_finite() || target_epsilon < 0.0 {
        return Err(DpError::invalid(format!(
            "target epsilon must be finite and non-negative, got {target_epsilon}"
        )));
    }
    let (delta, alpha) = argmin(
        alphas,
        alphas
            .iter()
            .zip(rdp)
            .map(|(&a, &r)| ((a - 1.0) * (r - target_epsilon)).exp()),
    )?;
    Ok((delta.min(1.0), alpha))
}
