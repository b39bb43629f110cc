//! Rényi Differential Privacy of the subsampled Gaussian mechanism.
//!
//! Follows Mironov, Talwar and Zhang, "Rényi Differential Privacy of the
//! Sampled Gaussian Mechanism" (2019): `A_alpha` is evaluated exactly by a
//! binomial expansion for integer orders and by a two-sided series of
//! `erfc` terms for fractional orders, entirely in log space.

use dp_engine_core::{DpError, Result};
use statrs::function::erf::erfc;
use statrs::function::factorial::ln_binomial;

/// Series terms below `exp(LOG_TERM_CUTOFF)` end the fractional expansion.
const LOG_TERM_CUTOFF: f64 = -30.0;

/// Hard cap on fractional series terms.
const MAX_SERIES_TERMS: usize = 100_000;

/// Default Rényi orders: `1.1, 1.2, ..., 10.9` followed by `12..=63`.
pub fn default_alphas() -> Vec<f64> {
    let mut alphas: Vec<f64> = (1..100).map(|x| 1.0 + x as f64 / 10.0).collect();
    alphas.extend((12..64).map(f64::from));
    alphas
}

/// Per-step RDP of the subsampled Gaussian mechanism at each order.
///
/// `noise_multiplier` is the noise standard deviation relative to the
/// clipping bound; `sensitivity` rescales it (the privacy engine always
/// passes 1 since clipping already normalizes per-example gradients).
pub fn compute_rdp(
    sample_rate: f64,
    noise_multiplier: f64,
    sensitivity: f64,
    alphas: &[f64],
) -> Result<Vec<f64>> {
    if !(0.0..=1.0).contains(&sample_rate) {
        return Err(DpError::invalid(format!(
            "sample rate must lie in [0, 1], got {sample_rate}"
        )));
    }
    if !noise_multiplier.is_finite() || noise_multiplier < 0.0 {
        return Err(DpError::invalid(format!(
            "noise multiplier must be finite and non-negative, got {noise_multiplier}"
        )));
    }
    if !sensitivity.is_finite() || sensitivity <= 0.0 {
        return Err(DpError::invalid(format!(
            "sensitivity must be finite and positive, got {sensitivity}"
        )));
    }
    check_alphas(alphas)?;

    let sigma = noise_multiplier / sensitivity;
    alphas
        .iter()
        .map(|&alpha| rdp_subsampled_gaussian(sample_rate, sigma, alpha))
        .collect()
}

/// Scale a per-step RDP vector to `steps` identical steps.
pub fn compose_steps(rdp: &[f64], steps: u64) -> Vec<f64> {
    if steps == 0 {
        return vec![0.0; rdp.len()];
    }
    let n = steps as f64;
    rdp.iter().map(|r| r * n).collect()
}

pub(crate) fn check_alphas(alphas: &[f64]) -> Result<()> {
    if alphas.is_empty() {
        return Err(DpError::invalid("alphas must be non-empty"));
    }
    if let Some(a) = alphas.iter().find(|&&a| a.is_nan() || a <= 1.0) {
        return Err(DpError::invalid(format!(
            "Rényi orders must be greater than 1, got {a}"
        )));
    }
    Ok(())
}

fn rdp_subsampled_gaussian(q: f64, sigma: f64, alpha: f64) -> Result<f64> {
    if q == 0.0 {
        return Ok(0.0);
    }
    if sigma == 0.0 || alpha.is_infinite() {
        return Ok(f64::INFINITY);
    }
    if q == 1.0 {
        return Ok(alpha / (2.0 * sigma * sigma));
    }

    let log_a = if alpha.fract() == 0.0 {
        log_a_int(q, sigma, alpha as u64)
    } else {
        log_a_frac(q, sigma, alpha)?
    };
    Ok(log_a / (alpha - 1.0))
}

/// `log(A_alpha)` for integer `alpha`.
fn log_a_int(q: f64, sigma: f64, alpha: u64) -> f64 {
    let log_q = q.ln();
    let log_1mq = (-q).ln_1p();
    let two_sigma_sq = 2.0 * sigma * sigma;

    let mut log_a = f64::NEG_INFINITY;
    for i in 0..=alpha {
        let i_f = i as f64;
        let log_coef =
            ln_binomial(alpha, i) + i_f * log_q + (alpha - i) as f64 * log_1mq;
        let log_s = log_coef + (i_f * i_f - i_f) / two_sigma_sq;
        log_a = log_add(log_a, log_s);
    }
    log_a
}

/// `log(A_alpha)` for fractional `alpha`.
fn log_a_frac(q: f64, sigma: f64, alpha: f64) -> Result<f64> {
    let log_q = q.ln();
    let log_1mq = (-q).ln_1p();
    let sigma_sq = sigma * sigma;
    let z0 = sigma_sq * (1.0 / q - 1.0).ln() + 0.5;
    let sqrt2_sigma = std::f64::consts::SQRT_2 * sigma;

    let mut log_a0 = f64::NEG_INFINITY;
    let mut log_a1 = f64::NEG_INFINITY;
    // Generalized binomial coefficient C(alpha, i), tracked as log|c| and sign.
    let mut log_coef = 0.0_f64;
    let mut positive = true;

    for i in 0..MAX_SERIES_TERMS {
        let i_f = i as f64;
        let j = alpha - i_f;

        let log_t0 = log_coef + i_f * log_q + j * log_1mq;
        let log_t1 = log_coef + j * log_q + i_f * log_1mq;
        let log_e0 = 0.5_f64.ln() + log_erfc((i_f - z0) / sqrt2_sigma);
        let log_e1 = 0.5_f64.ln() + log_erfc((z0 - j) / sqrt2_sigma);
        let log_s0 = log_t0 + (i_f * i_f - i_f) / (2.0 * sigma_sq) + log_e0;
        let log_s1 = log_t1 + (j * j - j) / (2.0 * sigma_sq) + log_e1;

        if positive {
            log_a0 = log_add(log_a0, log_s0);
            log_a1 = log_add(log_a1, log_s1);
        } else {
            log_a0 = log_sub(log_a0, log_s0)?;
            log_a1 = log_sub(log_a1, log_s1)?;
        }

        if log_s0.max(log_s1) < LOG_TERM_CUTOFF {
            return Ok(log_add(log_a0, log_a1));
        }

        // C(alpha, i + 1) = C(alpha, i) * (alpha - i) / (i + 1)
        let factor = alpha - i_f;
        log_coef += factor.abs().ln() - (i_f + 1.0).ln();
        if factor < 0.0 {
            positive = !positive;
        }
    }

    Err(DpError::numerical(format!(
        "RDP series for order {alpha} did not converge"
    )))
}

/// `log(erfc(x))`, switching to the asymptotic expansion when `erfc` underflows.
fn log_erfc(x: f64) -> f64 {
    let r = erfc(x);
    if r > 0.0 {
        r.ln()
    } else {
        log_erfc_tail(x)
    }
}

/// Laurent series of `log(erfc(x))` at infinity.
fn log_erfc_tail(x: f64) -> f64 {
    let x2 = x * x;
    -std::f64::consts::PI.ln() / 2.0 - x.ln() - x2 - 0.5 / x2 + 0.625 / (x2 * x2)
        - 37.0 / (24.0 * x2 * x2 * x2)
        + 353.0 / (64.0 * x2 * x2 * x2 * x2)
}

/// Numerically stable `log(exp(a) + exp(b))`.
pub(crate) fn log_add(a: f64, b: f64) -> f64 {
    let (lo, hi) = if a < b { (a, b) } else { (b, a) };
    if lo == f64::NEG_INFINITY {
        return hi;
    }
    hi + (lo - hi).exp().ln_1p()
}

/// Numerically stable `log(exp(a) - exp(b))`, requiring `a >= b`.
fn log_sub(a: f64, b: f64) -> Result<f64> {
    if a < b {
        return Err(DpError::numerical(
            "log-space subtraction would produce a negative value",
        ));
    }
    if b == f64::NEG_INFINITY {
        return Ok(a);
    }
    if a == b {
        return Ok(f64::NEG_INFINITY);
    }
    let d = (a - b).exp_m1();
    if d.is_infinite() {
        return Ok(a);
    }
    Ok(d.ln() + b)
}
