//! Privacy engine configuration.

use dp_engine_accounting::default_alphas;
use dp_engine_core::{ClipBound, ClipperConfig, DpError, NormType, Result};

/// Default failure probability used when none is given at query time.
pub const DEFAULT_TARGET_DELTA: f64 = 1e-6;

/// Configuration of a [`PrivacyEngine`](crate::PrivacyEngine).
///
/// Fixed once the engine is built; there are no setters on the engine.
#[derive(Clone, Debug, PartialEq)]
pub struct PrivacyConfig {
    /// Examples per logical batch.
    pub batch_size: usize,
    /// Size of the dataset the batches are drawn from.
    pub sample_size: usize,
    /// Ratio of noise standard deviation to clip bound.
    pub noise_multiplier: f64,
    /// Per-example gradient norm bound(s).
    pub max_grad_norm: ClipBound,
    /// Norm used to measure per-example gradients.
    pub grad_norm_type: NormType,
    /// Axis of `grad_sample` holding the examples.
    pub batch_dim: usize,
    /// Delta used by `get_privacy_spent(None)`.
    pub target_delta: f64,
    /// Rényi orders tracked by the accountant.
    pub alphas: Vec<f64>,
    /// Extra clipper settings.
    pub clipper: ClipperConfig,
}

impl PrivacyConfig {
    /// Configuration with default norm, batch axis, delta, orders and clipper.
    pub fn new(
        batch_size: usize,
        sample_size: usize,
        noise_multiplier: f64,
        max_grad_norm: impl Into<ClipBound>,
    ) -> Self {
        Self {
            batch_size,
            sample_size,
            noise_multiplier,
            max_grad_norm: max_grad_norm.into(),
            grad_norm_type: NormType::default(),
            batch_dim: 0,
            target_delta: DEFAULT_TARGET_DELTA,
            alphas: default_alphas(),
            clipper: ClipperConfig::default(),
        }
    }

    /// Use another per-example norm.
    pub fn with_grad_norm_type(mut self, norm: NormType) -> Self {
        self.grad_norm_type = norm;
        self
    }

    /// Set the batch axis of per-example gradients.
    pub fn with_batch_dim(mut self, batch_dim: usize) -> Self {
        self.batch_dim = batch_dim;
        self
    }

    /// Set the default target delta.
    pub fn with_target_delta(mut self, target_delta: f64) -> Self {
        self.target_delta = target_delta;
        self
    }

    /// Track a custom list of Rényi orders.
    pub fn with_alphas(mut self, alphas: Vec<f64>) -> Self {
        self.alphas = alphas;
        self
    }

    /// Replace the clipper settings.
    pub fn with_clipper(mut self, clipper: ClipperConfig) -> Self {
        self.clipper = clipper;
        self
    }

    /// Probability that an example lands in a batch.
    pub fn sample_rate(&self) -> f64 {
        self.batch_size as f64 / self.sample_size as f64
    }

    /// Check every field.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(DpError::config("batch_size must be positive"));
        }
        if self.sample_size < self.batch_size {
            return Err(DpError::config(format!(
                "sample_size {} is smaller than batch_size {}",
                self.sample_size, self.batch_size
            )));
        }
        if !self.noise_multiplier.is_finite() || self.noise_multiplier < 0.0 {
            return Err(DpError::config(format!(
                "noise_multiplier must be finite and non-negative, got {}",
                self.noise_multiplier
            )));
        }
        self.max_grad_norm.validate()?;
        self.grad_norm_type.validate()?;
        if !(self.target_delta > 0.0 && self.target_delta < 1.0) {
            return Err(DpError::config(format!(
                "target_delta must lie in (0, 1), got {}",
                self.target_delta
            )));
        }
        if self.alphas.is_empty() {
            return Err(DpError::config("alphas must be non-empty"));
        }
        if let Some(a) = self.alphas.iter().find(|a| !a.is_finite() || **a <= 1.0) {
            return Err(DpError::config(format!(
                "every alpha must be finite and greater than 1, got {a}"
            )));
        }
        self.clipper.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = PrivacyConfig::new(64, 6400, 1.1, 1.0);
        assert_eq!(cfg.max_grad_norm, ClipBound::Flat(1.0));
        assert_eq!(cfg.grad_norm_type, NormType::Lp(2.0));
        assert_eq!(cfg.batch_dim, 0);
        assert_eq!(cfg.target_delta, 1e-6);
        assert_eq!(cfg.alphas, default_alphas());
        assert!((cfg.sample_rate() - 0.01).abs() < 1e-15);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn builders_override_fields() {
        let cfg = PrivacyConfig::new(1, 10, 0.0, vec![1.0, 2.0])
            .with_grad_norm_type(NormType::Inf)
            .with_batch_dim(1)
            .with_target_delta(1e-5)
            .with_alphas(vec![2.0, 4.0]);
        assert_eq!(cfg.max_grad_norm, ClipBound::PerParameter(vec![1.0, 2.0]));
        assert_eq!(cfg.grad_norm_type, NormType::Inf);
        assert_eq!(cfg.batch_dim, 1);
        assert_eq!(cfg.alphas, vec![2.0, 4.0]);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn invalid_configs_are_rejected() {
        let base = PrivacyConfig::new(10, 100, 1.0, 1.0);
        let cases = [
            PrivacyConfig { batch_size: 0, ..base.clone() },
            PrivacyConfig { sample_size: 5, ..base.clone() },
            PrivacyConfig { noise_multiplier: -1.0, ..base.clone() },
            PrivacyConfig { noise_multiplier: f64::NAN, ..base.clone() },
            PrivacyConfig { max_grad_norm: ClipBound::Flat(0.0), ..base.clone() },
            base.clone().with_grad_norm_type(NormType::Lp(0.5)),
            base.clone().with_target_delta(1.0),
            base.clone().with_alphas(vec![]),
            base.clone().with_alphas(vec![1.0, 2.0]),
            base.clone().with_clipper(ClipperConfig {
                stability_eps: 0.0,
                ..ClipperConfig::default()
            }),
        ];
        for cfg in cases {
            assert!(
                matches!(cfg.validate(), Err(DpError::Config { .. })),
                "accepted {cfg:?}"
            );
        }
    }
}
