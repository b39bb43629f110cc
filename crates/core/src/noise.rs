//! Gaussian noise for differentially private gradients.

use dp_engine_prng::{os_seed, Device, DeviceGenerator};
use ndarray::IxDyn;
use rand_distr::{Distribution, Normal};

use crate::error::{DpError, Result};
use crate::tensor::{Scalar, Tensor};

/// Gaussian mechanism with sensitivity calibration.
#[derive(Clone, Copy, Debug)]
pub struct GaussianMechanism {
    /// Noise multiplier (sigma = noise_multiplier * sensitivity).
    pub noise_multiplier: f64,
    /// L2 sensitivity bound.
    pub sensitivity: f64,
}

impl GaussianMechanism {
    /// Create a new Gaussian mechanism.
    pub fn new(noise_multiplier: f64, sensitivity: f64) -> Self {
        Self {
            noise_multiplier,
            sensitivity,
        }
    }

    /// Get the noise standard deviation.
    pub fn sigma(&self) -> f64 {
        self.noise_multiplier * self.sensitivity
    }

    /// Whether the mechanism adds any noise at all.
    pub fn is_noiseless(&self) -> bool {
        self.noise_multiplier == 0.0
    }
}

/// Noise generator owned by a single privacy engine.
///
/// Seeded once from OS entropy and bound to a device; independent of any
/// generator the training loop uses. Not `Clone`: sharing one stream across
/// engines would correlate their noise.
#[derive(Debug)]
pub struct SecureNoiseSource {
    seed: i64,
    bindings: u64,
    generator: DeviceGenerator,
}

impl SecureNoiseSource {
    /// Seed from the operating system's entropy source.
    pub fn from_entropy(device: Device) -> Result<Self> {
        let seed = os_seed()?;
        Ok(Self::with_seed(seed, device))
    }

    /// Seed explicitly. Only for reproducible tests.
    pub fn with_seed(seed: i64, device: Device) -> Self {
        Self {
            seed,
            bindings: 0,
            generator: device.generator(seed),
        }
    }

    /// Device the generator is bound to.
    pub fn device(&self) -> Device {
        self.generator.device()
    }

    /// Bind to another device.
    ///
    /// Each rebinding derives a fresh stream from the original seed, so a
    /// return to an earlier device never replays its draws.
    pub fn rebind(&mut self, device: Device) {
        self.bindings += 1;
        let derived = self.seed ^ (self.bindings.wrapping_mul(0x9E37_79B9_7F4A_7C15) as i64);
        self.generator = device.generator(derived);
    }

    /// Draw a tensor of i.i.d. `N(mean, std^2)` entries.
    pub fn sample_gaussian(&mut self, mean: f64, std: f64, shape: &[usize]) -> Result<Tensor> {
        if !mean.is_finite() || !std.is_finite() || std < 0.0 {
            return Err(DpError::invalid(format!(
                "gaussian parameters must be finite with std >= 0, got mean={mean} std={std}"
            )));
        }
        if std == 0.0 {
            return Ok(Tensor::from_elem(IxDyn(shape), mean as Scalar));
        }
        let dist = Normal::new(mean, std).map_err(|e| DpError::invalid(e.to_string()))?;
        let rng = &mut self.generator;
        Ok(Tensor::from_shape_simple_fn(IxDyn(shape), || {
            dist.sample(rng) as Scalar
        }))
    }
}
