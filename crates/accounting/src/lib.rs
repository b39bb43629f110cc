//! Rényi differential privacy accounting for DP-SGD.
//!
//! The accountant is a set of pure functions: [`compute_rdp`] gives the
//! per-step RDP of the Poisson-subsampled Gaussian mechanism,
//! [`compose_steps`] composes it over training, and [`get_privacy_spent`]
//! converts the total into an `(epsilon, delta)` guarantee.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod calibrate;
pub mod conversion;
pub mod rdp;

pub use calibrate::{calibrate_noise_multiplier, epsilon_for};
pub use conversion::{compute_delta, get_privacy_spent};
pub use rdp::{compose_steps, compute_rdp, default_alphas};

/// Common imports for privacy accounting.
pub mod prelude {
    pub use crate::{
        calibrate_noise_multiplier, compose_steps, compute_delta, compute_rdp, default_alphas,
        epsilon_for, get_privacy_spent,
    };
}
