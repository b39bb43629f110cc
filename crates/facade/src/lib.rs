//! Privacy engine for differentially private SGD.
//!
//! Wrap any [`Optimizer`] in a [`DpOptimizer`] to clip per-example
//! gradients, add calibrated Gaussian noise from a generator seeded by the
//! operating system, and track the privacy spent with an RDP accountant.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod engine;
pub mod optimizer;

/// Crate version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use dp_engine_accounting as accounting;
pub use dp_engine_core as core;
pub use dp_engine_prng as prng;

pub use dp_engine_accounting::{
    calibrate_noise_multiplier, compute_delta, compute_rdp, default_alphas, get_privacy_spent,
};
pub use config::{PrivacyConfig, DEFAULT_TARGET_DELTA};
pub use dp_engine_core::prelude as core_prelude;
pub use dp_engine_core::{ClipBound, ClipperConfig, DpError, NormType, Result};
pub use engine::{AttachState, PrivacyEngine};
pub use optimizer::{DpOptimizer, Optimizer, Sgd, SgdConfig};
pub use dp_engine_prng::Device;

/// Convenience prelude covering the engine and its building blocks.
pub mod prelude {
    pub use crate::config::{PrivacyConfig, DEFAULT_TARGET_DELTA};
    pub use crate::engine::{AttachState, PrivacyEngine};
    pub use crate::optimizer::{DpOptimizer, Optimizer, Sgd, SgdConfig};
    pub use dp_engine_accounting::prelude::*;
    pub use dp_engine_core::prelude::*;
    pub use dp_engine_prng::prelude::*;
}
