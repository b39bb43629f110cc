//! Core primitives for differentially private SGD.
//!
//! This crate provides the building blocks the privacy engine drives:
//! a model/parameter abstraction, per-example gradient capture, structural
//! model validation, per-sample clipping and Gaussian noise generation.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod clipping;
pub mod error;
pub mod grad_sample;
pub mod inspector;
pub mod module;
pub mod noise;
pub mod tensor;

pub use clipping::{
    clip_factor, ClipBound, ClipReport, ClipResult, ClipStats, ClipperConfig,
    PerSampleGradientClipper, DEFAULT_STABILITY_EPS,
};
pub use error::{DpError, Result};
pub use grad_sample::{capture_linear, clear_grad_sample};
pub use inspector::{LayerInspector, ModelInspector};
pub use module::{Layer, LayerKind, Module, Parameter, Sequential};
pub use noise::{GaussianMechanism, SecureNoiseSource};
pub use tensor::{l2_norm, per_example_norms, NormType, Scalar, Tensor};

/// Common imports for downstream users.
pub mod prelude {
    pub use crate::{
        capture_linear, clear_grad_sample, clip_factor, l2_norm, per_example_norms, ClipBound,
        ClipReport, ClipResult, ClipStats, ClipperConfig, DpError, GaussianMechanism, Layer,
        LayerInspector, LayerKind, ModelInspector, Module, NormType, Parameter,
        PerSampleGradientClipper, Result, Scalar, SecureNoiseSource, Sequential, Tensor,
    };
}
