//! Error types for differentially private training.

/// Errors that can occur during DP operations.
#[derive(Debug, thiserror::Error)]
pub enum DpError {
    /// The model contains layers incompatible with per-example gradients.
    #[error("unsupported module: {}", .violations.join("; "))]
    UnsupportedModule {
        /// One entry per offending layer.
        violations: Vec<String>,
    },

    /// Invalid argument provided.
    #[error("invalid argument: {msg}")]
    InvalidArgument {
        /// Human-readable error description.
        msg: String,
    },

    /// Noise requested against a zero clip bound.
    #[error(
        "degenerate noise for parameter {parameter}: clip value {clip_value} with nonzero noise multiplier"
    )]
    DegenerateNoise {
        /// Name of the parameter.
        parameter: String,
        /// Clip value returned by the clipper.
        clip_value: f64,
    },

    /// Configuration error.
    #[error("configuration error: {msg}")]
    Config {
        /// Human-readable error description.
        msg: String,
    },

    /// Operation not allowed in the engine's current lifecycle state.
    #[error("engine state error: {msg}")]
    EngineState {
        /// Human-readable error description.
        msg: String,
    },

    /// Numerical computation error.
    #[error("numerical error: {msg}")]
    Numerical {
        /// Human-readable error description.
        msg: String,
    },

    /// The OS entropy source could not seed the noise generator.
    #[error("entropy error: {msg}")]
    Entropy {
        /// Human-readable error description.
        msg: String,
    },
}

/// Result type for DP operations.
pub type Result<T> = std::result::Result<T, DpError>;

impl DpError {
    /// Create an invalid argument error.
    pub fn invalid<S: Into<String>>(msg: S) -> Self {
        Self::InvalidArgument { msg: msg.into() }
    }

    /// Create a numerical error.
    pub fn numerical<S: Into<String>>(msg: S) -> Self {
        Self::Numerical { msg: msg.into() }
    }

    /// Create a configuration error.
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config { msg: msg.into() }
    }

    /// Create a lifecycle error.
    pub fn state<S: Into<String>>(msg: S) -> Self {
        Self::EngineState { msg: msg.into() }
    }
}

impl From<dp_engine_prng::EntropyError> for DpError {
    fn from(err: dp_engine_prng::EntropyError) -> Self {
        Self::Entropy {
            msg: err.to_string(),
        }
    }
}
