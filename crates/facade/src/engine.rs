//! The privacy engine: per-sample clipping, Gaussian noise and accounting.
//!
//! An engine is built from a [`PrivacyConfig`], attached to one model,
//! driven once per optimizer step and finally detached. Its step counter
//! survives detachment so the privacy spent can still be queried.

use dp_engine_accounting::{compose_steps, compute_delta, compute_rdp, get_privacy_spent};
use dp_engine_core::{
    clear_grad_sample, ClipResult, DpError, GaussianMechanism, ModelInspector, Module,
    PerSampleGradientClipper, Result, Scalar, SecureNoiseSource, Tensor,
};
use dp_engine_prng::Device;
use tracing::{debug, info, warn};

use crate::config::PrivacyConfig;

/// Where an engine is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttachState {
    /// Built, not yet bound to a model.
    Unattached,
    /// Bound to a model; steps are allowed.
    Attached,
    /// Released; only accounting queries remain.
    Detached,
}

/// Differentially private gradient sanitizer with an RDP accountant.
#[derive(Debug)]
pub struct PrivacyEngine {
    config: PrivacyConfig,
    inspector: ModelInspector,
    noise: SecureNoiseSource,
    clipper: Option<PerSampleGradientClipper>,
    state: AttachState,
    steps: u64,
}

impl PrivacyEngine {
    /// Build an engine whose noise generator is seeded from OS entropy.
    pub fn new(config: PrivacyConfig, device: Device) -> Result<Self> {
        config.validate()?;
        let noise = SecureNoiseSource::from_entropy(device)?;
        Ok(Self::from_parts(config, noise))
    }

    /// Build an engine with a fixed noise seed.
    ///
    /// The noise becomes predictable; use for reproducible tests only.
    pub fn with_seed(config: PrivacyConfig, seed: i64, device: Device) -> Result<Self> {
        config.validate()?;
        Ok(Self::from_parts(
            config,
            SecureNoiseSource::with_seed(seed, device),
        ))
    }

    fn from_parts(config: PrivacyConfig, noise: SecureNoiseSource) -> Self {
        if config.noise_multiplier == 0.0 {
            warn!("noise_multiplier is 0: gradients are clipped but carry no privacy guarantee");
        }
        Self {
            config,
            inspector: ModelInspector::new(),
            noise,
            clipper: None,
            state: AttachState::Unattached,
            steps: 0,
        }
    }

    /// Replace the model validator used at attach time.
    pub fn with_inspector(mut self, inspector: ModelInspector) -> Self {
        self.inspector = inspector;
        self
    }

    /// Engine configuration.
    pub fn config(&self) -> &PrivacyConfig {
        &self.config
    }

    /// Lifecycle state.
    pub fn state(&self) -> AttachState {
        self.state
    }

    /// Successful steps taken so far.
    pub fn steps(&self) -> u64 {
        self.steps
    }

    /// Device the noise generator is bound to.
    pub fn device(&self) -> Device {
        self.noise.device()
    }

    /// Validate `model` and prepare the clipper for it.
    ///
    /// On failure the engine stays unattached.
    pub fn attach(&mut self, model: &dyn Module) -> Result<()> {
        match self.state {
            AttachState::Unattached => {}
            AttachState::Attached => return Err(DpError::state("engine is already attached")),
            AttachState::Detached => {
                return Err(DpError::state(
                    "a detached engine cannot be re-attached; build a new engine",
                ))
            }
        }
        self.inspector.validate(model)?;
        let clipper = PerSampleGradientClipper::new(
            self.config.max_grad_norm.clone(),
            self.config.batch_dim,
            self.config.grad_norm_type,
            self.config.clipper.clone(),
        )?;
        clipper.check_model(model)?;

        self.clipper = Some(clipper);
        self.state = AttachState::Attached;
        info!(
            trainable_parameters = model.trainable_parameters().len(),
            noise_multiplier = self.config.noise_multiplier,
            sample_rate = self.config.sample_rate(),
            device = %self.device(),
            "privacy engine attached"
        );
        Ok(())
    }

    /// Release the clipper. Accounting state is kept.
    pub fn detach(&mut self) -> Result<()> {
        if self.state != AttachState::Attached {
            return Err(DpError::state("engine is not attached"));
        }
        if let Some(mut clipper) = self.clipper.take() {
            clipper.close();
        }
        self.state = AttachState::Detached;
        info!(steps = self.steps, "privacy engine detached");
        Ok(())
    }

    /// Bind future noise draws to `device`.
    pub fn to(mut self, device: Device) -> Self {
        let from = self.noise.device();
        self.noise.rebind(device);
        info!(%from, to = %device, "privacy engine moved");
        self
    }

    fn clipper_mut(&mut self) -> Result<&mut PerSampleGradientClipper> {
        match (self.state, self.clipper.as_mut()) {
            (AttachState::Attached, Some(clipper)) => Ok(clipper),
            _ => Err(DpError::state("engine is not attached")),
        }
    }

    /// Clip per-example gradients, add noise and count the step.
    ///
    /// Every noise tensor is drawn before any gradient is touched, and the
    /// step counter only moves once both stages succeed. `DegenerateNoise`
    /// guards against a clipper reporting a bound of zero; validated
    /// configurations never produce one.
    pub fn step(&mut self, model: &mut dyn Module) -> Result<()> {
        let ClipResult {
            clip_values,
            batch_size,
        } = self.clipper_mut()?.step(model)?;

        let noise_multiplier = self.config.noise_multiplier;
        let mut draws: Vec<Option<Tensor>> = Vec::with_capacity(clip_values.len());
        for (param, &clip_value) in model.trainable_parameters().iter().zip(&clip_values) {
            let Some(grad) = param.grad.as_ref() else {
                draws.push(None);
                continue;
            };
            let mechanism = GaussianMechanism::new(noise_multiplier, clip_value);
            if mechanism.is_noiseless() {
                draws.push(None);
                continue;
            }
            if clip_value <= 0.0 {
                return Err(DpError::DegenerateNoise {
                    parameter: param.name.clone(),
                    clip_value,
                });
            }
            draws.push(Some(self.noise.sample_gaussian(
                0.0,
                mechanism.sigma(),
                grad.shape(),
            )?));
        }

        let scale = 1.0 / batch_size as Scalar;
        for (param, draw) in model.trainable_parameters_mut().into_iter().zip(draws) {
            if let (Some(grad), Some(noise)) = (param.grad.as_mut(), draw) {
                grad.scaled_add(scale, &noise);
            }
        }

        self.steps += 1;
        debug!(step = self.steps, batch_size, "private step");
        Ok(())
    }

    /// Drop per-example gradients and any accumulated micro-batches.
    pub fn zero_grad(&mut self, model: &mut dyn Module) {
        clear_grad_sample(model);
        if let Some(clipper) = self.clipper.as_mut() {
            clipper.zero_grads();
        }
    }

    /// Clip the current micro-batch into the clipper and free its per-example gradients.
    pub fn accumulate_grads(&mut self, model: &mut dyn Module) -> Result<()> {
        self.clipper_mut()?.accumulate_grads(&*model)?;
        clear_grad_sample(model);
        Ok(())
    }

    /// Per-step RDP at every configured order.
    pub fn get_renyi_divergence(&self) -> Result<Vec<f64>> {
        compute_rdp(
            self.config.sample_rate(),
            self.config.noise_multiplier,
            1.0,
            &self.config.alphas,
        )
    }

    /// RDP composed over every step taken.
    pub fn total_rdp(&self) -> Result<Vec<f64>> {
        Ok(compose_steps(&self.get_renyi_divergence()?, self.steps))
    }

    /// `(epsilon, best_alpha)` spent so far at `target_delta`, or the configured delta.
    pub fn get_privacy_spent(&self, target_delta: Option<f64>) -> Result<(f64, f64)> {
        get_privacy_spent(
            &self.config.alphas,
            &self.total_rdp()?,
            target_delta.unwrap_or(self.config.target_delta),
        )
    }

    /// `(delta, best_alpha)` spent so far at `target_epsilon`.
    pub fn get_delta_spent(&self, target_epsilon: f64) -> Result<(f64, f64)> {
        compute_delta(&self.config.alphas, &self.total_rdp()?, target_epsilon)
    }
}
