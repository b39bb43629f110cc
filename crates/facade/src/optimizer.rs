//! Optimizers and the differentially private wrapper around them.

use dp_engine_core::{DpError, Module, Result, Scalar, Tensor};
use dp_engine_prng::Device;

use crate::engine::PrivacyEngine;

/// A gradient-based parameter update rule.
pub trait Optimizer {
    /// Update every trainable parameter from its `grad`.
    fn step(&mut self, model: &mut dyn Module) -> Result<()>;

    /// Clear every parameter's `grad`.
    fn zero_grad(&mut self, model: &mut dyn Module);
}

/// Settings for [`Sgd`].
#[derive(Clone, Debug, PartialEq)]
pub struct SgdConfig {
    /// Learning rate.
    pub lr: f64,
    /// Momentum factor; 0 disables momentum.
    pub momentum: f64,
    /// L2 penalty added to the gradient.
    pub weight_decay: f64,
}

impl Default for SgdConfig {
    fn default() -> Self {
        Self {
            lr: 0.01,
            momentum: 0.0,
            weight_decay: 0.0,
        }
    }
}

impl SgdConfig {
    /// Validate the settings.
    pub fn validate(&self) -> Result<()> {
        if !self.lr.is_finite() || self.lr <= 0.0 {
            return Err(DpError::config(format!("lr must be finite and positive, got {}", self.lr)));
        }
        if !(0.0..1.0).contains(&self.momentum) {
            return Err(DpError::config(format!(
                "momentum must lie in [0, 1), got {}",
                self.momentum
            )));
        }
        if !self.weight_decay.is_finite() || self.weight_decay < 0.0 {
            return Err(DpError::config(format!(
                "weight_decay must be finite and non-negative, got {}",
                self.weight_decay
            )));
        }
        Ok(())
    }
}

/// Stochastic gradient descent with optional momentum and weight decay.
#[derive(Clone, Debug)]
pub struct Sgd {
    config: SgdConfig,
    velocity: Vec<Option<Tensor>>,
}

impl Sgd {
    /// Create an optimizer.
    pub fn new(config: SgdConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            velocity: Vec::new(),
        })
    }

    /// Plain SGD at learning rate `lr`.
    pub fn with_lr(lr: f64) -> Result<Self> {
        Self::new(SgdConfig {
            lr,
            ..SgdConfig::default()
        })
    }

    /// Optimizer settings.
    pub fn config(&self) -> &SgdConfig {
        &self.config
    }
}

impl Optimizer for Sgd {
    fn step(&mut self, model: &mut dyn Module) -> Result<()> {
        let params = model.trainable_parameters_mut();
        if self.velocity.len() != params.len() {
            self.velocity = vec![None; params.len()];
        }
        let lr = self.config.lr as Scalar;
        let momentum = self.config.momentum as Scalar;
        let weight_decay = self.config.weight_decay as Scalar;
        for (param, velocity) in params.into_iter().zip(self.velocity.iter_mut()) {
            let Some(grad) = param.grad.as_ref() else {
                continue;
            };
            if grad.shape() != param.shape() {
                return Err(DpError::invalid(format!(
                    "{}: gradient shape {:?} does not match parameter shape {:?}",
                    param.name,
                    grad.shape(),
                    param.shape()
                )));
            }
            let mut update = grad.clone();
            if weight_decay != 0.0 {
                update.scaled_add(weight_decay, &param.data);
            }
            if momentum != 0.0 {
                let v = match velocity.take() {
                    Some(v) => v * momentum + &update,
                    None => update,
                };
                update = v.clone();
                *velocity = Some(v);
            }
            param.data.scaled_add(-lr, &update);
        }
        Ok(())
    }

    fn zero_grad(&mut self, model: &mut dyn Module) {
        for param in model.parameters_mut() {
            param.grad = None;
        }
    }
}

/// An optimizer whose steps are privatized by a [`PrivacyEngine`].
///
/// Owns both the engine and the wrapped optimizer. Every `step` clips and
/// noises the gradients before the wrapped optimizer sees them.
#[derive(Debug)]
pub struct DpOptimizer<O: Optimizer> {
    inner: O,
    engine: PrivacyEngine,
}

impl<O: Optimizer> DpOptimizer<O> {
    /// Attach `engine` to `model` and wrap `inner`.
    pub fn new(inner: O, mut engine: PrivacyEngine, model: &dyn Module) -> Result<Self> {
        engine.attach(model)?;
        Ok(Self { inner, engine })
    }

    /// The privacy engine.
    pub fn engine(&self) -> &PrivacyEngine {
        &self.engine
    }

    /// The wrapped optimizer.
    pub fn inner(&self) -> &O {
        &self.inner
    }

    /// Privatize the gradients, then let the wrapped optimizer update the model.
    pub fn step(&mut self, model: &mut dyn Module) -> Result<()> {
        self.engine.step(model)?;
        self.inner.step(model)
    }

    /// Clear per-example state in the engine and gradients in the optimizer.
    pub fn zero_grad(&mut self, model: &mut dyn Module) {
        self.engine.zero_grad(model);
        self.inner.zero_grad(model);
    }

    /// Fold the current micro-batch into the next step.
    pub fn accumulate_grads(&mut self, model: &mut dyn Module) -> Result<()> {
        self.engine.accumulate_grads(model)
    }

    /// `(epsilon, best_alpha)` spent so far.
    pub fn privacy_spent(&self, target_delta: Option<f64>) -> Result<(f64, f64)> {
        self.engine.get_privacy_spent(target_delta)
    }

    /// Move future noise draws to `device`.
    pub fn to(self, device: Device) -> Self {
        let Self { inner, engine } = self;
        Self {
            inner,
            engine: engine.to(device),
        }
    }

    /// Detach the engine and hand back the untouched optimizer.
    pub fn detach(self) -> Result<(O, PrivacyEngine)> {
        let Self { inner, mut engine } = self;
        engine.detach()?;
        Ok((inner, engine))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PrivacyConfig;
    use crate::engine::AttachState;
    use dp_engine_core::{Layer, Sequential};
    use ndarray::array;

    fn model() -> Sequential {
        Sequential::new().push(
            Layer::linear("fc", array![[1.0, -1.0]], Some(array![0.5].into_dyn())).expect("fc"),
        )
    }

    fn set_grads(model: &mut Sequential) {
        let grads = [array![[0.2, -0.4]].into_dyn(), array![1.0].into_dyn()];
        for (p, g) in model.parameters_mut().into_iter().zip(grads) {
            p.grad = Some(g);
        }
    }

    #[test]
    fn sgd_descends_along_gradient() {
        let mut m = model();
        set_grads(&mut m);
        let mut opt = Sgd::with_lr(0.5).expect("sgd");
        opt.step(&mut m).expect("step");
        assert_eq!(m.parameters()[0].data, array![[0.9, -0.8]].into_dyn());
        assert_eq!(m.parameters()[1].data, array![0.0].into_dyn());
        opt.zero_grad(&mut m);
        assert!(m.parameters().iter().all(|p| p.grad.is_none()));
    }

    #[test]
    fn momentum_accumulates_velocity() {
        let mut m = model();
        let mut opt = Sgd::new(SgdConfig {
            lr: 1.0,
            momentum: 0.5,
            weight_decay: 0.0,
        })
        .expect("sgd");
        set_grads(&mut m);
        opt.step(&mut m).expect("first");
        set_grads(&mut m);
        opt.step(&mut m).expect("second");
        // Bias: 0.5 - 1.0 - (0.5 * 1.0 + 1.0).
        assert!((m.parameters()[1].data[[0]] as f64 + 2.0).abs() < 1e-12);
    }

    #[test]
    fn weight_decay_pulls_towards_zero() {
        let mut m = model();
        if let Some(bias) = m.parameters_mut().into_iter().nth(1) {
            bias.grad = Some(array![0.0].into_dyn());
        }
        let mut opt = Sgd::new(SgdConfig {
            lr: 0.1,
            momentum: 0.0,
            weight_decay: 1.0,
        })
        .expect("sgd");
        opt.step(&mut m).expect("step");
        assert!((m.parameters()[1].data[[0]] as f64 - 0.45).abs() < 1e-12);
    }

    #[test]
    fn invalid_sgd_settings() {
        assert!(Sgd::with_lr(0.0).is_err());
        assert!(Sgd::new(SgdConfig {
            momentum: 1.0,
            ..SgdConfig::default()
        })
        .is_err());
    }

    #[test]
    fn detach_returns_the_wrapped_optimizer_unchanged() {
        let m = model();
        let config = PrivacyConfig::new(4, 100, 1.0, 1.0);
        let engine = PrivacyEngine::with_seed(config, 11, Device::Cpu).expect("engine");
        let dp = DpOptimizer::new(Sgd::with_lr(0.3).expect("sgd"), engine, &m).expect("wrap");
        assert_eq!(dp.engine().state(), AttachState::Attached);

        let (mut inner, engine) = dp.detach().expect("detach");
        assert_eq!(engine.state(), AttachState::Detached);

        let mut a = model();
        let mut b = model();
        set_grads(&mut a);
        set_grads(&mut b);
        inner.step(&mut a).expect("step");
        Sgd::with_lr(0.3).expect("sgd").step(&mut b).expect("step");
        for (pa, pb) in a.parameters().iter().zip(b.parameters()) {
            assert_eq!(pa.data, pb.data);
            assert_eq!(pa.grad, pb.grad);
        }
    }
}
