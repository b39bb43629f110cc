//! Minimal model abstraction consumed by the privacy engine.
//!
//! A model is an ordered collection of [`Layer`]s, each owning its
//! [`Parameter`]s. Parameter iteration order is layer order, then parameter
//! order within the layer; clip values and noise follow that same order.

use ndarray::{Array2, Ix2};

use crate::error::{DpError, Result};
use crate::tensor::{Scalar, Tensor};

/// A trainable (or frozen) tensor together with its gradient buffers.
#[derive(Clone, Debug)]
pub struct Parameter {
    /// Name, unique within the model.
    pub name: String,
    /// Current value.
    pub data: Tensor,
    /// Whether the optimizer and the privacy engine touch this parameter.
    pub requires_grad: bool,
    /// Aggregated gradient, written by the clipper and read by the optimizer.
    pub grad: Option<Tensor>,
    /// Per-example gradients stacked along the batch dimension.
    pub grad_sample: Option<Tensor>,
}

impl Parameter {
    /// Create a trainable parameter.
    pub fn new<S: Into<String>>(name: S, data: Tensor) -> Self {
        Self {
            name: name.into(),
            data,
            requires_grad: true,
            grad: None,
            grad_sample: None,
        }
    }

    /// Mark the parameter as frozen.
    pub fn frozen(mut self) -> Self {
        self.requires_grad = false;
        self
    }

    /// Shape of the parameter value.
    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }
}

/// Structural kind of a layer, as seen by the model validator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LayerKind {
    /// Fully connected layer (`weight: [out, in]`, `bias: [out]`).
    Linear,
    /// 1-D convolution.
    Conv1d,
    /// 2-D convolution.
    Conv2d,
    /// Embedding lookup table.
    Embedding,
    /// Layer normalization.
    LayerNorm,
    /// Group normalization.
    GroupNorm,
    /// Instance normalization.
    InstanceNorm {
        /// Whether running statistics are accumulated across batches.
        track_running_stats: bool,
    },
    /// Batch normalization.
    BatchNorm,
    /// Anything else, by type name.
    Other(String),
}

impl LayerKind {
    /// Whether per-example gradients can be captured for this kind.
    pub fn has_grad_sampler(&self) -> bool {
        !matches!(self, LayerKind::BatchNorm | LayerKind::Other(_))
    }
}

/// A named layer owning its parameters.
#[derive(Clone, Debug)]
pub struct Layer {
    /// Layer name.
    pub name: String,
    /// Layer kind.
    pub kind: LayerKind,
    /// Parameters in declaration order.
    pub params: Vec<Parameter>,
}

impl Layer {
    /// Create a layer from its parts.
    pub fn new<S: Into<String>>(name: S, kind: LayerKind, params: Vec<Parameter>) -> Self {
        Self {
            name: name.into(),
            kind,
            params,
        }
    }

    /// Fully connected layer with the given weight (`[out, in]`) and optional bias.
    pub fn linear<S: Into<String>>(name: S, weight: Array2<Scalar>, bias: Option<Tensor>) -> Result<Self> {
        let name = name.into();
        if let Some(b) = &bias {
            if b.shape() != [weight.nrows()] {
                return Err(DpError::invalid(format!(
                    "{name}: bias shape {:?} does not match {} output features",
                    b.shape(),
                    weight.nrows()
                )));
            }
        }
        let mut params = vec![Parameter::new(format!("{name}.weight"), weight.into_dyn())];
        if let Some(b) = bias {
            params.push(Parameter::new(format!("{name}.bias"), b));
        }
        Ok(Self::new(name, LayerKind::Linear, params))
    }

    /// Whether any parameter of the layer is trainable.
    pub fn is_trainable(&self) -> bool {
        self.params.iter().any(|p| p.requires_grad)
    }

    /// Forward pass of a fully connected layer over a batch-first input.
    pub fn linear_forward(&self, input: &Array2<Scalar>) -> Result<Array2<Scalar>> {
        if self.kind != LayerKind::Linear {
            return Err(DpError::invalid(format!(
                "{}: linear_forward on a {:?} layer",
                self.name, self.kind
            )));
        }
        let weight = self
            .params
            .first()
            .ok_or_else(|| DpError::invalid(format!("{}: missing weight", self.name)))?
            .data
            .view()
            .into_dimensionality::<Ix2>()
            .map_err(|e| DpError::invalid(format!("{}: weight is not a matrix: {e}", self.name)))?;
        if input.ncols() != weight.ncols() {
            return Err(DpError::invalid(format!(
                "{}: expected {} input features, got {}",
                self.name,
                weight.ncols(),
                input.ncols()
            )));
        }
        let mut out = input.dot(&weight.t());
        if let Some(bias) = self.params.get(1) {
            out += &bias.data.view().into_dimensionality::<ndarray::Ix1>().map_err(|e| {
                DpError::invalid(format!("{}: bias is not a vector: {e}", self.name))
            })?;
        }
        Ok(out)
    }
}

/// A model whose parameters the privacy engine can clip and noise.
pub trait Module {
    /// Layers in forward order.
    fn layers(&self) -> &[Layer];

    /// Mutable access to the layers.
    fn layers_mut(&mut self) -> &mut [Layer];

    /// All parameters in iteration order.
    fn parameters(&self) -> Vec<&Parameter> {
        self.layers().iter().flat_map(|l| l.params.iter()).collect()
    }

    /// All parameters in iteration order, mutably.
    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        self.layers_mut()
            .iter_mut()
            .flat_map(|l| l.params.iter_mut())
            .collect()
    }

    /// Parameters with `requires_grad` set.
    fn trainable_parameters(&self) -> Vec<&Parameter> {
        self.parameters()
            .into_iter()
            .filter(|p| p.requires_grad)
            .collect()
    }

    /// Parameters with `requires_grad` set, mutably.
    fn trainable_parameters_mut(&mut self) -> Vec<&mut Parameter> {
        self.parameters_mut()
            .into_iter()
            .filter(|p| p.requires_grad)
            .collect()
    }
}

/// A plain stack of layers.
#[derive(Clone, Debug, Default)]
pub struct Sequential {
    layers: Vec<Layer>,
}

impl Sequential {
    /// Create an empty model.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a layer.
    pub fn push(mut self, layer: Layer) -> Self {
        self.layers.push(layer);
        self
    }

    /// Look up a layer by name.
    pub fn layer(&self, name: &str) -> Option<&Layer> {
        self.layers.iter().find(|l| l.name == name)
    }

    /// Look up a layer by name, mutably.
    pub fn layer_mut(&mut self, name: &str) -> Option<&mut Layer> {
        self.layers.iter_mut().find(|l| l.name == name)
    }
}

impl Module for Sequential {
    fn layers(&self) -> &[Layer] {
        &self.layers
    }

    fn layers_mut(&mut self) -> &mut [Layer] {
        &mut self.layers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn model() -> Sequential {
        let fc1 = Layer::linear("fc1", array![[1.0, 0.0], [0.0, 1.0]], Some(array![0.5, -0.5].into_dyn()))
            .expect("fc1");
        let mut fc2 = Layer::linear("fc2", array![[2.0, 1.0]], None).expect("fc2");
        fc2.params[0].requires_grad = false;
        Sequential::new()
            .push(fc1)
            .push(Layer::new("relu", LayerKind::Other("ReLU".into()), vec![]))
            .push(fc2)
    }

    #[test]
    fn parameter_order_follows_layers() {
        let m = model();
        let names: Vec<_> = m.parameters().iter().map(|p| p.name.clone()).collect();
        assert_eq!(names, ["fc1.weight", "fc1.bias", "fc2.weight"]);
        let trainable: Vec<_> = m.trainable_parameters().iter().map(|p| p.name.clone()).collect();
        assert_eq!(trainable, ["fc1.weight", "fc1.bias"]);
    }

    #[test]
    fn linear_forward_applies_bias() {
        let m = model();
        let out = m
            .layer("fc1")
            .expect("fc1")
            .linear_forward(&array![[1.0, 2.0]])
            .expect("forward");
        assert_eq!(out, array![[1.5, 1.5]]);
    }

    #[test]
    fn linear_rejects_mismatched_bias() {
        assert!(Layer::linear("fc", array![[1.0, 0.0]], Some(array![1.0, 2.0].into_dyn())).is_err());
    }

    #[test]
    fn linear_forward_checks_features() {
        let m = model();
        let fc1 = m.layer("fc1").expect("fc1");
        assert!(fc1.linear_forward(&array![[1.0, 2.0, 3.0]]).is_err());
        assert!(m.layer("relu").expect("relu").linear_forward(&array![[1.0]]).is_err());
    }
}
