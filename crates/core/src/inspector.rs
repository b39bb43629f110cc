//! Structural validation of models before attaching a privacy engine.

use crate::error::{DpError, Result};
use crate::module::{Layer, LayerKind, Module};

/// A single structural rule applied to every layer.
#[derive(Clone, Debug)]
pub struct LayerInspector {
    /// Short rule name, used in violation reports.
    pub name: &'static str,
    /// Returns `true` when the layer is acceptable.
    pub check: fn(&Layer) -> bool,
    /// Explanation attached to each violation.
    pub message: &'static str,
}

fn no_batch_norm(layer: &Layer) -> bool {
    layer.kind != LayerKind::BatchNorm
}

fn no_running_stats(layer: &Layer) -> bool {
    !matches!(
        layer.kind,
        LayerKind::InstanceNorm {
            track_running_stats: true
        }
    )
}

fn has_grad_sampler(layer: &Layer) -> bool {
    !layer.is_trainable() || layer.kind.has_grad_sampler()
}

/// Rejects models whose layers break per-example gradient isolation.
#[derive(Clone, Debug)]
pub struct ModelInspector {
    inspectors: Vec<LayerInspector>,
}

impl Default for ModelInspector {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelInspector {
    /// Inspector with the standard rule set.
    pub fn new() -> Self {
        Self {
            inspectors: vec![
                LayerInspector {
                    name: "batch_norm",
                    check: no_batch_norm,
                    message: "BatchNorm mixes statistics across examples; use GroupNorm or LayerNorm",
                },
                LayerInspector {
                    name: "running_stats",
                    check: no_running_stats,
                    message: "InstanceNorm must not track running statistics",
                },
                LayerInspector {
                    name: "grad_sampler",
                    check: has_grad_sampler,
                    message: "no per-example gradient sampler for this layer kind",
                },
            ],
        }
    }

    /// Add a custom rule.
    pub fn with_inspector(mut self, inspector: LayerInspector) -> Self {
        self.inspectors.push(inspector);
        self
    }

    /// Collect every violation without failing.
    pub fn violations(&self, model: &dyn Module) -> Vec<String> {
        let mut out = Vec::new();
        for layer in model.layers() {
            for inspector in &self.inspectors {
                if !(inspector.check)(layer) {
                    out.push(format!(
                        "{} ({:?}) [{}]: {}",
                        layer.name, layer.kind, inspector.name, inspector.message
                    ));
                }
            }
        }
        if model.trainable_parameters().is_empty() {
            out.push("model has no trainable parameters".to_string());
        }
        out
    }

    /// Validate a model, failing with [`DpError::UnsupportedModule`].
    pub fn validate(&self, model: &dyn Module) -> Result<()> {
        let violations = self.violations(model);
        if violations.is_empty() {
            Ok(())
        } else {
            Err(DpError::UnsupportedModule { violations })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::{Parameter, Sequential};
    use ndarray::array;

    fn linear(name: &str) -> Layer {
        Layer::linear(name, array![[1.0, 0.0]], None).expect("linear")
    }

    fn norm_layer(name: &str, kind: LayerKind) -> Layer {
        Layer::new(
            name,
            kind,
            vec![Parameter::new(format!("{name}.weight"), array![1.0].into_dyn())],
        )
    }

    #[test]
    fn plain_model_passes() {
        let model = Sequential::new()
            .push(linear("fc1"))
            .push(Layer::new("act", LayerKind::Other("Tanh".into()), vec![]))
            .push(norm_layer("ln", LayerKind::LayerNorm));
        assert!(ModelInspector::new().validate(&model).is_ok());
    }

    #[test]
    fn batch_norm_is_rejected() {
        let model = Sequential::new()
            .push(linear("fc1"))
            .push(norm_layer("bn", LayerKind::BatchNorm));
        match ModelInspector::new().validate(&model) {
            Err(DpError::UnsupportedModule { violations }) => {
                assert!(violations.iter().any(|v| v.starts_with("bn") && v.contains("batch_norm")));
            }
            other => panic!("expected UnsupportedModule, got {other:?}"),
        }
    }

    #[test]
    fn instance_norm_with_running_stats_is_rejected() {
        let model = Sequential::new().push(norm_layer(
            "inorm",
            LayerKind::InstanceNorm {
                track_running_stats: true,
            },
        ));
        assert!(ModelInspector::new().validate(&model).is_err());
    }

    #[test]
    fn unknown_trainable_layer_is_rejected() {
        let model = Sequential::new()
            .push(linear("fc"))
            .push(norm_layer("lstm", LayerKind::Other("Lstm".into())));
        let violations = ModelInspector::new().violations(&model);
        assert_eq!(violations.len(), 1);
        assert!(violations[0].contains("grad_sampler"));
    }

    #[test]
    fn frozen_unknown_layer_is_fine() {
        let mut lstm = norm_layer("lstm", LayerKind::Other("Lstm".into()));
        lstm.params[0].requires_grad = false;
        let model = Sequential::new().push(linear("fc")).push(lstm);
        assert!(ModelInspector::new().validate(&model).is_ok());
    }

    #[test]
    fn model_without_trainable_parameters_is_rejected() {
        let mut fc = linear("fc");
        fc.params[0].requires_grad = false;
        let model = Sequential::new().push(fc);
        assert!(ModelInspector::new().validate(&model).is_err());
    }

    #[test]
    fn custom_inspector_runs() {
        fn no_embeddings(layer: &Layer) -> bool {
            layer.kind != LayerKind::Embedding
        }
        let inspector = ModelInspector::new().with_inspector(LayerInspector {
            name: "no_embedding",
            check: no_embeddings,
            message: "embeddings disabled",
        });
        let model = Sequential::new().push(norm_layer("emb", LayerKind::Embedding));
        assert!(inspector.validate(&model).is_err());
    }
}
