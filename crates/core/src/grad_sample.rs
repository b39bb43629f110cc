//! Per-example gradient capture.
//!
//! The privacy engine only needs `grad_sample` to be populated on every
//! trainable parameter before clipping. [`capture_linear`] fills it for
//! fully connected layers from the layer's input activations and the
//! gradient of the loss with respect to its output.

use ndarray::{concatenate, stack, Array2, ArrayView2, Axis, Ix2};

use crate::error::{DpError, Result};
use crate::module::{Layer, LayerKind, Module};
use crate::tensor::{Scalar, Tensor};

/// Drop every stored per-example gradient in the model.
pub fn clear_grad_sample(model: &mut dyn Module) {
    for p in model.parameters_mut() {
        p.grad_sample = None;
    }
}

fn batch_first<'a>(t: &'a Tensor, batch_dim: usize, what: &str) -> Result<ArrayView2<'a, Scalar>> {
    let view = t
        .view()
        .into_dimensionality::<Ix2>()
        .map_err(|e| DpError::invalid(format!("{what} must be a matrix: {e}")))?;
    match batch_dim {
        0 => Ok(view),
        1 => Ok(view.reversed_axes()),
        _ => Err(DpError::invalid(format!(
            "batch_dim {batch_dim} out of range for {what}"
        ))),
    }
}

fn store(existing: Option<Tensor>, fresh: Tensor, batch_dim: usize) -> Result<Tensor> {
    match existing {
        None => Ok(fresh),
        Some(prev) => concatenate(Axis(batch_dim), &[prev.view(), fresh.view()])
            .map_err(|e| DpError::invalid(format!("cannot append per-example gradients: {e}"))),
    }
}

/// Record per-example gradients for a fully connected layer.
///
/// `activations` is the layer input and `backprops` the gradient of the
/// loss w.r.t. the layer output, both 2-D with examples along `batch_dim`.
/// A repeated capture without [`clear_grad_sample`] appends to the stored
/// per-example gradients, as a second backward pass over more examples
/// would. The aggregated `grad` of each trainable parameter is updated too.
pub fn capture_linear(
    layer: &mut Layer,
    activations: &Tensor,
    backprops: &Tensor,
    batch_dim: usize,
) -> Result<()> {
    if layer.kind != LayerKind::Linear {
        return Err(DpError::invalid(format!(
            "{}: capture_linear on a {:?} layer",
            layer.name, layer.kind
        )));
    }
    let a = batch_first(activations, batch_dim, "activations")?;
    let b = batch_first(backprops, batch_dim, "backprops")?;
    if a.nrows() != b.nrows() {
        return Err(DpError::invalid(format!(
            "{}: {} activations but {} backprops",
            layer.name,
            a.nrows(),
            b.nrows()
        )));
    }

    let weight_grads: Vec<Array2<Scalar>> = a
        .outer_iter()
        .zip(b.outer_iter())
        .map(|(x, g)| {
            let g = g.insert_axis(Axis(1));
            let x = x.insert_axis(Axis(0));
            g.dot(&x)
        })
        .collect();
    let weight_views: Vec<_> = weight_grads.iter().map(|w| w.view()).collect();
    let weight_sample = stack(Axis(batch_dim), &weight_views)
        .map_err(|e| DpError::invalid(format!("{}: {e}", layer.name)))?
        .into_dyn();
    let bias_sample = stack(Axis(batch_dim), &b.outer_iter().collect::<Vec<_>>())
        .map_err(|e| DpError::invalid(format!("{}: {e}", layer.name)))?
        .into_dyn();

    let name = layer.name.clone();
    for (i, param) in layer.params.iter_mut().enumerate() {
        if !param.requires_grad {
            continue;
        }
        let sample = match i {
            0 => weight_sample.clone(),
            1 => bias_sample.clone(),
            _ => {
                return Err(DpError::invalid(format!(
                    "{name}: unexpected parameter {}",
                    param.name
                )))
            }
        };
        let per_example_shape = &sample.shape()[..batch_dim]
            .iter()
            .chain(&sample.shape()[batch_dim + 1..])
            .copied()
            .collect::<Vec<_>>();
        if per_example_shape.as_slice() != param.shape() {
            return Err(DpError::invalid(format!(
                "{}: per-example gradient shape {:?} does not match parameter shape {:?}",
                param.name,
                per_example_shape,
                param.shape()
            )));
        }
        let summed = sample.sum_axis(Axis(batch_dim));
        param.grad = Some(match param.grad.take() {
            Some(g) => g + &summed,
            None => summed,
        });
        param.grad_sample = Some(store(param.grad_sample.take(), sample, batch_dim)?);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::Sequential;
    use ndarray::array;

    fn layer() -> Layer {
        Layer::linear("fc", array![[0.0, 0.0], [0.0, 0.0]], Some(array![0.0, 0.0].into_dyn()))
            .expect("layer")
    }

    #[test]
    fn captures_outer_products() {
        let mut fc = layer();
        let acts = array![[1.0, 2.0], [3.0, 4.0]].into_dyn();
        let back = array![[1.0, 0.0], [0.0, 2.0]].into_dyn();
        capture_linear(&mut fc, &acts, &back, 0).expect("capture");

        let w = fc.params[0].grad_sample.as_ref().expect("weight sample");
        assert_eq!(w.shape(), &[2, 2, 2]);
        assert_eq!(w.index_axis(Axis(0), 0), array![[1.0, 2.0], [0.0, 0.0]].into_dyn());
        assert_eq!(w.index_axis(Axis(0), 1), array![[0.0, 0.0], [6.0, 8.0]].into_dyn());

        let grad = fc.params[0].grad.as_ref().expect("weight grad");
        assert_eq!(grad, &array![[1.0, 2.0], [6.0, 8.0]].into_dyn());
        let bias = fc.params[1].grad_sample.as_ref().expect("bias sample");
        assert_eq!(bias, &array![[1.0, 0.0], [0.0, 2.0]].into_dyn());
    }

    #[test]
    fn batch_dim_one_stacks_on_second_axis() {
        let mut fc = layer();
        // Two examples laid out column-wise.
        let acts = array![[1.0, 3.0], [2.0, 4.0]].into_dyn();
        let back = array![[1.0, 0.0], [0.0, 2.0]].into_dyn();
        capture_linear(&mut fc, &acts, &back, 1).expect("capture");
        let w = fc.params[0].grad_sample.as_ref().expect("weight sample");
        assert_eq!(w.index_axis(Axis(1), 1), array![[0.0, 0.0], [6.0, 8.0]].into_dyn());
    }

    #[test]
    fn second_capture_appends_examples() {
        let mut fc = layer();
        let acts = array![[1.0, 0.0]].into_dyn();
        let back = array![[1.0, 1.0]].into_dyn();
        capture_linear(&mut fc, &acts, &back, 0).expect("first");
        capture_linear(&mut fc, &acts, &back, 0).expect("second");
        assert_eq!(fc.params[0].grad_sample.as_ref().expect("sample").shape(), &[2, 2, 2]);
        assert_eq!(fc.params[1].grad, Some(array![2.0, 2.0].into_dyn()));
    }

    #[test]
    fn frozen_parameters_are_skipped() {
        let mut fc = layer();
        fc.params[1].requires_grad = false;
        capture_linear(&mut fc, &array![[1.0, 1.0]].into_dyn(), &array![[1.0, 1.0]].into_dyn(), 0)
            .expect("capture");
        assert!(fc.params[1].grad_sample.is_none());
        assert!(fc.params[1].grad.is_none());
    }

    #[test]
    fn clear_removes_samples_only() {
        let mut fc = layer();
        capture_linear(&mut fc, &array![[1.0, 1.0]].into_dyn(), &array![[1.0, 1.0]].into_dyn(), 0)
            .expect("capture");
        let mut model = Sequential::new().push(fc);
        clear_grad_sample(&mut model);
        assert!(model.parameters().iter().all(|p| p.grad_sample.is_none()));
        assert!(model.parameters().iter().all(|p| p.grad.is_some()));
    }

    #[test]
    fn mismatched_batch_is_rejected() {
        let mut fc = layer();
        let err = capture_linear(
            &mut fc,
            &array![[1.0, 1.0], [2.0, 2.0]].into_dyn(),
            &array![[1.0, 1.0]].into_dyn(),
            0,
        );
        assert!(err.is_err());
    }
}
