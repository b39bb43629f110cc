//! Per-sample gradient clipping for bounded sensitivity.
//!
//! The clipper reads `grad_sample` from every trainable parameter, rescales
//! each example so its norm does not exceed the configured bound, sums the
//! rescaled examples and writes the batch mean into `grad`. Micro-batches
//! can be folded in ahead of a step with
//! [`PerSampleGradientClipper::accumulate_grads`].

use ndarray::Axis;

use crate::error::{DpError, Result};
use crate::module::{Module, Parameter};
use crate::tensor::{per_example_norms, NormType, Scalar, Tensor};

/// Default constant added to per-example norms before dividing.
pub const DEFAULT_STABILITY_EPS: f64 = 1e-6;

/// Clipping bound: one value for the whole model or one per trainable parameter.
#[derive(Clone, Debug, PartialEq)]
pub enum ClipBound {
    /// A single bound.
    Flat(f64),
    /// One bound per trainable parameter, in parameter order.
    PerParameter(Vec<f64>),
}

impl From<f64> for ClipBound {
    fn from(bound: f64) -> Self {
        ClipBound::Flat(bound)
    }
}

impl From<Vec<f64>> for ClipBound {
    fn from(bounds: Vec<f64>) -> Self {
        ClipBound::PerParameter(bounds)
    }
}

impl ClipBound {
    /// Check that every bound is finite and positive.
    pub fn validate(&self) -> Result<()> {
        let bounds: &[f64] = match self {
            ClipBound::Flat(b) => std::slice::from_ref(b),
            ClipBound::PerParameter(v) if v.is_empty() => {
                return Err(DpError::config("per-parameter clip bounds must be non-empty"))
            }
            ClipBound::PerParameter(v) => v,
        };
        match bounds.iter().find(|b| !b.is_finite() || **b <= 0.0) {
            Some(b) => Err(DpError::config(format!(
                "max_grad_norm must be finite and positive, got {b}"
            ))),
            None => Ok(()),
        }
    }

    fn get(&self, index: usize) -> f64 {
        match self {
            ClipBound::Flat(b) => *b,
            ClipBound::PerParameter(v) => v[index],
        }
    }
}

/// Additional clipper settings.
#[derive(Clone, Debug, PartialEq)]
pub struct ClipperConfig {
    /// Clip every parameter against its own bound even when the bound is flat.
    pub clip_per_layer: bool,
    /// Constant added to per-example norms before dividing.
    pub stability_eps: f64,
    /// Collect per-step clipping statistics.
    pub enable_stat: bool,
}

impl Default for ClipperConfig {
    fn default() -> Self {
        Self {
            clip_per_layer: false,
            stability_eps: DEFAULT_STABILITY_EPS,
            enable_stat: false,
        }
    }
}

impl ClipperConfig {
    /// Validate the settings.
    pub fn validate(&self) -> Result<()> {
        if !self.stability_eps.is_finite() || self.stability_eps <= 0.0 {
            return Err(DpError::config(format!(
                "stability_eps must be finite and positive, got {}",
                self.stability_eps
            )));
        }
        Ok(())
    }
}

/// Scale decision for a single example.
#[derive(Clone, Debug)]
pub struct ClipReport {
    /// Norm before clipping.
    pub original_norm: f64,
    /// Whether the example was scaled down.
    pub clipped: bool,
    /// Scale factor applied (1.0 if not clipped, 0.0 if dropped).
    pub scale: f64,
}

/// Compute `min(1, max_norm / (norm + eps))`.
///
/// Examples with a non-finite norm get scale 0 and must be dropped.
pub fn clip_factor(norm: f64, max_norm: f64, eps: f64) -> ClipReport {
    if !norm.is_finite() {
        return ClipReport {
            original_norm: norm,
            clipped: true,
            scale: 0.0,
        };
    }
    let scale = (max_norm / (norm + eps)).min(1.0);
    ClipReport {
        original_norm: norm,
        clipped: scale < 1.0,
        scale,
    }
}

/// Output of one clipping step.
#[derive(Clone, Debug, PartialEq)]
pub struct ClipResult {
    /// Clip bound used, one per trainable parameter.
    pub clip_values: Vec<f64>,
    /// Number of examples aggregated.
    pub batch_size: usize,
}

/// Clipping statistics for the most recent step.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ClipStats {
    /// Examples aggregated.
    pub examples: usize,
    /// Scale decisions taken (one per example, or per parameter and example).
    pub decisions: usize,
    /// Per-(parameter, example) decisions that scaled the gradient down.
    pub clipped: usize,
    /// Per-(parameter, example) decisions dropped for non-finite norms.
    pub dropped: usize,
    /// Largest per-example norm seen.
    pub max_norm: f64,
    /// Mean per-example norm.
    pub mean_norm: f64,
}

/// Per-example gradients of one batch, clipped and summed per parameter.
struct ClippedBatch {
    sums: Vec<Option<Tensor>>,
    batch_size: usize,
    stats: ClipStats,
}

/// Clips and aggregates per-example gradients of a model.
#[derive(Debug)]
pub struct PerSampleGradientClipper {
    bound: ClipBound,
    batch_dim: usize,
    norm_type: NormType,
    config: ClipperConfig,
    accumulated: Vec<Option<Tensor>>,
    accumulated_batch: usize,
    stats: Option<ClipStats>,
    closed: bool,
}

impl PerSampleGradientClipper {
    /// Create a clipper.
    pub fn new(
        bound: ClipBound,
        batch_dim: usize,
        norm_type: NormType,
        config: ClipperConfig,
    ) -> Result<Self> {
        bound.validate()?;
        norm_type.validate()?;
        config.validate()?;
        Ok(Self {
            bound,
            batch_dim,
            norm_type,
            config,
            accumulated: Vec::new(),
            accumulated_batch: 0,
            stats: None,
            closed: false,
        })
    }

    /// Check that the bound list fits the model.
    pub fn check_model(&self, model: &dyn Module) -> Result<()> {
        if let ClipBound::PerParameter(bounds) = &self.bound {
            let n = model.trainable_parameters().len();
            if bounds.len() != n {
                return Err(DpError::config(format!(
                    "{} clip bounds for {n} trainable parameters",
                    bounds.len()
                )));
            }
        }
        Ok(())
    }

    fn per_layer(&self) -> bool {
        self.config.clip_per_layer || matches!(self.bound, ClipBound::PerParameter(_))
    }

    /// Examples folded in by `accumulate_grads` since the last step.
    pub fn accumulated_batch_size(&self) -> usize {
        self.accumulated_batch
    }

    /// Statistics of the last clipping pass, when enabled.
    pub fn stats(&self) -> Option<&ClipStats> {
        self.stats.as_ref()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(DpError::state("clipper has been closed"));
        }
        Ok(())
    }

    fn clip_batch(&self, params: &[&Parameter]) -> Result<Option<ClippedBatch>> {
        let mut batch_size: Option<usize> = None;
        let mut norms: Vec<Option<Vec<f64>>> = Vec::with_capacity(params.len());
        for p in params {
            let Some(sample) = p.grad_sample.as_ref() else {
                norms.push(None);
                continue;
            };
            if self.batch_dim >= sample.ndim() {
                return Err(DpError::invalid(format!(
                    "{}: batch_dim {} out of range for per-example gradient of rank {}",
                    p.name,
                    self.batch_dim,
                    sample.ndim()
                )));
            }
            let n = sample.len_of(Axis(self.batch_dim));
            match batch_size {
                Some(b) if b != n => {
                    return Err(DpError::invalid(format!(
                        "{}: {n} per-example gradients, expected {b}",
                        p.name
                    )))
                }
                _ => batch_size = Some(n),
            }
            let example_shape: Vec<usize> = sample
                .shape()
                .iter()
                .enumerate()
                .filter(|&(axis, _)| axis != self.batch_dim)
                .map(|(_, &d)| d)
                .collect();
            if example_shape.as_slice() != p.shape() {
                return Err(DpError::invalid(format!(
                    "{}: per-example gradient shape {:?} does not match parameter shape {:?}",
                    p.name,
                    example_shape,
                    p.shape()
                )));
            }
            norms.push(Some(per_example_norms(sample, self.batch_dim, self.norm_type)?));
        }

        let Some(batch_size) = batch_size else {
            return Ok(None);
        };

        let eps = self.config.stability_eps;
        let mut stats = ClipStats {
            examples: batch_size,
            ..ClipStats::default()
        };

        // scales[i][n]: factor for parameter i, example n.
        let scales: Vec<Option<Vec<f64>>> = if self.per_layer() {
            norms
                .iter()
                .enumerate()
                .map(|(i, norms)| {
                    norms.as_ref().map(|norms| {
                        norms
                            .iter()
                            .map(|&n| record(&mut stats, clip_factor(n, self.bound.get(i), eps)))
                            .collect()
                    })
                })
                .collect()
        } else {
            let bound = self.bound.get(0);
            let joint: Vec<f64> = (0..batch_size)
                .map(|n| {
                    let total = self
                        .norm_type
                        .combine(norms.iter().flatten().map(|norms| norms[n]));
                    record(&mut stats, clip_factor(total, bound, eps))
                })
                .collect();
            norms
                .iter()
                .map(|norms| norms.as_ref().map(|_| joint.clone()))
                .collect()
        };
        let finite = stats.decisions - stats.dropped;
        if finite > 0 {
            stats.mean_norm /= finite as f64;
        }

        let mut sums = Vec::with_capacity(params.len());
        for (p, scales) in params.iter().zip(&scales) {
            let (Some(sample), Some(scales)) = (p.grad_sample.as_ref(), scales.as_ref()) else {
                sums.push(None);
                continue;
            };
            let mut acc = Tensor::zeros(p.data.raw_dim());
            for (example, &scale) in sample.axis_iter(Axis(self.batch_dim)).zip(scales) {
                if scale == 0.0 {
                    continue;
                }
                acc.scaled_add(scale as Scalar, &example);
            }
            sums.push(Some(acc));
        }

        Ok(Some(ClippedBatch {
            sums,
            batch_size,
            stats,
        }))
    }

    fn merge(&mut self, batch: ClippedBatch) {
        if self.accumulated.len() < batch.sums.len() {
            self.accumulated.resize(batch.sums.len(), None);
        }
        for (slot, sum) in self.accumulated.iter_mut().zip(batch.sums) {
            *slot = match (slot.take(), sum) {
                (Some(a), Some(b)) => Some(a + &b),
                (a, b) => a.or(b),
            };
        }
        self.accumulated_batch += batch.batch_size;
        if batch.stats.dropped > 0 {
            tracing::warn!(
                dropped = batch.stats.dropped,
                "dropping per-example gradients with non-finite norms"
            );
        }
        if self.config.enable_stat {
            tracing::debug!(
                examples = batch.stats.examples,
                clipped = batch.stats.clipped,
                dropped = batch.stats.dropped,
                max_norm = batch.stats.max_norm,
                mean_norm = batch.stats.mean_norm,
                "per-sample clipping"
            );
            self.stats = Some(batch.stats);
        }
    }

    /// Clip the current per-example gradients into the accumulator.
    pub fn accumulate_grads(&mut self, model: &dyn Module) -> Result<()> {
        self.ensure_open()?;
        self.check_model(model)?;
        let batch = self
            .clip_batch(&model.trainable_parameters())?
            .ok_or_else(|| DpError::invalid("no per-example gradients to accumulate"))?;
        self.merge(batch);
        Ok(())
    }

    /// Clip, aggregate, and write `sum / batch_size` into each parameter's `grad`.
    pub fn step(&mut self, model: &mut dyn Module) -> Result<ClipResult> {
        self.ensure_open()?;
        self.check_model(&*model)?;
        if let Some(batch) = self.clip_batch(&model.trainable_parameters())? {
            self.merge(batch);
        }
        if self.accumulated_batch == 0 {
            return Err(DpError::invalid(
                "no per-example gradients to clip; run a backward pass first",
            ));
        }

        let batch_size = self.accumulated_batch;
        let sums = std::mem::take(&mut self.accumulated);
        self.accumulated_batch = 0;

        let mut params = model.trainable_parameters_mut();
        let clip_values = (0..params.len()).map(|i| self.bound.get(i)).collect();
        for (p, sum) in params.iter_mut().zip(sums) {
            if let Some(sum) = sum {
                p.grad = Some(sum / batch_size as Scalar);
            }
        }

        Ok(ClipResult {
            clip_values,
            batch_size,
        })
    }

    /// Forget accumulated micro-batches.
    pub fn zero_grads(&mut self) {
        self.accumulated.clear();
        self.accumulated_batch = 0;
    }

    /// Release buffers; the clipper refuses further work afterwards.
    pub fn close(&mut self) {
        self.zero_grads();
        self.stats = None;
        self.closed = true;
    }
}

fn record(stats: &mut ClipStats, report: ClipReport) -> f64 {
    stats.decisions += 1;
    if report.original_norm.is_finite() {
        stats.max_norm = stats.max_norm.max(report.original_norm);
        stats.mean_norm += report.original_norm;
    } else {
        stats.dropped += 1;
    }
    if report.clipped && report.scale > 0.0 {
        stats.clipped += 1;
    }
    report.scale
}
