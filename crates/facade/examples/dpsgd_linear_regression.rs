use dp_engine::core::{capture_linear, Layer, Module, Sequential};
use dp_engine::{Device, DpOptimizer, PrivacyConfig, PrivacyEngine, Sgd};
use ndarray::{array, Array2, Axis};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing_subscriber::EnvFilter;

const SAMPLE_SIZE: usize = 6400;
const BATCH_SIZE: usize = 64;

fn main() -> dp_engine::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut rng = ChaCha8Rng::seed_from_u64(42);
    let mut model = Sequential::new().push(Layer::linear(
        "fc",
        array![[0.0, 0.0, 0.0]],
        Some(array![0.0].into_dyn()),
    )?);

    let config = PrivacyConfig::new(BATCH_SIZE, SAMPLE_SIZE, 1.1, 1.0).with_target_delta(1e-5);
    let engine = PrivacyEngine::new(config, Device::Cpu)?;
    let mut optimizer = DpOptimizer::new(Sgd::with_lr(0.5)?, engine, &model)?;

    let truth = array![1.5, -2.0, 0.5];
    for epoch in 0..5 {
        for _ in 0..SAMPLE_SIZE / BATCH_SIZE {
            let x = Array2::from_shape_fn((BATCH_SIZE, 3), |_| rng.gen_range(-1.0..1.0));
            let y = x.dot(&truth) + 0.1;

            optimizer.zero_grad(&mut model);
            let fc = model.layer_mut("fc").ok_or_else(|| dp_engine::DpError::invalid("no fc"))?;
            let pred = fc.linear_forward(&x)?;
            let residual = (&pred.index_axis(Axis(1), 0) - &y).insert_axis(Axis(1));
            capture_linear(fc, &x.into_dyn(), &residual.into_dyn(), 0)?;
            optimizer.step(&mut model)?;
        }
        let (eps, alpha) = optimizer.privacy_spent(None)?;
        println!(
            "epoch {epoch}: weights {} (eps = {eps:.3}, delta = 1e-5, alpha = {alpha})",
            model.parameters()[0].data
        );
    }

    let (_sgd, engine) = optimizer.detach()?;
    println!("trained for {} private steps", engine.steps());
    Ok(())
}
