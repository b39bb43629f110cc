use dp_engine::core::{capture_linear, l2_norm, Layer, Module, Sequential, Tensor};
use dp_engine::{AttachState, Device, DpError, PrivacyConfig, PrivacyEngine};
use ndarray::array;
use proptest::prelude::*;

fn weight_only(features: usize) -> Sequential {
    let weight = ndarray::Array2::zeros((1, features));
    Sequential::new().push(Layer::linear("fc", weight, None).expect("fc"))
}

fn backward(model: &mut Sequential, activations: Tensor, backprops: Tensor) {
    let fc = model.layer_mut("fc").expect("fc");
    capture_linear(fc, &activations, &backprops, 0).expect("capture");
}

fn grad(model: &Sequential) -> Tensor {
    model.parameters()[0].grad.clone().expect("grad")
}

#[test]
fn example_above_bound_is_clipped_to_bound() {
    let config = PrivacyConfig::new(1, 100, 0.0, 1.0);
    let mut engine = PrivacyEngine::new(config, Device::Cpu).expect("engine");
    let mut model = weight_only(2);
    engine.attach(&model).expect("attach");
    backward(&mut model, array![[3.0, 4.0]].into_dyn(), array![[1.0]].into_dyn());
    engine.step(&mut model).expect("step");

    let g = grad(&model);
    assert!((l2_norm(&g) - 1.0).abs() < 1e-6);
    assert!((g[[0, 0]] as f64 - 0.6).abs() < 1e-6);
}

#[test]
fn zero_noise_multiplier_leaves_clipped_mean_untouched() {
    let config = PrivacyConfig::new(2, 100, 0.0, 10.0);
    let mut engine = PrivacyEngine::new(config, Device::Cpu).expect("engine");
    let mut model = weight_only(2);
    engine.attach(&model).expect("attach");
    backward(
        &mut model,
        array![[1.0, 2.0], [3.0, 4.0]].into_dyn(),
        array![[1.0], [1.0]].into_dyn(),
    );
    engine.step(&mut model).expect("step");
    assert_eq!(grad(&model), array![[2.0, 3.0]].into_dyn());
}

#[test]
fn independently_seeded_engines_draw_distinct_noise() {
    let config = PrivacyConfig::new(1, 100, 1.0, 1.0);
    for _ in 0..1000 {
        let mut grads = Vec::with_capacity(2);
        for _ in 0..2 {
            let mut engine = PrivacyEngine::new(config.clone(), Device::Cpu).expect("engine");
            let mut model = weight_only(4);
            engine.attach(&model).expect("attach");
            backward(
                &mut model,
                array![[1.0, 0.0, 0.0, 0.0]].into_dyn(),
                array![[0.5]].into_dyn(),
            );
            engine.step(&mut model).expect("step");
            grads.push(grad(&model));
        }
        assert_ne!(grads[0], grads[1]);
    }
}

#[test]
fn reference_accounting_scenario() {
    // q = 0.01, sigma = 1.0, one step, delta = 1e-5.
    let alphas = vec![2.0, 4.0, 8.0, 16.0, 32.0];
    let config = PrivacyConfig::new(1, 100, 1.0, 1.0).with_alphas(alphas.clone());
    let mut engine = PrivacyEngine::new(config, Device::Cpu).expect("engine");
    let mut model = weight_only(2);
    engine.attach(&model).expect("attach");
    backward(&mut model, array![[1.0, 1.0]].into_dyn(), array![[1.0]].into_dyn());
    engine.step(&mut model).expect("step");

    let (eps, best_alpha) = engine.get_privacy_spent(Some(1e-5)).expect("eps");
    assert!(eps.is_finite() && eps > 0.0);
    assert!(alphas.contains(&best_alpha));
}

#[test]
fn epsilon_grows_with_steps() {
    let config = PrivacyConfig::new(8, 800, 1.0, 1.0);
    let mut engine = PrivacyEngine::new(config, Device::Cpu).expect("engine");
    let mut model = weight_only(2);
    engine.attach(&model).expect("attach");

    let mut previous = engine.get_privacy_spent(None).expect("eps").0;
    for _ in 0..20 {
        backward(
            &mut model,
            ndarray::Array2::ones((8, 2)).into_dyn(),
            ndarray::Array2::ones((8, 1)).into_dyn(),
        );
        engine.step(&mut model).expect("step");
        engine.zero_grad(&mut model);
        let (eps, _) = engine.get_privacy_spent(None).expect("eps");
        assert!(eps >= previous);
        previous = eps;
    }
    assert_eq!(engine.steps(), 20);
}

#[test]
fn more_noise_spends_less_privacy() {
    let spent = |noise_multiplier: f64| {
        let config = PrivacyConfig::new(8, 800, noise_multiplier, 1.0);
        let mut engine = PrivacyEngine::new(config, Device::Cpu).expect("engine");
        let mut model = weight_only(2);
        engine.attach(&model).expect("attach");
        for _ in 0..10 {
            backward(
                &mut model,
                ndarray::Array2::ones((8, 2)).into_dyn(),
                ndarray::Array2::ones((8, 1)).into_dyn(),
            );
            engine.step(&mut model).expect("step");
            engine.zero_grad(&mut model);
        }
        engine.get_privacy_spent(Some(1e-5)).expect("eps").0
    };
    let eps: Vec<f64> = [0.5, 1.0, 2.0, 4.0].into_iter().map(spent).collect();
    assert!(eps.windows(2).all(|w| w[1] <= w[0]), "{eps:?}");
}

#[test]
fn engine_state_errors_are_reported() {
    let config = PrivacyConfig::new(1, 100, 1.0, 1.0);
    let mut engine = PrivacyEngine::new(config, Device::Cpu).expect("engine");
    let mut model = weight_only(2);
    backward(&mut model, array![[1.0, 1.0]].into_dyn(), array![[1.0]].into_dyn());
    assert!(matches!(engine.step(&mut model), Err(DpError::EngineState { .. })));

    engine.attach(&model).expect("attach");
    engine.detach().expect("detach");
    assert_eq!(engine.state(), AttachState::Detached);
    assert!(matches!(engine.attach(&model), Err(DpError::EngineState { .. })));
    assert!(matches!(engine.step(&mut model), Err(DpError::EngineState { .. })));
}

#[test]
fn invalid_config_fails_construction() {
    let config = PrivacyConfig::new(10, 5, 1.0, 1.0);
    assert!(matches!(
        PrivacyEngine::new(config, Device::Cpu),
        Err(DpError::Config { .. })
    ));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn noiseless_step_keeps_mean_gradient_within_bound(
        rows in proptest::collection::vec(proptest::collection::vec(-50.0f64..50.0, 3), 1..16),
        bound in 0.1f64..10.0,
    ) {
        let batch = rows.len();
        let config = PrivacyConfig::new(batch, batch * 10, 0.0, bound);
        let mut engine = PrivacyEngine::new(config, Device::Cpu).expect("engine");
        let mut model = weight_only(3);
        engine.attach(&model).expect("attach");
        let flat: Vec<f64> = rows.into_iter().flatten().collect();
        let activations = ndarray::Array2::from_shape_vec((batch, 3), flat).expect("shape");
        backward(
            &mut model,
            activations.into_dyn(),
            ndarray::Array2::ones((batch, 1)).into_dyn(),
        );
        engine.step(&mut model).expect("step");
        prop_assert!(l2_norm(&grad(&model)) <= bound * (1.0 + 1e-9));
    }
}
