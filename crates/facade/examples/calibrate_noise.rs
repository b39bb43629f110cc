use dp_engine::{calibrate_noise_multiplier, default_alphas};

fn main() -> dp_engine::Result<()> {
    let sample_rate = 256.0 / 60_000.0;
    let steps = 60 * 60_000 / 256;
    for target in [0.5, 1.0, 2.0, 8.0] {
        let nm = calibrate_noise_multiplier(target, 1e-5, sample_rate, steps, &default_alphas(), 1e-3)?;
        println!("epsilon {target:>4}: noise multiplier {nm:.3}");
    }
    Ok(())
}
