//! XOR problem training example.
//!
//! Trains a 2 -> 16 -> 1 network with momentum SGD. XOR is not linearly
//! separable, so the hidden layer is required.

use tg_backend_cpu::CpuBackend;
use tg_nn::{mse_loss, Activation, Linear, Momentum, Optimizer};
use tg_tensor::prelude::*;

fn main() -> Result<()> {
    env_logger::init();
    let eng = Engine::new(CpuBackend);

    let inputs = [[0.0f32, 0.0], [0.0, 1.0], [1.0, 0.0], [1.0, 1.0]];
    let targets = [0.0f32, 1.0, 1.0, 0.0];
    let x = eng.tensor(inputs.concat(), [4, 2])?;
    let y = eng.tensor(targets.to_vec(), [4, 1])?;

    let layer1 = Linear::new(&eng, "layer1", 2, 16, true)?;
    let layer2 = Linear::new(&eng, "layer2", 16, 1, true)?;
    let forward = || {
        let h = Activation::Relu.output(&eng, &layer1.forward(&eng, &x)?)?;
        layer2.forward(&eng, &h)
    };

    let mut opt = Momentum::new(0.05, 0.9);

    println!("Training XOR network...\n");
    for epoch in 0..2000 {
        let cost = opt.minimize(&eng, &|| mse_loss(&eng, &forward()?, &y), epoch % 200 == 0, None)?;
        if let Some(cost) = cost {
            println!("Epoch {:4}: loss = {:.6}", epoch, eng.read_scalar(&cost)?);
            eng.dispose(&cost)?;
        }
    }

    println!("\nTesting trained network:");
    println!("========================");
    let outputs = eng.scope("predict", || eng.read_f32(&forward()?))?;

    let mut correct = 0;
    for ((input, target), output) in inputs.iter().zip(targets).zip(&outputs) {
        println!(
            "Input: [{:.0}, {:.0}] -> Output: {:.4} (target: {:.0})",
            input[0], input[1], output, target
        );
        if (*output > 0.5) == (target > 0.5) {
            correct += 1;
        }
    }

    println!("\nAccuracy: {correct}/4");
    if correct == 4 {
        println!("Successfully learned XOR!");
    }

    opt.dispose(&eng)?;
    println!("Live tensors at exit: {}", eng.num_live_tensors());
    Ok(())
}
