//! Demo driver for the tensor engine.
//!
//! Checks reverse-mode gradients against finite differences, then trains a
//! small MLP on a 1-D regression task with the chosen optimizer and backend.

use std::process::ExitCode;

use clap::{Parser, ValueEnum};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tg_backend_cpu::CpuBackend;
use tg_backend_wgpu::WgpuBackend;
use tg_nn::{mse_loss, Activation, Adadelta, Adagrad, Adam, Adamax, Linear, Momentum, Optimizer, RmsProp, Sgd};
use tg_tensor::prelude::*;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum BackendKind {
    Cpu,
    Wgpu,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OptimizerKind {
    Sgd,
    Momentum,
    Adagrad,
    Adadelta,
    Adam,
    Adamax,
    Rmsprop,
}

#[derive(Debug, Parser)]
#[command(name = "tg", about = "Train a small model and check gradients against finite differences")]
struct Args {
    #[arg(long, value_enum, default_value = "cpu")]
    backend: BackendKind,

    /// Training steps.
    #[arg(long, default_value_t = 300)]
    steps: usize,

    #[arg(long, default_value_t = 0.05)]
    lr: f32,

    #[arg(long, value_enum, default_value = "adam")]
    optimizer: OptimizerKind,

    /// Check every op output for NaN.
    #[arg(long)]
    debug: bool,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let config = EngineConfig {
        debug: args.debug,
        ..EngineConfig::default()
    };

    let outcome = match args.backend {
        BackendKind::Cpu => run(Engine::with_config(CpuBackend, config), &args),
        BackendKind::Wgpu => match WgpuBackend::new() {
            Ok(backend) => {
                log::info!("running on {}", backend.adapter_info().name);
                run(Engine::with_config(backend, config), &args)
            }
            Err(err) => {
                log::warn!("wgpu unavailable ({err}), falling back to the CPU backend");
                run(Engine::with_config(CpuBackend, config), &args)
            }
        },
    };

    match outcome {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            log::error!("{err}");
            ExitCode::FAILURE
        }
    }
}

fn make_optimizer<B: Backend>(kind: OptimizerKind, lr: f32) -> Box<dyn Optimizer<B>> {
    match kind {
        OptimizerKind::Sgd => Box::new(Sgd::new(lr)),
        OptimizerKind::Momentum => Box::new(Momentum::new(lr, 0.9)),
        OptimizerKind::Adagrad => Box::new(Adagrad::new(lr)),
        OptimizerKind::Adadelta => Box::new(Adadelta::new(lr, 0.95)),
        OptimizerKind::Adam => Box::new(Adam::new(lr)),
        OptimizerKind::Adamax => Box::new(Adamax::new(lr)),
        OptimizerKind::Rmsprop => Box::new(RmsProp::new(lr)),
    }
}

/// Returns whether the gradient check passed.
fn run<B: Backend>(eng: Engine<B>, args: &Args) -> Result<bool> {
    let passed = gradient_check(&eng)?;
    train(&eng, args)?;

    let memory = eng.memory();
    println!(
        "\nLive at exit: {} tensors, {} bytes, {} variables",
        memory.num_tensors, memory.num_bytes, memory.num_variables
    );
    Ok(passed)
}

/// z = (x*y + sin(x)) / (y + 2) at (1.5, 2.5), with x and y packed in one tensor.
fn gradient_check<B: Backend>(eng: &Engine<B>) -> Result<bool> {
    println!("=== Gradient check: z = (x*y + sin(x)) / (y + 2) ===\n");

    let pick_x = eng.tensor(vec![1.0f32, 0.0], [2])?;
    let pick_y = eng.tensor(vec![0.0f32, 1.0], [2])?;
    let z = |p: &Tensor| -> Result<Tensor> {
        let x = eng.sum(&eng.mul(p, &pick_x)?, None, false)?;
        let y = eng.sum(&eng.mul(p, &pick_y)?, None, false)?;
        let numerator = eng.add(&eng.mul(&x, &y)?, &eng.sin(&x)?)?;
        eng.div(&numerator, &eng.add_scalar(&y, 2.0)?)
    };

    let point = eng.tensor(vec![1.5f32, 2.5], [2])?;
    let grads = eng.gradients(|| z(&point), &[&point])?;
    let value = eng.read_scalar(grads.value())?;
    let analytic = match grads.wrt(&point) {
        Some(g) => eng.read_f32(g)?,
        None => return Err(Error::MissingGradient(point.id())),
    };
    let numeric = eng.finite_diff(z, &point, 1e-3)?;

    println!("Value:      z = {value:.6}");
    println!("Autodiff:   dz/dx = {:.6}, dz/dy = {:.6}", analytic[0], analytic[1]);
    println!("Finite diff (eps=1e-3): dz/dx = {:.6}, dz/dy = {:.6}", numeric[0], numeric[1]);

    let max_err = analytic
        .iter()
        .zip(&numeric)
        .map(|(a, n)| (a - n).abs() / n.abs().max(1.0))
        .fold(0.0f32, f32::max);
    let tolerance = 1e-2;
    let passed = max_err < tolerance;
    println!(
        "{}: max relative error {max_err:.2e} vs tolerance {tolerance:.0e}\n",
        if passed { "PASS" } else { "FAIL" }
    );

    eng.dispose_all(&(pick_x, pick_y, point))?;
    eng.dispose_all(&grads.iter().map(|(_, g)| g.clone()).collect::<Vec<_>>())?;
    eng.dispose(grads.value())?;
    Ok(passed)
}

/// Fit y = sin(2x) on [-1, 1] with a 1 -> 16 -> 1 tanh network.
fn train<B: Backend>(eng: &Engine<B>, args: &Args) -> Result<()> {
    println!("=== Training 1-16-1 MLP on sin(2x) with {:?}, lr {} ===\n", args.optimizer, args.lr);

    let n = 32;
    let xs: Vec<f32> = (0..n).map(|i| -1.0 + 2.0 * i as f32 / (n - 1) as f32).collect();
    let ys: Vec<f32> = xs.iter().map(|x| (2.0 * x).sin()).collect();
    let x = eng.tensor(xs, [n, 1])?;
    let y = eng.tensor(ys, [n, 1])?;

    let mut rng = StdRng::seed_from_u64(42);
    let hidden = Linear::with_rng(eng, "hidden", 1, 16, true, &mut rng)?;
    let output = Linear::with_rng(eng, "output", 16, 1, true, &mut rng)?;
    let loss = || {
        let h = Activation::Tanh.output(eng, &hidden.forward(eng, &x)?)?;
        mse_loss(eng, &output.forward(eng, &h)?, &y)
    };

    let mut opt = make_optimizer::<B>(args.optimizer, args.lr);
    let report_every = (args.steps / 10).max(1);
    let mut last = f32::NAN;
    for step in 0..args.steps {
        let report = step % report_every == 0 || step + 1 == args.steps;
        if let Some(cost) = opt.minimize(eng, &loss, report, None)? {
            last = eng.read_scalar(&cost)?;
            eng.dispose(&cost)?;
            println!("Step {step:5}: loss = {last:.6}");
        }
    }
    log::info!("{} finished {} steps at loss {last:.6}", opt.name(), args.steps);

    opt.dispose(eng)?;
    hidden.dispose(eng)?;
    output.dispose(eng)?;
    eng.dispose_all(&(x, y))?;
    Ok(())
}
