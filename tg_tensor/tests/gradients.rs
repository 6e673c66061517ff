//! Integration tests for the differentiation driver.
//!
//! Analytic gradients are checked against central differences with
//! `Engine::finite_diff`.

use tg_backend_cpu::CpuBackend;
use tg_tensor::prelude::*;

const EPS: f32 = 1e-3;
const TOL: f32 = 1e-2;

// ============================================================================
// Test Utilities
// ============================================================================

fn engine() -> Engine<CpuBackend> {
    let _ = env_logger::builder().is_test(true).try_init();
    Engine::new(CpuBackend)
}

fn assert_close(name: &str, actual: &[f32], expected: &[f32], tol: f32) {
    assert_eq!(actual.len(), expected.len(), "{name}: length differs");
    for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
        let bound = tol * e.abs().max(1.0);
        assert!(
            (a - e).abs() <= bound,
            "{name}[{i}]: got {a}, expected {e} (tolerance {bound})"
        );
    }
}

/// Compare the analytic gradient of `f` at `x` with central differences.
fn check_gradient<F>(eng: &Engine<CpuBackend>, name: &str, x: &Tensor, f: F) -> Result<()>
where
    F: Fn(&Tensor) -> Result<Tensor>,
{
    let grads = eng.gradients(|| f(x), &[x])?;
    let analytic = eng.read_f32(grads.wrt(x).ok_or(Error::MissingGradient(x.id()))?)?;
    let numeric = eng.finite_diff(&f, x, EPS)?;
    eng.dispose_all(&grads)?;
    assert_close(name, &analytic, &numeric, TOL);
    Ok(())
}

// ============================================================================
// Basic contract
// ============================================================================

#[test]
fn test_square_sum_gradient() -> Result<()> {
    let eng = engine();
    let x = eng.tensor(vec![1.0f32, 2.0], [2])?;

    let grads = eng.gradients(|| eng.sum(&eng.square(&x)?, None, false), &[&x])?;

    assert_eq!(eng.read_scalar(grads.value())?, 5.0);
    assert_eq!(eng.read_f32(grads.wrt(&x).unwrap())?, vec![2.0, 4.0]);
    Ok(())
}

#[test]
fn test_gradients_release_intermediates() -> Result<()> {
    let eng = engine();
    let x = eng.tensor(vec![0.5f32, -1.0, 2.0], [3])?;
    let before = eng.num_live_tensors();

    let grads = eng.gradients(
        || {
            let a = eng.tanh(&x)?;
            let b = eng.mul(&a, &x)?;
            eng.mean(&eng.exp(&b)?, None, false)
        },
        &[&x],
    )?;

    // the value plus one gradient
    assert_eq!(eng.num_live_tensors(), before + 2);
    assert_eq!(grads.len(), 1);
    assert_eq!(eng.tape_len(), 0);
    assert!(!eng.is_recording());
    Ok(())
}

#[test]
fn test_gradient_accumulates_over_uses() -> Result<()> {
    let eng = engine();
    let x = eng.tensor(vec![0.3f32, -0.7, 1.1], [3])?;

    let f = |x: &Tensor| eng.sum(&eng.square(x)?, None, false);
    let g = |x: &Tensor| eng.sum(&eng.sin(x)?, None, false);

    let df = eng.gradients(|| f(&x), &[&x])?;
    let dg = eng.gradients(|| g(&x), &[&x])?;
    let both = eng.gradients(|| eng.add(&f(&x)?, &g(&x)?), &[&x])?;

    let expected: Vec<f32> = eng
        .read_f32(df.wrt(&x).unwrap())?
        .iter()
        .zip(eng.read_f32(dg.wrt(&x).unwrap())?)
        .map(|(a, b)| a + b)
        .collect();
    assert_close("f + g", &eng.read_f32(both.wrt(&x).unwrap())?, &expected, 1e-6);
    Ok(())
}

#[test]
fn test_repeated_runs_are_bit_identical() -> Result<()> {
    let eng = engine();
    let x = eng.tensor(vec![0.1f32, 0.2, 0.3, 0.4], [2, 2])?;
    let loss = || {
        let y = eng.matmul(&x, &x)?;
        let z = eng.add(&eng.sigmoid(&y)?, &eng.mul(&x, &y)?)?;
        eng.sum(&z, None, false)
    };

    let first = eng.gradients(loss, &[&x])?;
    let second = eng.gradients(loss, &[&x])?;
    assert_eq!(
        eng.read_f32(first.wrt(&x).unwrap())?,
        eng.read_f32(second.wrt(&x).unwrap())?
    );
    Ok(())
}

#[test]
fn test_second_derivative_of_cube() -> Result<()> {
    let eng = engine();
    let x = eng.scalar(3.0)?;

    let grads = eng.gradients(
        || {
            let inner = eng.gradients(|| eng.mul(&eng.mul(&x, &x)?, &x), &[&x])?;
            // d/dx x^3 = 3x^2 = 27
            assert_eq!(eng.read_scalar(inner.wrt(&x).unwrap())?, 27.0);
            Ok(inner.wrt(&x).unwrap().clone())
        },
        &[&x],
    )?;

    assert_eq!(eng.read_scalar(grads.wrt(&x).unwrap())?, 18.0);
    Ok(())
}

// ============================================================================
// Faults
// ============================================================================

#[test]
fn test_unconnected_source_is_missing() -> Result<()> {
    let eng = engine();
    let x = eng.ones([2])?;
    let unused = eng.ones([2])?;
    let before = eng.num_live_tensors();

    let result = eng.gradients(|| eng.sum(&x, None, false), &[&x, &unused]);
    assert!(matches!(result, Err(Error::MissingGradient(id)) if id == unused.id()));
    assert_eq!(eng.num_live_tensors(), before);
    Ok(())
}

#[test]
fn test_zero_gradient_is_not_missing() -> Result<()> {
    let eng = engine();
    let x = eng.tensor(vec![-1.0f32, -2.0], [2])?;
    let grads = eng.gradients(|| eng.sum(&eng.relu(&x)?, None, false), &[&x])?;
    assert_eq!(eng.read_f32(grads.wrt(&x).unwrap())?, vec![0.0, 0.0]);
    Ok(())
}

#[test]
fn test_path_through_comparison_is_not_differentiable() -> Result<()> {
    let eng = engine();
    let x = eng.tensor(vec![-1.0f32, 2.0], [2])?;
    let result = eng.gradients(
        || {
            let mask = eng.greater(&x, &eng.scalar(0.0)?)?;
            eng.sum(&eng.cast(&mask, DType::F32)?, None, false)
        },
        &[&x],
    );
    assert!(matches!(result, Err(Error::NotDifferentiable(id)) if id == x.id()));
    Ok(())
}

#[test]
fn test_non_scalar_output_needs_seed() -> Result<()> {
    let eng = engine();
    let x = eng.tensor(vec![1.0f32, 2.0, 3.0], [3])?;
    let result = eng.gradients(|| eng.square(&x), &[&x]);
    assert!(matches!(result, Err(Error::NonScalarLoss(_))));

    let dy = eng.tensor(vec![1.0f32, 0.0, -1.0], [3])?;
    let grads = eng.gradients_with_seed(|| eng.square(&x), &[&x], &dy)?;
    assert_eq!(eng.read_f32(grads.wrt(&x).unwrap())?, vec![2.0, 0.0, -6.0]);

    let bad_seed = eng.ones([2])?;
    let result = eng.gradients_with_seed(|| eng.square(&x), &[&x], &bad_seed);
    assert!(matches!(result, Err(Error::ShapeMismatch { op: "gradients", .. })));
    Ok(())
}

#[test]
fn test_disabled_recording_reports_missing() -> Result<()> {
    let config = EngineConfig {
        record_gradients: false,
        ..EngineConfig::default()
    };
    let eng = Engine::with_config(CpuBackend, config);
    let x = eng.ones([2])?;
    let result = eng.gradients(|| eng.sum(&eng.square(&x)?, None, false), &[&x]);
    assert!(matches!(result, Err(Error::MissingGradient(_))));
    Ok(())
}

#[test]
fn test_no_grad_blocks_the_path() -> Result<()> {
    let eng = engine();
    let x = eng.ones([2])?;
    let result = eng.gradients(
        || {
            let y = eng.no_grad(|| eng.square(&x))?;
            eng.sum(&y, None, false)
        },
        &[&x],
    );
    assert!(matches!(result, Err(Error::MissingGradient(_))));
    Ok(())
}

// ============================================================================
// Variables
// ============================================================================

#[test]
fn test_variable_gradients_skip_unreachable() -> Result<()> {
    let eng = engine();
    let w = eng.variable(&eng.tensor(vec![1.0f32, 2.0], [2])?, true, Some("w"))?;
    let _b = eng.variable(&eng.zeros([2])?, true, Some("b"))?;

    let (value, grads) = eng.variable_gradients(|| eng.sum(&eng.square(&w)?, None, false), None)?;

    assert_eq!(eng.read_scalar(&value)?, 5.0);
    assert_eq!(grads.len(), 1);
    assert_eq!(grads[0].0, w);
    assert_eq!(eng.read_f32(&grads[0].1)?, vec![2.0, 4.0]);
    Ok(())
}

#[test]
fn test_value_and_gradients_keep_source_order() -> Result<()> {
    let eng = engine();
    let a = eng.scalar(2.0)?;
    let b = eng.scalar(5.0)?;

    let (value, grads) = eng.value_and_gradients(|| eng.mul(&a, &b), &[&b, &a])?;
    assert_eq!(eng.read_scalar(&value)?, 10.0);
    assert_eq!(eng.read_scalar(&grads[0])?, 2.0);
    assert_eq!(eng.read_scalar(&grads[1])?, 5.0);
    Ok(())
}

// ============================================================================
// Finite-difference checks per op
// ============================================================================

#[test]
fn test_unary_gradients_match_finite_differences() -> Result<()> {
    let eng = engine();
    let x = eng.tensor(vec![0.3f32, 1.2, 0.7, 2.1, 0.45, 1.6], [2, 3])?;
    let signed = eng.tensor(vec![-0.8f32, 0.6, -0.3, 1.4, -1.9, 0.25], [2, 3])?;

    type UnaryFn<'a> = Box<dyn Fn(&Tensor) -> Result<Tensor> + 'a>;
    let positive_only: Vec<(&str, UnaryFn)> = vec![
        ("log", Box::new(|t: &Tensor| eng.log(t))),
        ("sqrt", Box::new(|t: &Tensor| eng.sqrt(t))),
    ];
    let any_sign: Vec<(&str, UnaryFn)> = vec![
        ("neg", Box::new(|t: &Tensor| eng.neg(t))),
        ("abs", Box::new(|t: &Tensor| eng.abs(t))),
        ("exp", Box::new(|t: &Tensor| eng.exp(t))),
        ("square", Box::new(|t: &Tensor| eng.square(t))),
        ("sin", Box::new(|t: &Tensor| eng.sin(t))),
        ("cos", Box::new(|t: &Tensor| eng.cos(t))),
        ("tanh", Box::new(|t: &Tensor| eng.tanh(t))),
        ("sigmoid", Box::new(|t: &Tensor| eng.sigmoid(t))),
        ("relu", Box::new(|t: &Tensor| eng.relu(t))),
        ("elu", Box::new(|t: &Tensor| eng.elu(t))),
        ("leaky_relu", Box::new(|t: &Tensor| eng.leaky_relu(t, 0.2))),
    ];

    for (name, op) in &positive_only {
        check_gradient(&eng, name, &x, |t| eng.sum(&op(t)?, None, false))?;
    }
    for (name, op) in &any_sign {
        check_gradient(&eng, name, &signed, |t| eng.sum(&op(t)?, None, false))?;
    }

    // central differences of |x| are exactly 0 at the kink
    let kink = eng.tensor(vec![0.0f32, 2.0, -3.0], [3])?;
    check_gradient(&eng, "abs at zero", &kink, |t| eng.sum(&eng.abs(t)?, None, false))?;
    let grads = eng.gradients(|| eng.sum(&eng.abs(&kink)?, None, false), &[&kink])?;
    assert_eq!(eng.read_f32(grads.wrt(&kink).unwrap())?, vec![0.0, 1.0, -1.0]);
    Ok(())
}

#[test]
fn test_binary_gradients_match_finite_differences() -> Result<()> {
    let eng = engine();
    let a = eng.tensor(vec![0.5f32, 1.5, 0.8, 1.9, 1.1, 0.6], [2, 3])?;
    let b = eng.tensor(vec![1.3f32, 0.7, 1.25], [3])?;

    type BinaryFn<'a> = Box<dyn Fn(&Tensor, &Tensor) -> Result<Tensor> + 'a>;
    let ops: Vec<(&str, BinaryFn)> = vec![
        ("add", Box::new(|x: &Tensor, y: &Tensor| eng.add(x, y))),
        ("sub", Box::new(|x: &Tensor, y: &Tensor| eng.sub(x, y))),
        ("mul", Box::new(|x: &Tensor, y: &Tensor| eng.mul(x, y))),
        ("div", Box::new(|x: &Tensor, y: &Tensor| eng.div(x, y))),
        ("pow", Box::new(|x: &Tensor, y: &Tensor| eng.pow(x, y))),
        ("maximum", Box::new(|x: &Tensor, y: &Tensor| eng.maximum(x, y))),
        ("minimum", Box::new(|x: &Tensor, y: &Tensor| eng.minimum(x, y))),
    ];

    for (name, op) in &ops {
        // the broadcast operand gets its gradient summed back to [3]
        check_gradient(&eng, &format!("{name} wrt lhs"), &a, |t| eng.sum(&op(t, &b)?, None, false))?;
        check_gradient(&eng, &format!("{name} wrt rhs"), &b, |t| eng.sum(&op(&a, t)?, None, false))?;
    }
    Ok(())
}

#[test]
fn test_reduction_gradients_match_finite_differences() -> Result<()> {
    let eng = engine();
    let x = eng.tensor(vec![0.2f32, -1.4, 0.9, 2.3, -0.6, 1.7], [2, 3])?;
    let weights = eng.tensor(vec![1.0f32, -2.0, 0.5], [3])?;

    // weighting keeps the upstream gradient non-uniform
    check_gradient(&eng, "mean axis 0", &x, |t| {
        let m = eng.mean(t, Some(&[0]), false)?;
        eng.sum(&eng.mul(&m, &weights)?, None, false)
    })?;
    check_gradient(&eng, "max axis 1 keepdims", &x, |t| {
        let m = eng.max(t, Some(&[1]), true)?;
        eng.sum(&eng.square(&m)?, None, false)
    })?;
    check_gradient(&eng, "min", &x, |t| eng.min(t, None, false))?;
    check_gradient(&eng, "sum axis 1", &x, |t| {
        let s = eng.sum(t, Some(&[1]), false)?;
        eng.sum(&eng.square(&s)?, None, false)
    })?;
    Ok(())
}

#[test]
fn test_layout_and_matmul_gradients_match_finite_differences() -> Result<()> {
    let eng = engine();
    let a = eng.tensor(
        vec![0.1f32, -0.3, 0.5, 0.7, -0.2, 0.4, 0.9, -0.8, 0.6, 0.2, -0.5, 0.3],
        [2, 2, 3],
    )?;
    let b = eng.tensor(vec![0.3f32, -0.1, 0.8, 0.5, -0.7, 0.2], [3, 2])?;

    check_gradient(&eng, "batched matmul lhs", &a, |t| {
        eng.sum(&eng.square(&eng.matmul(t, &b)?)?, None, false)
    })?;
    check_gradient(&eng, "batched matmul rhs", &b, |t| {
        eng.sum(&eng.square(&eng.matmul(&a, t)?)?, None, false)
    })?;
    check_gradient(&eng, "transpose", &a, |t| {
        let p = eng.transpose(t, Some(&[2, 0, 1]))?;
        let w = eng.tensor(vec![1.0f32, 2.0, 3.0, 4.0], [2, 2])?;
        eng.sum(&eng.mul(&p, &w)?, None, false)
    })?;
    check_gradient(&eng, "reshape", &b, |t| {
        let r = eng.reshape(t, [2, 3])?;
        eng.sum(&eng.exp(&r)?, None, false)
    })?;
    check_gradient(&eng, "broadcast_to", &b, |t| {
        let r = eng.broadcast_to(t, [4, 3, 2])?;
        eng.sum(&eng.sin(&r)?, None, false)
    })?;
    Ok(())
}

#[test]
fn test_select_gradient_masks_branches() -> Result<()> {
    let eng = engine();
    let a = eng.tensor(vec![1.0f32, 2.0, 3.0], [3])?;
    let b = eng.tensor(vec![4.0f32, 5.0, 6.0], [3])?;
    let cond = eng.tensor(vec![true, false, true], [3])?;

    let grads = eng.gradients(
        || eng.sum(&eng.square(&eng.select(&cond, &a, &b)?)?, None, false),
        &[&a, &b],
    )?;
    assert_eq!(eng.read_f32(grads.wrt(&a).unwrap())?, vec![2.0, 0.0, 6.0]);
    assert_eq!(eng.read_f32(grads.wrt(&b).unwrap())?, vec![0.0, 10.0, 0.0]);
    Ok(())
}
