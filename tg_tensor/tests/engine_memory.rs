//! Integration tests for buffer lifetimes: scopes, disposal, variables and
//! dispatch-time validation.

use tg_backend_cpu::CpuBackend;
use tg_tensor::prelude::*;

fn engine() -> Engine<CpuBackend> {
    let _ = env_logger::builder().is_test(true).try_init();
    Engine::new(CpuBackend)
}

// ============================================================================
// Scopes
// ============================================================================

#[test]
fn test_scope_keeps_only_the_result() -> Result<()> {
    let eng = engine();
    let x = eng.tensor(vec![1.0f32, 2.0, 3.0], [3])?;
    let before = eng.num_live_tensors();

    let y = eng.scope("body", || {
        let a = eng.exp(&x)?;
        let b = eng.mul(&a, &x)?;
        let c = eng.add_scalar(&b, 1.0)?;
        eng.sum(&c, None, false)
    })?;

    assert_eq!(eng.num_live_tensors(), before + 1);
    assert!(eng.is_live(&y));
    assert!(eng.is_live(&x));
    Ok(())
}

#[test]
fn test_scope_keeps_every_returned_tensor() -> Result<()> {
    let eng = engine();
    let x = eng.tensor(vec![1.0f32, -2.0], [2])?;
    let before = eng.num_live_tensors();

    let (a, b) = eng.scope("pair", || {
        let tmp = eng.neg(&x)?;
        Ok((eng.relu(&tmp)?, eng.abs(&tmp)?))
    })?;

    assert_eq!(eng.num_live_tensors(), before + 2);
    assert_eq!(eng.read_f32(&a)?, vec![0.0, 2.0]);
    assert_eq!(eng.read_f32(&b)?, vec![1.0, 2.0]);
    Ok(())
}

#[test]
fn test_scope_releases_on_error() -> Result<()> {
    let eng = engine();
    let a = eng.ones([2, 2])?;
    let b = eng.ones([3, 2])?;
    let before = eng.num_live_tensors();
    let bytes_before = eng.num_live_bytes();

    let result = eng.scope("failing", || {
        let doubled = eng.mul_scalar(&a, 2.0)?;
        let _squared = eng.square(&doubled)?;
        eng.add(&doubled, &b)
    });

    assert!(matches!(result, Err(Error::ShapeMismatch { op: "add", .. })));
    assert_eq!(eng.num_live_tensors(), before);
    assert_eq!(eng.num_live_bytes(), bytes_before);
    assert_eq!(eng.memory().num_scopes, 0);
    Ok(())
}

#[test]
fn test_nested_scopes_hand_results_to_parent() -> Result<()> {
    let eng = engine();
    let x = eng.ones([4])?;
    let before = eng.num_live_tensors();

    let outer = eng.scope("outer", || {
        let inner = eng.scope("inner", || eng.mul_scalar(&x, 3.0))?;
        // inner result now belongs to the outer scope
        assert!(eng.is_live(&inner));
        let _dropped = eng.add_scalar(&inner, 1.0)?;
        eng.sum(&inner, None, false)
    })?;

    assert_eq!(eng.num_live_tensors(), before + 1);
    assert_eq!(eng.read_scalar(&outer)?, 12.0);
    Ok(())
}

#[test]
fn test_manual_scopes() -> Result<()> {
    let eng = engine();
    eng.start_scope("manual");
    let a = eng.ones([2])?;
    let b = eng.add(&a, &a)?;
    eng.end_scope(&b)?;

    assert!(!eng.is_live(&a));
    assert!(eng.is_live(&b));
    assert!(matches!(eng.end_scope(&()), Err(Error::ScopeUnderflow)));
    Ok(())
}

#[test]
fn test_keep_survives_scope() -> Result<()> {
    let eng = engine();
    let mut kept = None;
    eng.scope("keep", || {
        let t = eng.ones([3])?;
        let _tmp = eng.neg(&t)?;
        eng.keep(&t)?;
        kept = Some(t);
        Ok(())
    })?;

    let kept = kept.expect("scope body ran");
    assert!(eng.is_live(&kept));
    assert_eq!(eng.num_live_tensors(), 1);
    Ok(())
}

// ============================================================================
// Disposal
// ============================================================================

#[test]
fn test_double_dispose_faults() -> Result<()> {
    let eng = engine();
    let t = eng.zeros([2, 2])?;
    eng.dispose(&t)?;
    assert!(matches!(eng.dispose(&t), Err(Error::DoubleFree(id)) if id == t.id()));
    Ok(())
}

#[test]
fn test_use_after_dispose_faults() -> Result<()> {
    let eng = engine();
    let a = eng.ones([2])?;
    let b = eng.ones([2])?;
    eng.dispose(&a)?;

    assert!(matches!(eng.add(&a, &b), Err(Error::UseAfterDispose(id)) if id == a.id()));
    assert!(matches!(eng.read(&a), Err(Error::UseAfterDispose(_))));
    assert_eq!(eng.num_live_tensors(), 1);
    Ok(())
}

#[test]
fn test_dispose_all_skips_repeats() -> Result<()> {
    let eng = engine();
    let a = eng.ones([2])?;
    let b = eng.zeros([2])?;
    eng.dispose_all(&vec![a.clone(), b.clone(), a.clone()])?;
    assert_eq!(eng.num_live_tensors(), 0);
    assert_eq!(eng.num_live_bytes(), 0);
    Ok(())
}

#[test]
fn test_live_bytes_follow_dtype_width() -> Result<()> {
    let eng = engine();
    let floats = eng.zeros([2, 3])?;
    assert_eq!(eng.num_live_bytes(), 24);

    let mask = eng.greater(&floats, &eng.scalar(0.0)?)?;
    assert_eq!(mask.dtype(), DType::Bool);
    assert_eq!(eng.num_live_bytes(), 24 + 4 + 6);

    eng.dispose(&floats)?;
    assert_eq!(eng.num_live_bytes(), 10);
    Ok(())
}

// ============================================================================
// Variables
// ============================================================================

#[test]
fn test_variable_assign_keeps_identity() -> Result<()> {
    let eng = engine();
    let init = eng.tensor(vec![1.0f32, 2.0], [2])?;
    let v = eng.variable(&init, true, None)?;
    assert_eq!(v.name(), "var_0");

    let id = v.id();
    let next = eng.tensor(vec![5.0f32, 6.0], [2])?;
    eng.assign(&v, &next)?;

    assert_eq!(v.id(), id);
    assert_eq!(eng.read_f32(&v)?, vec![5.0, 6.0]);
    // the initial value was copied, not aliased
    assert_eq!(eng.read_f32(&init)?, vec![1.0, 2.0]);
    Ok(())
}

#[test]
fn test_assign_rejects_other_shapes_and_plain_tensors() -> Result<()> {
    let eng = engine();
    let v = eng.variable(&eng.zeros([2])?, true, Some("w"))?;
    let wrong = eng.zeros([3])?;
    assert!(matches!(eng.assign(&v, &wrong), Err(Error::ShapeMismatch { op: "assign", .. })));

    let ints = eng.tensor(vec![1i32, 2], [2])?;
    assert!(matches!(eng.assign(&v, &ints), Err(Error::DTypeMismatch { op: "assign", .. })));

    assert!(matches!(
        eng.variable(&eng.zeros([1])?, true, Some("w")),
        Err(Error::DuplicateVariable(name)) if name == "w"
    ));
    Ok(())
}

#[test]
fn test_variables_outlive_scopes() -> Result<()> {
    let eng = engine();
    let v = eng.scope("init", || {
        let init = eng.ones([3])?;
        eng.variable(&init, false, Some("frozen"))
    })?;

    assert!(eng.is_live(&v));
    assert_eq!(eng.num_live_tensors(), 1);
    assert_eq!(eng.memory().num_variables, 1);
    assert!(eng.trainable_variables().is_empty());
    assert_eq!(eng.variables(), vec![v.clone()]);

    eng.dispose(&v)?;
    assert!(eng.variables().is_empty());
    Ok(())
}

#[test]
fn test_generated_names_skip_user_names() -> Result<()> {
    let eng = engine();
    let init = eng.zeros([2])?;
    eng.variable(&init, true, Some("var_0"))?;
    eng.variable(&init, true, Some("var_2"))?;

    let first = eng.variable(&init, false, None)?;
    let second = eng.variable(&init, false, None)?;
    assert_eq!(first.name(), "var_1");
    assert_eq!(second.name(), "var_3");

    assert!(matches!(
        eng.variable(&init, true, Some("var_1")),
        Err(Error::DuplicateVariable(name)) if name == "var_1"
    ));
    assert_eq!(eng.memory().num_variables, 4);
    Ok(())
}

// ============================================================================
// Dispatch validation
// ============================================================================

#[test]
fn test_broadcast_add_rows() -> Result<()> {
    let eng = engine();
    let a = eng.tensor(vec![1.0f32, 2.0, 3.0, 4.0], [2, 2])?;
    let b = eng.tensor(vec![10.0f32, 20.0], [1, 2])?;
    let c = eng.add(&a, &b)?;

    assert_eq!(c.shape(), &Shape::from([2, 2]));
    assert_eq!(eng.read_f32(&c)?, vec![11.0, 22.0, 13.0, 24.0]);
    Ok(())
}

#[test]
fn test_broadcast_mismatch_faults_before_dispatch() -> Result<()> {
    let eng = engine();
    let a = eng.ones([2, 2])?;
    let b = eng.ones([3, 2])?;
    let before = eng.num_live_tensors();

    assert!(matches!(eng.add(&a, &b), Err(Error::ShapeMismatch { op: "add", .. })));
    assert_eq!(eng.num_live_tensors(), before);
    Ok(())
}

#[test]
fn test_float_ops_reject_ints() -> Result<()> {
    let eng = engine();
    let a = eng.ones([2])?;
    let b = eng.tensor(vec![1i32, 2], [2])?;
    assert!(matches!(eng.add(&a, &b), Err(Error::DTypeMismatch { .. })));
    assert!(matches!(eng.mul(&b, &a), Err(Error::DTypeMismatch { .. })));
    assert!(matches!(eng.exp(&b), Err(Error::DTypeMismatch { .. })));
    assert!(matches!(eng.div(&b, &b), Err(Error::DTypeMismatch { op: "div", .. })));
    Ok(())
}

#[test]
fn test_int_arithmetic_stays_int() -> Result<()> {
    let eng = engine();
    let a = eng.tensor(vec![1i32, 2, -3, 4], [2, 2])?;
    let b = eng.tensor(vec![3i32, -4], [2])?;

    let sum = eng.add(&a, &b)?;
    assert_eq!(sum.dtype(), DType::I32);
    assert_eq!(eng.read(&sum)?, HostData::I32(vec![4, -2, 0, 0]));
    assert_eq!(eng.read(&eng.sub(&a, &b)?)?, HostData::I32(vec![-2, 6, -6, 8]));
    assert_eq!(eng.read(&eng.mul(&a, &b)?)?, HostData::I32(vec![3, -8, -9, -16]));
    assert_eq!(eng.read(&eng.maximum(&a, &b)?)?, HostData::I32(vec![3, 2, 3, 4]));
    assert_eq!(eng.read(&eng.minimum(&a, &b)?)?, HostData::I32(vec![1, -4, -3, -4]));
    Ok(())
}

#[test]
fn test_tensor_length_checked() {
    let eng = engine();
    let result = eng.tensor(vec![1.0f32, 2.0, 3.0], [2, 2]);
    assert!(matches!(result, Err(Error::DataLength { expected: 4, found: 3 })));
    assert_eq!(eng.num_live_tensors(), 0);
}

#[test]
fn test_tensor_from_le_bytes() -> Result<()> {
    let eng = engine();
    let bytes: Vec<u8> = [1.5f32, -2.0].iter().flat_map(|v| v.to_le_bytes()).collect();
    let t = eng.tensor_from_bytes(&bytes, [2], DType::F32)?;
    assert_eq!(eng.read_f32(&t)?, vec![1.5, -2.0]);
    Ok(())
}

#[test]
fn test_debug_mode_rejects_nan() -> Result<()> {
    let eng = Engine::with_config(CpuBackend, EngineConfig::debug());
    let x = eng.tensor(vec![-1.0f32, 4.0], [2])?;
    let before = eng.num_live_tensors();

    assert!(matches!(eng.sqrt(&x), Err(Error::NonFinite { op: "sqrt" })));
    assert_eq!(eng.num_live_tensors(), before);
    Ok(())
}

#[test]
fn test_reductions_and_layout() -> Result<()> {
    let eng = engine();
    let x = eng.tensor(vec![1.0f32, 5.0, 3.0, 4.0, 2.0, 6.0], [2, 3])?;

    let rows = eng.sum(&x, Some(&[1]), false)?;
    assert_eq!(eng.read_f32(&rows)?, vec![9.0, 12.0]);

    let cols = eng.max(&x, Some(&[0]), true)?;
    assert_eq!(cols.shape(), &Shape::from([1, 3]));
    assert_eq!(eng.read_f32(&cols)?, vec![4.0, 5.0, 6.0]);

    let arg = eng.arg_max(&x, 1)?;
    assert_eq!(eng.read(&arg)?, HostData::I32(vec![1, 2]));

    let t = eng.transpose(&x, None)?;
    assert_eq!(t.shape(), &Shape::from([3, 2]));
    assert_eq!(eng.read_f32(&t)?, vec![1.0, 4.0, 5.0, 2.0, 3.0, 6.0]);

    assert!(matches!(eng.reshape(&x, [4]), Err(Error::ShapeMismatch { op: "reshape", .. })));
    Ok(())
}
