//! 1-D convolution in NWC layout: forward values, dilation, gradients and
//! argument checks.

use tg_backend_cpu::CpuBackend;
use tg_tensor::prelude::*;

fn engine() -> Engine<CpuBackend> {
    let _ = env_logger::builder().is_test(true).try_init();
    Engine::new(CpuBackend)
}

#[test]
fn test_same_padding_width_one_filter() -> Result<()> {
    let eng = engine();
    let x = eng.tensor(vec![1.0f32, 2.0, 3.0, 4.0], [2, 2, 1])?;
    let w = eng.tensor(vec![3.0f32], [1, 1, 1])?;

    let y = eng.conv1d(&x, &w, 1, Padding::Same, 1)?;
    assert_eq!(y.shape(), &Shape::from([2, 2, 1]));
    assert_eq!(eng.read_f32(&y)?, vec![3.0, 6.0, 9.0, 12.0]);
    Ok(())
}

#[test]
fn test_valid_padding_rank_two_input() -> Result<()> {
    let eng = engine();
    let x = eng.tensor(vec![1.0f32, 2.0, 3.0, 4.0], [4, 1])?;
    let w = eng.tensor(vec![2.0f32, 1.0], [2, 1, 1])?;

    let y = eng.conv1d(&x, &w, 1, Padding::Valid, 1)?;
    assert_eq!(y.shape(), &Shape::from([3, 1]));
    assert_eq!(eng.read_f32(&y)?, vec![4.0, 7.0, 10.0]);
    Ok(())
}

#[test]
fn test_dilation_matches_zero_filled_filter() -> Result<()> {
    let eng = engine();
    let x = eng.tensor((1..=14).map(|v| v as f32).collect::<Vec<_>>(), [14, 1])?;
    let w = eng.tensor(vec![3.0f32, 2.0, 1.0], [3, 1, 1])?;
    let w_dilated = eng.tensor(vec![3.0f32, 0.0, 0.0, 2.0, 0.0, 0.0, 1.0], [7, 1, 1])?;

    let dilated = eng.conv1d(&x, &w, 1, Padding::Valid, 3)?;
    let expanded = eng.conv1d(&x, &w_dilated, 1, Padding::Valid, 1)?;

    assert_eq!(dilated.shape(), expanded.shape());
    assert_eq!(eng.read_f32(&dilated)?, eng.read_f32(&expanded)?);
    Ok(())
}

#[test]
fn test_stride_and_explicit_padding() -> Result<()> {
    let eng = engine();
    let x = eng.tensor(vec![1.0f32, 2.0, 3.0, 4.0, 5.0], [5, 1])?;
    let w = eng.tensor(vec![1.0f32, 1.0, 1.0], [3, 1, 1])?;

    // padded input is [0, 1, 2, 3, 4, 5, 0]; windows start at 0, 2, 4
    let y = eng.conv1d(&x, &w, 2, Padding::Explicit(1), 1)?;
    assert_eq!(eng.read_f32(&y)?, vec![3.0, 9.0, 9.0]);
    Ok(())
}

#[test]
fn test_conv1d_gradients_match_finite_differences() -> Result<()> {
    let eng = engine();
    let x = eng.tensor(
        vec![0.5f32, -0.2, 0.1, 0.8, -0.7, 0.3, 0.4, -0.1, 0.9, 0.6, -0.5, 0.2],
        [1, 6, 2],
    )?;
    let w = eng.tensor(
        vec![0.3f32, -0.4, 0.1, 0.2, -0.6, 0.5, 0.7, -0.3, 0.2, 0.1, -0.2, 0.4],
        [3, 2, 2],
    )?;

    for (stride, pad, dilation) in [
        (1, Padding::Same, 1),
        (2, Padding::Valid, 1),
        (1, Padding::Valid, 2),
        (2, Padding::Explicit(2), 1),
    ] {
        let loss_x = |t: &Tensor| {
            let y = eng.conv1d(t, &w, stride, pad, dilation)?;
            eng.sum(&eng.square(&y)?, None, false)
        };
        let loss_w = |t: &Tensor| {
            let y = eng.conv1d(&x, t, stride, pad, dilation)?;
            eng.sum(&eng.square(&y)?, None, false)
        };

        let grads = eng.gradients(|| loss_x(&x), &[&x])?;
        let numeric = eng.finite_diff(loss_x, &x, 1e-3)?;
        close(&eng.read_f32(grads.wrt(&x).unwrap())?, &numeric);

        let grads = eng.gradients(|| loss_w(&w), &[&w])?;
        let numeric = eng.finite_diff(loss_w, &w, 1e-3)?;
        close(&eng.read_f32(grads.wrt(&w).unwrap())?, &numeric);
    }
    Ok(())
}

fn close(actual: &[f32], expected: &[f32]) {
    for (a, e) in actual.iter().zip(expected) {
        assert!((a - e).abs() <= 1e-2 * e.abs().max(1.0), "got {a}, expected {e}");
    }
}

#[test]
fn test_channel_mismatch_faults() -> Result<()> {
    let eng = engine();
    // rank 2 reads as [width 2, channels 2], filter expects one channel
    let x = eng.tensor(vec![1.0f32, 2.0, 3.0, 4.0], [2, 2])?;
    let w = eng.tensor(vec![3.0f32, 1.0], [2, 1, 1])?;
    assert!(matches!(
        eng.conv1d(&x, &w, 1, Padding::Explicit(0), 1),
        Err(Error::ShapeMismatch { op: "conv1d", .. })
    ));

    let x = eng.tensor(vec![1.0f32, 2.0, 3.0, 4.0], [2, 2, 1])?;
    let w = eng.ones([2, 5, 1])?;
    assert!(matches!(
        eng.conv1d(&x, &w, 1, Padding::Explicit(0), 1),
        Err(Error::ShapeMismatch { .. })
    ));
    Ok(())
}

#[test]
fn test_filter_rank_and_stride_dilation_faults() -> Result<()> {
    let eng = engine();
    let x = eng.tensor(vec![1.0f32, 2.0, 3.0, 4.0], [2, 2, 1])?;

    let w4 = eng.tensor(vec![3.0f32, 1.0, 5.0, 0.0], [2, 2, 1, 1])?;
    assert!(matches!(
        eng.conv1d(&x, &w4, 1, Padding::Explicit(0), 1),
        Err(Error::InvalidArgument { op: "conv1d", .. })
    ));

    let w = eng.tensor(vec![3.0f32], [1, 1, 1])?;
    assert!(matches!(
        eng.conv1d(&x, &w, 2, Padding::Same, 2),
        Err(Error::InvalidArgument { op: "conv1d", .. })
    ));
    Ok(())
}
