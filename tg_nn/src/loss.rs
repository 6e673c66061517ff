//! Loss functions. Each returns a scalar tensor.

use tg_tensor::prelude::*;

use crate::activations::log_softmax;

/// Mean squared error: `mean((pred - target)^2)`
pub fn mse_loss<B: Backend>(engine: &Engine<B>, pred: &Tensor, target: &Tensor) -> Result<Tensor> {
    engine.scope("mse_loss", || {
        let diff = engine.sub(pred, target)?;
        engine.mean(&engine.square(&diff)?, None, false)
    })
}

/// Binary cross-entropy on logits.
///
/// Computed as `mean(max(x, 0) - x * t + log(1 + exp(-|x|)))`, which stays
/// finite for large logits.
pub fn binary_cross_entropy_with_logits<B: Backend>(
    engine: &Engine<B>,
    logits: &Tensor,
    targets: &Tensor,
) -> Result<Tensor> {
    engine.scope("binary_cross_entropy", || {
        let relu_logits = engine.relu(logits)?;
        let logits_targets = engine.mul(logits, targets)?;
        let neg_abs = engine.neg(&engine.abs(logits)?)?;
        let log_term = engine.log(&engine.add_scalar(&engine.exp(&neg_abs)?, 1.0)?)?;

        let loss = engine.add(&engine.sub(&relu_logits, &logits_targets)?, &log_term)?;
        engine.mean(&loss, None, false)
    })
}

/// Cross-entropy against target probabilities (one-hot or soft labels).
///
/// `logits` and `targets` are `[batch, classes]`; returns
/// `-mean(sum(targets * log_softmax(logits), classes))`.
pub fn soft_cross_entropy_loss<B: Backend>(
    engine: &Engine<B>,
    logits: &Tensor,
    targets: &Tensor,
) -> Result<Tensor> {
    if logits.shape() != targets.shape() {
        return Err(Error::ShapeMismatch {
            op: "soft_cross_entropy_loss",
            lhs: logits.shape().clone(),
            rhs: targets.shape().clone(),
        });
    }
    let class_axis = logits.ndim().saturating_sub(1);
    engine.scope("soft_cross_entropy", || {
        let log_probs = log_softmax(engine, logits)?;
        let per_example = engine.sum(&engine.mul(targets, &log_probs)?, Some(&[class_axis]), false)?;
        engine.neg(&engine.mean(&per_example, None, false)?)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tg_backend_cpu::CpuBackend;

    #[test]
    fn test_mse_loss() -> Result<()> {
        let eng = Engine::new(CpuBackend);
        let pred = eng.tensor(vec![0.0f32, 0.0], [2])?;
        let target = eng.tensor(vec![1.0f32, 3.0], [2])?;

        let loss = mse_loss(&eng, &pred, &target)?;
        assert!((eng.read_scalar(&loss)? - 5.0).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn test_bce_with_logits() -> Result<()> {
        let eng = Engine::new(CpuBackend);
        let logits = eng.tensor(vec![0.0f32, 50.0], [2])?;
        let targets = eng.tensor(vec![0.5f32, 1.0], [2])?;

        // log(2) at logit 0; a confident correct logit costs almost nothing
        let loss = binary_cross_entropy_with_logits(&eng, &logits, &targets)?;
        let expected = std::f32::consts::LN_2 / 2.0;
        assert!((eng.read_scalar(&loss)? - expected).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn test_soft_cross_entropy() -> Result<()> {
        let eng = Engine::new(CpuBackend);
        let logits = eng.tensor(vec![2.0f32, 1.0, 0.0], [1, 3])?;
        let targets = eng.tensor(vec![1.0f32, 0.0, 0.0], [1, 3])?;

        let loss = soft_cross_entropy_loss(&eng, &logits, &targets)?;
        let normalizer = (2f32.exp() + 1f32.exp() + 1.0).ln();
        assert!((eng.read_scalar(&loss)? - (normalizer - 2.0)).abs() < 1e-5);

        let wrong = eng.tensor(vec![1.0f32, 0.0], [1, 2])?;
        assert!(matches!(
            soft_cross_entropy_loss(&eng, &logits, &wrong),
            Err(Error::ShapeMismatch { .. })
        ));
        Ok(())
    }
}
