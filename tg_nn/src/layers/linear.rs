//! Linear (fully connected) layer.

use rand::Rng;
use tg_tensor::prelude::*;

/// A linear (fully connected) layer: `y = x @ W^T + b`
#[derive(Debug, Clone)]
pub struct Linear {
    /// Weight matrix `[out_features, in_features]`
    pub weight: Variable,
    /// Bias vector `[out_features]`
    pub bias: Option<Variable>,
}

impl Linear {
    /// A layer with Kaiming-uniform weights and zero bias.
    ///
    /// The variables are named `<name>/weight` and `<name>/bias`.
    pub fn new<B: Backend>(
        engine: &Engine<B>,
        name: &str,
        in_features: usize,
        out_features: usize,
        bias: bool,
    ) -> Result<Self> {
        Self::with_rng(engine, name, in_features, out_features, bias, &mut rand::rng())
    }

    /// Like [`Linear::new`], drawing the weights from `rng`.
    pub fn with_rng<B: Backend, R: Rng>(
        engine: &Engine<B>,
        name: &str,
        in_features: usize,
        out_features: usize,
        bias: bool,
        rng: &mut R,
    ) -> Result<Self> {
        if in_features == 0 || out_features == 0 {
            return Err(Error::InvalidArgument {
                op: "linear",
                message: format!("feature counts must be positive, got {in_features} -> {out_features}"),
            });
        }

        // uniform in [-b, b] with b = sqrt(6 / fan_in), i.e. std = sqrt(2 / fan_in)
        let bound = (6.0 / in_features as f32).sqrt();
        let weight_data: Vec<f32> = (0..out_features * in_features)
            .map(|_| rng.random_range(-bound..bound))
            .collect();

        engine.scope("linear_init", || {
            let init = engine.tensor(weight_data, [out_features, in_features])?;
            let weight = engine.variable(&init, true, Some(&format!("{name}/weight")))?;
            let bias = match bias {
                true => {
                    let zeros = engine.zeros([out_features])?;
                    Some(engine.variable(&zeros, true, Some(&format!("{name}/bias")))?)
                }
                false => None,
            };
            Ok(Linear { weight, bias })
        })
    }

    /// Wrap existing variables.
    pub fn from_variables(weight: Variable, bias: Option<Variable>) -> Self {
        Linear { weight, bias }
    }

    /// `x` is `[..., in_features]` or `[in_features]`; the output swaps the
    /// last dimension for `out_features`.
    pub fn forward<B: Backend>(&self, engine: &Engine<B>, x: &Tensor) -> Result<Tensor> {
        if x.ndim() == 0 || x.shape().dim(x.ndim() - 1) != self.in_features() {
            return Err(Error::ShapeMismatch {
                op: "linear",
                lhs: x.shape().clone(),
                rhs: self.weight.shape().clone(),
            });
        }

        engine.scope("linear", || {
            let weight_t = engine.swap_last_axes(&self.weight)?;
            let y = match x.ndim() {
                1 => {
                    let row = engine.reshape(x, [1, self.in_features()])?;
                    engine.reshape(&engine.matmul(&row, &weight_t)?, [self.out_features()])?
                }
                _ => engine.matmul(x, &weight_t)?,
            };
            match &self.bias {
                Some(bias) => engine.add(&y, bias),
                None => Ok(y),
            }
        })
    }

    pub fn in_features(&self) -> usize {
        self.weight.shape().dim(1)
    }

    pub fn out_features(&self) -> usize {
        self.weight.shape().dim(0)
    }

    /// Trainable parameters, weight first.
    pub fn parameters(&self) -> Vec<Variable> {
        let mut params = vec![self.weight.clone()];
        params.extend(self.bias.clone());
        params
    }

    /// Release the layer's variables.
    pub fn dispose<B: Backend>(&self, engine: &Engine<B>) -> Result<()> {
        engine.dispose_all(&self.parameters())
    }
}

impl TensorContainer for Linear {
    fn collect_ids(&self, out: &mut Vec<tg_tensor::TensorId>) {
        self.weight.collect_ids(out);
        self.bias.collect_ids(out);
    }
}
