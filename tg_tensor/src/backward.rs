//! Reverse-mode differentiation over the recorded tape.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::backend::Backend;
use crate::dtype::DType;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::gradient_fns;
use crate::tape::PathRecord;
use crate::tensor::{Tensor, TensorContainer, TensorId, Variable};

/// Result of [`Engine::gradients`]: the differentiated value and one
/// gradient per requested source.
#[derive(Debug, Clone)]
pub struct Gradients {
    value: Tensor,
    grads: FxHashMap<TensorId, Tensor>,
}

impl Gradients {
    /// Gradient with respect to `source`.
    pub fn wrt(&self, source: &Tensor) -> Option<&Tensor> {
        self.grads.get(&source.id())
    }

    /// The output that was differentiated.
    pub fn value(&self) -> &Tensor {
        &self.value
    }

    pub fn len(&self) -> usize {
        self.grads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grads.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (TensorId, &Tensor)> {
        self.grads.iter().map(|(id, grad)| (*id, grad))
    }
}

impl TensorContainer for Gradients {
    fn collect_ids(&self, out: &mut Vec<TensorId>) {
        out.push(self.value.id());
        out.extend(self.grads.values().map(Tensor::id));
    }
}

type Adjoints = FxHashMap<TensorId, Tensor>;

impl<B: Backend> Engine<B> {
    /// Gradients of the scalar returned by `f` with respect to `sources`.
    ///
    /// Every source must feed the output through differentiable ops:
    /// [`Error::MissingGradient`] is returned for a source the output does not
    /// depend on, [`Error::NotDifferentiable`] for one that reaches it only
    /// through ops without a gradient. Intermediates created by `f` and by
    /// the backward pass are released; the value and the gradients survive.
    pub fn gradients<F>(&self, f: F, sources: &[&Tensor]) -> Result<Gradients>
    where
        F: FnOnce() -> Result<Tensor>,
    {
        self.strict_gradients(f, sources, None)
    }

    /// Like [`gradients`](Self::gradients) with an explicit upstream gradient
    /// `dy`, so the output need not be scalar.
    pub fn gradients_with_seed<F>(&self, f: F, sources: &[&Tensor], dy: &Tensor) -> Result<Gradients>
    where
        F: FnOnce() -> Result<Tensor>,
    {
        self.strict_gradients(f, sources, Some(dy))
    }

    /// Value and gradients of `f` as a pair.
    pub fn value_and_gradients<F>(&self, f: F, sources: &[&Tensor]) -> Result<(Tensor, Vec<Tensor>)>
    where
        F: FnOnce() -> Result<Tensor>,
    {
        let grads = self.gradients(f, sources)?;
        let ordered = sources
            .iter()
            .filter_map(|source| grads.wrt(source).cloned())
            .collect();
        Ok((grads.value, ordered))
    }

    /// Gradients of `f` with respect to variables.
    ///
    /// With `var_list` set to `None` every trainable variable is considered.
    /// Variables the loss does not depend on are left out instead of
    /// failing. The result keeps the order of the variable list.
    pub fn variable_gradients<F>(
        &self,
        f: F,
        var_list: Option<&[Variable]>,
    ) -> Result<(Tensor, Vec<(Variable, Tensor)>)>
    where
        F: FnOnce() -> Result<Tensor>,
    {
        let variables = match var_list {
            Some(vars) => vars.to_vec(),
            None => self.trainable_variables(),
        };
        let ids: Vec<TensorId> = variables.iter().map(|v| v.id()).collect();

        self.run_backward(f, &ids, None, |value, adjoints, _| {
            let grads = variables
                .iter()
                .filter_map(|v| adjoints.get(&v.id()).map(|g| (v.clone(), g.clone())))
                .collect::<Vec<_>>();
            Ok((value, grads))
        })
    }

    fn strict_gradients<F>(&self, f: F, sources: &[&Tensor], dy: Option<&Tensor>) -> Result<Gradients>
    where
        F: FnOnce() -> Result<Tensor>,
    {
        let ids: Vec<TensorId> = sources.iter().map(|t| t.id()).collect();
        self.run_backward(f, &ids, dy, |value, adjoints, connected| {
            let mut grads = FxHashMap::default();
            for &id in &ids {
                match adjoints.get(&id) {
                    Some(grad) => {
                        grads.insert(id, grad.clone());
                    }
                    None if connected.contains(&id) => return Err(Error::NotDifferentiable(id)),
                    None => return Err(Error::MissingGradient(id)),
                }
            }
            Ok(Gradients { value, grads })
        })
    }

    /// Record `f`, backpropagate from its output and let `pick` choose what
    /// leaves the gradient scope.
    fn run_backward<F, P, R>(&self, f: F, sources: &[TensorId], dy: Option<&Tensor>, pick: P) -> Result<R>
    where
        F: FnOnce() -> Result<Tensor>,
        P: FnOnce(Tensor, &Adjoints, &FxHashSet<TensorId>) -> Result<R>,
        R: TensorContainer,
    {
        self.scope("gradients", || {
            let tape = self.enter_tape();
            let outcome = (|| {
                let y = f()?;
                if y.dtype() != DType::F32 {
                    return Err(Error::DTypeMismatch {
                        op: "gradients",
                        expected: DType::F32,
                        found: y.dtype(),
                    });
                }
                let seed = match dy {
                    Some(dy) if dy.shape() != y.shape() => {
                        return Err(Error::ShapeMismatch {
                            op: "gradients",
                            lhs: y.shape().clone(),
                            rhs: dy.shape().clone(),
                        })
                    }
                    Some(dy) => dy.clone(),
                    None if !y.is_scalar() => return Err(Error::NonScalarLoss(y.shape().clone())),
                    None => self.ones_like(&y)?,
                };

                let path = self.filter_tape(sources, y.id());
                log::debug!(
                    "backward over {} of {} recorded ops",
                    path.records.len(),
                    self.tape_len()
                );
                let adjoints = backpropagate(self, &path.records, &y, seed)?;
                pick(y, &adjoints, &path.connected)
            })();
            // Leave the tape before the scope closes so this level's
            // intermediates are released instead of deferred.
            drop(tape);
            outcome
        })
    }
}

/// Walk `path` in reverse, accumulating adjoints from `y` back to the leaves.
///
/// Contributions are summed in reverse record order, and per record in input
/// order, so repeated runs give bit-identical gradients.
fn backpropagate<B: Backend>(
    engine: &Engine<B>,
    path: &[PathRecord],
    y: &Tensor,
    seed: Tensor,
) -> Result<Adjoints> {
    let mut adjoints = Adjoints::default();
    adjoints.insert(y.id(), seed);

    for entry in path.iter().rev() {
        let record = &entry.record;
        let Some(dy) = adjoints.get(&record.output.id()).cloned() else {
            continue;
        };

        let input_grads = gradient_fns::vjp(engine, record, &dy, &entry.needs_grad)?;
        for ((input, grad), &needed) in record.inputs.iter().zip(input_grads).zip(&entry.needs_grad) {
            let Some(grad) = grad.filter(|_| needed) else {
                continue;
            };
            if grad.shape() != input.shape() {
                return Err(Error::ShapeMismatch {
                    op: record.op.name(),
                    lhs: input.shape().clone(),
                    rhs: grad.shape().clone(),
                });
            }
            let total = match adjoints.remove(&input.id()) {
                Some(previous) => engine.add(&previous, &grad)?,
                None => grad,
            };
            adjoints.insert(input.id(), total);
        }
    }

    Ok(adjoints)
}
