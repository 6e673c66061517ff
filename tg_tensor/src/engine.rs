//! The engine context: one backend plus the live-buffer registry, the scope
//! stack and the gradient tape.
//!
//! Nothing here is global. Every component that creates tensors gets an
//! `&Engine` and tests build a fresh engine each, so state never leaks
//! between them.

use std::cell::RefCell;

use rustc_hash::FxHashSet;

use crate::backend::Backend;
use crate::config::EngineConfig;
use crate::dtype::{DType, HostData};
use crate::error::{Error, Result};
use crate::kernel;
use crate::memory::{MemoryInfo, MemoryManager};
use crate::op::Op;
use crate::shape::Shape;
use crate::tape::{FilteredTape, Tape};
use crate::tensor::{Tensor, TensorContainer, TensorId, Variable};

/// Tensor engine bound to one backend.
///
/// The engine is single-threaded: all bookkeeping sits behind a `RefCell`
/// and only the currently running computation touches it.
pub struct Engine<B: Backend> {
    backend: B,
    config: EngineConfig,
    state: RefCell<EngineState<B::Buffer>>,
}

struct EngineState<Buf> {
    memory: MemoryManager<Buf>,
    /// Shared by all nested gradient computations; dropped when the outermost ends.
    tape: Option<Tape>,
    gradient_depth: usize,
    no_grad_depth: usize,
    variables: Vec<Variable>,
    next_variable: usize,
}

impl<B: Backend> Engine<B> {
    pub fn new(backend: B) -> Self {
        Self::with_config(backend, EngineConfig::default())
    }

    pub fn with_config(backend: B, config: EngineConfig) -> Self {
        log::debug!("engine created on the {} backend", backend.name());
        Engine {
            backend,
            config,
            state: RefCell::new(EngineState {
                memory: MemoryManager::new(),
                tape: None,
                gradient_depth: 0,
                no_grad_depth: 0,
                variables: Vec::new(),
                next_variable: 0,
            }),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // === Dispatch ===

    /// Run one primitive operation and register its output in the current scope.
    ///
    /// Inputs are checked for liveness and validated before the backend sees
    /// them; a failing check leaves no trace. While a gradient computation is
    /// running the op is appended to the tape.
    pub fn execute(&self, op: Op, inputs: &[&Tensor]) -> Result<Tensor> {
        let name = op.name();
        let (buffer, shape, dtype) = {
            let state = self.state.borrow();
            let buffers = inputs
                .iter()
                .map(|t| state.memory.buffer(t.id()))
                .collect::<Result<Vec<_>>>()?;
            let (shape, dtype) = op.infer(inputs)?;
            let buffer = kernel::dispatch(&self.backend, &op, inputs, &buffers, &shape)?;
            (buffer, shape, dtype)
        };

        if self.config.debug && dtype == DType::F32 {
            if let Err(err) = self.check_finite(name, &buffer) {
                self.backend.release(buffer);
                return Err(err);
            }
        }

        let output = Tensor::new(shape, dtype);
        let mut state = self.state.borrow_mut();
        state.memory.register(&output, buffer);
        let recording = self.config.record_gradients && state.no_grad_depth == 0;
        if let (true, Some(tape)) = (recording, state.tape.as_mut()) {
            let inputs = inputs.iter().map(|t| (*t).clone()).collect();
            tape.record(op, inputs, output.clone());
        }
        log::trace!("{} -> {} {}", name, output.id(), output.shape());
        Ok(output)
    }

    fn check_finite(&self, op: &'static str, buffer: &B::Buffer) -> Result<()> {
        let data = self.backend.read(buffer)?;
        if data.as_f32().is_some_and(|values| values.iter().any(|v| v.is_nan())) {
            return Err(Error::NonFinite { op });
        }
        Ok(())
    }

    // === Creation ===

    fn register(&self, buffer: B::Buffer, shape: Shape, dtype: DType) -> Tensor {
        let tensor = Tensor::new(shape, dtype);
        self.state.borrow_mut().memory.register(&tensor, buffer);
        tensor
    }

    /// Upload host values as a new tensor. Not recorded: tensors made from
    /// data are constants as far as the tape is concerned.
    pub fn tensor(&self, data: impl Into<HostData>, shape: impl Into<Shape>) -> Result<Tensor> {
        let data = data.into();
        let shape = shape.into();
        if data.len() != shape.numel() {
            return Err(Error::DataLength {
                expected: shape.numel(),
                found: data.len(),
            });
        }
        let dtype = data.dtype();
        let buffer = self.backend.upload(data)?;
        Ok(self.register(buffer, shape, dtype))
    }

    /// Build a tensor from little-endian bytes, as stored in weight files.
    pub fn tensor_from_bytes(&self, bytes: &[u8], shape: impl Into<Shape>, dtype: DType) -> Result<Tensor> {
        self.tensor(HostData::from_le_bytes(bytes, dtype)?, shape)
    }

    pub fn fill(&self, shape: impl Into<Shape>, value: f32, dtype: DType) -> Result<Tensor> {
        let shape = shape.into();
        let buffer = self.backend.fill(dtype, shape.numel(), value)?;
        Ok(self.register(buffer, shape, dtype))
    }

    pub fn zeros(&self, shape: impl Into<Shape>) -> Result<Tensor> {
        self.fill(shape, 0.0, DType::F32)
    }

    pub fn ones(&self, shape: impl Into<Shape>) -> Result<Tensor> {
        self.fill(shape, 1.0, DType::F32)
    }

    pub fn scalar(&self, value: f32) -> Result<Tensor> {
        self.fill(Shape::scalar(), value, DType::F32)
    }

    pub fn zeros_like(&self, t: &Tensor) -> Result<Tensor> {
        self.fill(t.shape(), 0.0, t.dtype())
    }

    pub fn ones_like(&self, t: &Tensor) -> Result<Tensor> {
        self.fill(t.shape(), 1.0, t.dtype())
    }

    // === Reading back ===

    /// Copy a tensor's values to the host. This is the synchronization point
    /// with asynchronous backends.
    pub fn read(&self, t: &Tensor) -> Result<HostData> {
        let state = self.state.borrow();
        let buffer = state.memory.buffer(t.id())?;
        self.backend.read(buffer)
    }

    pub fn read_f32(&self, t: &Tensor) -> Result<Vec<f32>> {
        Ok(self.read(t)?.to_f32_vec())
    }

    /// Value of a one-element tensor.
    pub fn read_scalar(&self, t: &Tensor) -> Result<f32> {
        if t.numel() != 1 {
            return Err(Error::InvalidArgument {
                op: "read_scalar",
                message: format!("expected one element, tensor has shape {}", t.shape()),
            });
        }
        self.read_f32(t)?.into_iter().next().ok_or(Error::DataLength {
            expected: 1,
            found: 0,
        })
    }

    // === Scopes and disposal ===

    pub fn start_scope(&self, name: &str) {
        log::debug!("start scope '{name}'");
        self.state.borrow_mut().memory.start_scope(name);
    }

    /// Close the innermost scope, keeping the tensors in `keep`.
    pub fn end_scope<K: TensorContainer + ?Sized>(&self, keep: &K) -> Result<()> {
        let ids = keep.tensor_ids();
        let released = {
            let mut state = self.state.borrow_mut();
            let defer = state.gradient_depth > 0;
            state.memory.end_scope(&ids, defer)?
        };
        for buffer in released {
            self.backend.release(buffer);
        }
        Ok(())
    }

    /// Run `f` in a fresh scope. Tensors in the returned value survive;
    /// everything else created inside is released, also when `f` fails.
    pub fn scope<R, F>(&self, name: &str, f: F) -> Result<R>
    where
        R: TensorContainer,
        F: FnOnce() -> Result<R>,
    {
        self.start_scope(name);
        let mut guard = ScopeGuard {
            engine: self,
            armed: true,
        };
        let result = f();
        guard.armed = false;

        match result {
            Ok(value) => {
                self.end_scope(&value)?;
                Ok(value)
            }
            Err(err) => {
                if let Err(end_err) = self.end_scope(&()) {
                    log::warn!("closing scope '{name}' after an error failed: {end_err}");
                }
                Err(err)
            }
        }
    }

    /// Exempt a tensor from scope release. It lives until disposed.
    pub fn keep(&self, t: &Tensor) -> Result<()> {
        self.state.borrow_mut().memory.keep(t.id())
    }

    /// Release a tensor now, whatever scope it belongs to.
    pub fn dispose(&self, t: &Tensor) -> Result<()> {
        self.dispose_id(t.id())
    }

    /// Dispose every tensor in a container. A tensor listed twice is disposed once.
    pub fn dispose_all<C: TensorContainer + ?Sized>(&self, tensors: &C) -> Result<()> {
        let mut seen = FxHashSet::default();
        for id in tensors.tensor_ids() {
            if seen.insert(id) {
                self.dispose_id(id)?;
            }
        }
        Ok(())
    }

    fn dispose_id(&self, id: TensorId) -> Result<()> {
        let slot = {
            let mut state = self.state.borrow_mut();
            let slot = state.memory.remove(id)?;
            if slot.variable {
                state.variables.retain(|v| v.id() != id);
            }
            slot
        };
        self.backend.release(slot.buffer);
        Ok(())
    }

    pub fn memory(&self) -> MemoryInfo {
        self.state.borrow().memory.info()
    }

    pub fn num_live_tensors(&self) -> usize {
        self.memory().num_tensors
    }

    pub fn num_live_bytes(&self) -> usize {
        self.memory().num_bytes
    }

    /// Whether `t` still has a buffer.
    pub fn is_live(&self, t: &Tensor) -> bool {
        self.state.borrow().memory.contains(t.id())
    }

    // === Variables ===

    /// Create a variable holding a copy of `initial`. Unnamed variables are
    /// called `var_<n>`, skipping names already taken.
    pub fn variable(&self, initial: &Tensor, trainable: bool, name: Option<&str>) -> Result<Variable> {
        let name = {
            let mut state = self.state.borrow_mut();
            let taken = |state: &EngineState<B::Buffer>, name: &str| state.variables.iter().any(|v| v.name() == name);
            match name {
                Some(name) if taken(&state, name) => return Err(Error::DuplicateVariable(name.to_string())),
                Some(name) => name.to_string(),
                None => loop {
                    let candidate = format!("var_{}", state.next_variable);
                    state.next_variable += 1;
                    if !taken(&state, &candidate) {
                        break candidate;
                    }
                },
            }
        };

        let buffer = {
            let state = self.state.borrow();
            self.backend.copy(state.memory.buffer(initial.id())?)?
        };
        let tensor = Tensor::new(initial.shape().clone(), initial.dtype());
        let variable = Variable::new(tensor, name, trainable);

        let mut state = self.state.borrow_mut();
        state.memory.register_variable(&variable, buffer);
        state.variables.push(variable.clone());
        log::debug!("variable '{}' {} {}", variable.name(), variable.id(), variable.shape());
        Ok(variable)
    }

    /// Replace a variable's value. The only way a buffer changes in place.
    pub fn assign(&self, variable: &Variable, value: &Tensor) -> Result<()> {
        if variable.shape() != value.shape() {
            return Err(Error::ShapeMismatch {
                op: "assign",
                lhs: variable.shape().clone(),
                rhs: value.shape().clone(),
            });
        }
        if variable.dtype() != value.dtype() {
            return Err(Error::DTypeMismatch {
                op: "assign",
                expected: variable.dtype(),
                found: value.dtype(),
            });
        }

        let old = {
            let mut state = self.state.borrow_mut();
            if !state.memory.slot(variable.id())?.variable {
                return Err(Error::InvalidArgument {
                    op: "assign",
                    message: format!("tensor {} is not a variable", variable.id()),
                });
            }
            let buffer = self.backend.copy(state.memory.buffer(value.id())?)?;
            state.memory.replace(variable.id(), buffer)?
        };
        self.backend.release(old);
        Ok(())
    }

    /// Every live variable in creation order.
    pub fn variables(&self) -> Vec<Variable> {
        self.state.borrow().variables.clone()
    }

    pub fn trainable_variables(&self) -> Vec<Variable> {
        self.state
            .borrow()
            .variables
            .iter()
            .filter(|v| v.trainable())
            .cloned()
            .collect()
    }

    // === Gradient recording ===

    /// Run `f` without recording ops on the tape.
    pub fn no_grad<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce() -> Result<R>,
    {
        self.state.borrow_mut().no_grad_depth += 1;
        let _guard = NoGradGuard { engine: self };
        f()
    }

    /// Whether ops executed now would be recorded.
    pub fn is_recording(&self) -> bool {
        let state = self.state.borrow();
        self.config.record_gradients && state.no_grad_depth == 0 && state.tape.is_some()
    }

    /// Records on the active tape, zero when no gradient computation runs.
    pub fn tape_len(&self) -> usize {
        self.state.borrow().tape.as_ref().map_or(0, Tape::len)
    }

    pub(crate) fn enter_tape(&self) -> TapeGuard<'_, B> {
        let mut state = self.state.borrow_mut();
        if state.gradient_depth == 0 {
            state.tape = Some(Tape::new());
        }
        state.gradient_depth += 1;
        TapeGuard { engine: self }
    }

    pub(crate) fn filter_tape(&self, sources: &[TensorId], output: TensorId) -> FilteredTape {
        self.state
            .borrow()
            .tape
            .as_ref()
            .map(|tape| tape.filter(sources, output))
            .unwrap_or_default()
    }
}

impl<B: Backend> Drop for Engine<B> {
    fn drop(&mut self) {
        let buffers = self.state.get_mut().memory.drain();
        for buffer in buffers {
            self.backend.release(buffer);
        }
    }
}

/// Closes a scope whose body unwound without returning.
struct ScopeGuard<'a, B: Backend> {
    engine: &'a Engine<B>,
    armed: bool,
}

impl<B: Backend> Drop for ScopeGuard<'_, B> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let released = match self.engine.state.try_borrow_mut() {
            Ok(mut state) => state.memory.end_scope(&[], false).unwrap_or_default(),
            Err(_) => return,
        };
        for buffer in released {
            self.engine.backend.release(buffer);
        }
    }
}

struct NoGradGuard<'a, B: Backend> {
    engine: &'a Engine<B>,
}

impl<B: Backend> Drop for NoGradGuard<'_, B> {
    fn drop(&mut self) {
        if let Ok(mut state) = self.engine.state.try_borrow_mut() {
            state.no_grad_depth = state.no_grad_depth.saturating_sub(1);
        }
    }
}

/// Leaves a gradient computation; the tape goes away with the outermost one.
pub(crate) struct TapeGuard<'a, B: Backend> {
    engine: &'a Engine<B>,
}

impl<B: Backend> Drop for TapeGuard<'_, B> {
    fn drop(&mut self) {
        if let Ok(mut state) = self.engine.state.try_borrow_mut() {
            state.gradient_depth = state.gradient_depth.saturating_sub(1);
            if state.gradient_depth == 0 {
                state.tape = None;
            }
        }
    }
}
