//! Registry of live buffers and the stack of creation scopes.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::shape::Shape;
use crate::tensor::{Tensor, TensorId};

/// Snapshot of what the engine currently holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemoryInfo {
    /// Live tensors, variables included.
    pub num_tensors: usize,
    /// Bytes held by live tensors (element count times dtype width).
    pub num_bytes: usize,
    pub num_variables: usize,
    /// Depth of the scope stack.
    pub num_scopes: usize,
}

/// One registered buffer.
pub(crate) struct Slot<Buf> {
    pub buffer: Buf,
    pub shape: Shape,
    pub dtype: DType,
    /// Exempt from scope release; lives until disposed.
    pub kept: bool,
    pub variable: bool,
}

impl<Buf> Slot<Buf> {
    fn size_in_bytes(&self) -> usize {
        self.shape.numel() * self.dtype.size_of()
    }
}

#[derive(Debug, Default)]
struct Scope {
    name: String,
    tracked: Vec<TensorId>,
}

/// Buffers indexed by tensor id, plus the LIFO scope stack deciding when they go away.
///
/// The manager never talks to a device: whatever it releases is handed back
/// to the caller, which gives the buffers to the backend.
pub(crate) struct MemoryManager<Buf> {
    slots: FxHashMap<TensorId, Slot<Buf>>,
    scopes: Vec<Scope>,
    num_bytes: usize,
    num_variables: usize,
}

impl<Buf> MemoryManager<Buf> {
    pub fn new() -> Self {
        MemoryManager {
            slots: FxHashMap::default(),
            scopes: Vec::new(),
            num_bytes: 0,
            num_variables: 0,
        }
    }

    /// Register a fresh tensor with the innermost scope. Without an active
    /// scope the tensor lives until it is disposed.
    pub fn register(&mut self, tensor: &Tensor, buffer: Buf) {
        self.insert(tensor, buffer, false);
        if let Some(scope) = self.scopes.last_mut() {
            scope.tracked.push(tensor.id());
        }
    }

    /// Register a variable. Variables never belong to a scope.
    pub fn register_variable(&mut self, tensor: &Tensor, buffer: Buf) {
        self.insert(tensor, buffer, true);
        self.num_variables += 1;
    }

    fn insert(&mut self, tensor: &Tensor, buffer: Buf, variable: bool) {
        let slot = Slot {
            buffer,
            shape: tensor.shape().clone(),
            dtype: tensor.dtype(),
            kept: variable,
            variable,
        };
        self.num_bytes += slot.size_in_bytes();
        self.slots.insert(tensor.id(), slot);
    }

    pub fn contains(&self, id: TensorId) -> bool {
        self.slots.contains_key(&id)
    }

    pub fn slot(&self, id: TensorId) -> Result<&Slot<Buf>> {
        self.slots.get(&id).ok_or(Error::UseAfterDispose(id))
    }

    pub fn buffer(&self, id: TensorId) -> Result<&Buf> {
        self.slot(id).map(|slot| &slot.buffer)
    }

    /// Exempt a tensor from every scope release.
    pub fn keep(&mut self, id: TensorId) -> Result<()> {
        let slot = self.slots.get_mut(&id).ok_or(Error::UseAfterDispose(id))?;
        slot.kept = true;
        Ok(())
    }

    /// Swap the buffer behind `id`, returning the old one.
    pub fn replace(&mut self, id: TensorId, buffer: Buf) -> Result<Buf> {
        let slot = self.slots.get_mut(&id).ok_or(Error::UseAfterDispose(id))?;
        Ok(std::mem::replace(&mut slot.buffer, buffer))
    }

    /// Unregister a tensor. Removing an id twice is a double free.
    pub fn remove(&mut self, id: TensorId) -> Result<Slot<Buf>> {
        let slot = self.slots.remove(&id).ok_or(Error::DoubleFree(id))?;
        self.num_bytes -= slot.size_in_bytes();
        if slot.variable {
            self.num_variables -= 1;
        }
        Ok(slot)
    }

    pub fn start_scope(&mut self, name: &str) {
        self.scopes.push(Scope {
            name: name.to_string(),
            tracked: Vec::new(),
        });
    }

    /// Pop the innermost scope.
    ///
    /// Tracked tensors listed in `keep` move to the parent scope (or become
    /// top-level). The rest are released and their buffers returned, unless
    /// `defer` is set: then they move to the parent scope as well, so a
    /// gradient tape can still read them.
    pub fn end_scope(&mut self, keep: &[TensorId], defer: bool) -> Result<Vec<Buf>> {
        let scope = self.scopes.pop().ok_or(Error::ScopeUnderflow)?;
        let keep: FxHashSet<TensorId> = keep.iter().copied().collect();

        let mut to_parent = Vec::new();
        let mut released = Vec::new();
        for id in scope.tracked {
            let Some(slot) = self.slots.get(&id) else {
                // disposed explicitly inside the scope
                continue;
            };
            if slot.kept {
                continue;
            }
            if keep.contains(&id) || (defer && !self.scopes.is_empty()) {
                to_parent.push(id);
            } else {
                released.push(self.remove(id)?.buffer);
            }
        }

        log::debug!(
            "end scope '{}': released {}, moved {} to parent",
            scope.name,
            released.len(),
            to_parent.len()
        );

        if let Some(parent) = self.scopes.last_mut() {
            parent.tracked.extend(to_parent);
        }
        Ok(released)
    }

    pub fn scope_depth(&self) -> usize {
        self.scopes.len()
    }

    pub fn info(&self) -> MemoryInfo {
        MemoryInfo {
            num_tensors: self.slots.len(),
            num_bytes: self.num_bytes,
            num_variables: self.num_variables,
            num_scopes: self.scopes.len(),
        }
    }

    /// Remove everything, returning all buffers.
    pub fn drain(&mut self) -> Vec<Buf> {
        self.scopes.clear();
        self.num_bytes = 0;
        self.num_variables = 0;
        self.slots.drain().map(|(_, slot)| slot.buffer).collect()
    }
}
