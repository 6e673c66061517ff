//! Tensor handles and variables.

use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::dtype::DType;
use crate::shape::Shape;

/// Global counter for tensor ids; ids are never reused within a process.
static TENSOR_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Unique identifier of a tensor buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TensorId(u64);

impl TensorId {
    pub(crate) fn next() -> Self {
        TensorId(TENSOR_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Logical view over a buffer owned by the engine.
///
/// Handles are cheap to clone and every clone refers to the same buffer. The
/// buffer lives until its scope ends or [`Engine::dispose`](crate::Engine::dispose)
/// is called, independently of how many handles are still around.
#[derive(Clone, PartialEq)]
pub struct Tensor {
    id: TensorId,
    shape: Shape,
    dtype: DType,
}

impl Tensor {
    pub(crate) fn new(shape: Shape, dtype: DType) -> Self {
        Tensor {
            id: TensorId::next(),
            shape,
            dtype,
        }
    }

    pub fn id(&self) -> TensorId {
        self.id
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn ndim(&self) -> usize {
        self.shape.ndim()
    }

    pub fn numel(&self) -> usize {
        self.shape.numel()
    }

    pub fn is_scalar(&self) -> bool {
        self.shape.is_scalar()
    }

    /// Bytes the backing buffer holds: element count times dtype width.
    pub fn size_in_bytes(&self) -> usize {
        self.numel() * self.dtype.size_of()
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("id", &self.id)
            .field("shape", &self.shape)
            .field("dtype", &self.dtype)
            .finish()
    }
}

/// A tensor whose buffer can be replaced in place through
/// [`Engine::assign`](crate::Engine::assign). Its id never changes.
#[derive(Clone)]
pub struct Variable {
    tensor: Tensor,
    name: Arc<str>,
    trainable: bool,
}

impl Variable {
    pub(crate) fn new(tensor: Tensor, name: String, trainable: bool) -> Self {
        Variable {
            tensor,
            name: name.into(),
            trainable,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn trainable(&self) -> bool {
        self.trainable
    }

    pub fn tensor(&self) -> &Tensor {
        &self.tensor
    }
}

impl Deref for Variable {
    type Target = Tensor;

    fn deref(&self) -> &Tensor {
        &self.tensor
    }
}

impl PartialEq for Variable {
    fn eq(&self, other: &Self) -> bool {
        self.tensor.id == other.tensor.id
    }
}

impl fmt::Debug for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Variable")
            .field("name", &self.name)
            .field("id", &self.tensor.id)
            .field("shape", &self.tensor.shape)
            .field("trainable", &self.trainable)
            .finish()
    }
}

/// Anything that holds tensor handles. Used to find out which tensors a scope
/// body returns so they survive the scope.
pub trait TensorContainer {
    fn collect_ids(&self, out: &mut Vec<TensorId>);

    fn tensor_ids(&self) -> Vec<TensorId> {
        let mut ids = Vec::new();
        self.collect_ids(&mut ids);
        ids
    }
}

impl TensorContainer for Tensor {
    fn collect_ids(&self, out: &mut Vec<TensorId>) {
        out.push(self.id);
    }
}

impl TensorContainer for Variable {
    fn collect_ids(&self, out: &mut Vec<TensorId>) {
        out.push(self.tensor.id);
    }
}

impl TensorContainer for TensorId {
    fn collect_ids(&self, out: &mut Vec<TensorId>) {
        out.push(*self);
    }
}

impl<T: TensorContainer + ?Sized> TensorContainer for &T {
    fn collect_ids(&self, out: &mut Vec<TensorId>) {
        (**self).collect_ids(out);
    }
}

impl<T: TensorContainer> TensorContainer for [T] {
    fn collect_ids(&self, out: &mut Vec<TensorId>) {
        for item in self {
            item.collect_ids(out);
        }
    }
}

impl<T: TensorContainer> TensorContainer for Vec<T> {
    fn collect_ids(&self, out: &mut Vec<TensorId>) {
        self.as_slice().collect_ids(out);
    }
}

impl<T: TensorContainer> TensorContainer for Option<T> {
    fn collect_ids(&self, out: &mut Vec<TensorId>) {
        if let Some(item) = self {
            item.collect_ids(out);
        }
    }
}

impl<A: TensorContainer, B: TensorContainer> TensorContainer for (A, B) {
    fn collect_ids(&self, out: &mut Vec<TensorId>) {
        self.0.collect_ids(out);
        self.1.collect_ids(out);
    }
}

impl<A: TensorContainer, B: TensorContainer, C: TensorContainer> TensorContainer for (A, B, C) {
    fn collect_ids(&self, out: &mut Vec<TensorId>) {
        self.0.collect_ids(out);
        self.1.collect_ids(out);
        self.2.collect_ids(out);
    }
}

macro_rules! impl_no_tensors {
    ($($ty:ty),*) => {
        $(
            impl TensorContainer for $ty {
                fn collect_ids(&self, _out: &mut Vec<TensorId>) {}
            }
        )*
    };
}

impl_no_tensors!((), bool, f32, usize);
