//! Append-only log of executed operations.

use rustc_hash::FxHashSet;

use crate::op::Op;
use crate::tensor::{Tensor, TensorId};

/// One executed operation.
#[derive(Debug, Clone)]
pub struct OpRecord {
    pub op: Op,
    pub inputs: Vec<Tensor>,
    pub output: Tensor,
}

/// Operation log consulted by the backward pass.
///
/// Records appear in execution order, so an op's inputs are always produced
/// by earlier records (or are leaves). Walking the log backwards is therefore
/// a valid reverse topological order.
#[derive(Debug, Default)]
pub struct Tape {
    records: Vec<OpRecord>,
}

/// A record on some path from the sources to the output, with a flag per
/// input telling whether a gradient is needed for it.
#[derive(Debug, Clone)]
pub struct PathRecord {
    pub record: OpRecord,
    pub needs_grad: Vec<bool>,
}

/// The part of a tape that connects a set of sources to an output.
#[derive(Debug, Default)]
pub struct FilteredTape {
    /// In recording order.
    pub records: Vec<PathRecord>,
    /// Sources that feed the output through at least one record.
    pub connected: FxHashSet<TensorId>,
}

impl Tape {
    pub fn new() -> Self {
        Tape::default()
    }

    pub fn record(&mut self, op: Op, inputs: Vec<Tensor>, output: Tensor) {
        self.records.push(OpRecord { op, inputs, output });
    }

    pub fn records(&self) -> &[OpRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Keep only the records lying on a path from any of `sources` to `output`.
    pub fn filter(&self, sources: &[TensorId], output: TensorId) -> FilteredTape {
        // Forward: everything computed from a source.
        let mut from_sources: FxHashSet<TensorId> = sources.iter().copied().collect();
        let mut forward = vec![false; self.records.len()];
        for (i, record) in self.records.iter().enumerate() {
            if record.inputs.iter().any(|t| from_sources.contains(&t.id())) {
                from_sources.insert(record.output.id());
                forward[i] = true;
            }
        }

        // Backward: everything the output depends on.
        let mut to_output: FxHashSet<TensorId> = FxHashSet::default();
        to_output.insert(output);
        let mut on_path = vec![false; self.records.len()];
        for (i, record) in self.records.iter().enumerate().rev() {
            if forward[i] && to_output.contains(&record.output.id()) {
                on_path[i] = true;
                to_output.extend(record.inputs.iter().map(|t| t.id()));
            }
        }

        let records = self
            .records
            .iter()
            .zip(on_path)
            .filter(|(_, keep)| *keep)
            .map(|(record, _)| PathRecord {
                needs_grad: record
                    .inputs
                    .iter()
                    .map(|t| from_sources.contains(&t.id()))
                    .collect(),
                record: record.clone(),
            })
            .collect();

        let connected = sources
            .iter()
            .copied()
            .filter(|id| *id == output || to_output.contains(id))
            .collect();

        FilteredTape { records, connected }
    }
}
