//! Per-variable optimizer state.

use rustc_hash::FxHashMap;
use tg_tensor::prelude::*;
use tg_tensor::TensorId;

/// Accumulators owned by an optimizer, one set per updated variable.
///
/// Each slot is a non-trainable engine variable shaped like the variable it
/// belongs to. Slots are created the first time a variable gets a gradient,
/// so variables the loss never reaches cost nothing.
#[derive(Debug)]
pub(crate) struct Slots {
    names: &'static [&'static str],
    initial: f32,
    by_variable: FxHashMap<TensorId, Vec<Variable>>,
}

impl Slots {
    pub fn new(names: &'static [&'static str], initial: f32) -> Self {
        Slots {
            names,
            initial,
            by_variable: FxHashMap::default(),
        }
    }

    /// The slots of `var`, in the order of `names`.
    pub fn get<B: Backend>(&mut self, engine: &Engine<B>, var: &Variable) -> Result<Vec<Variable>> {
        if let Some(slots) = self.by_variable.get(&var.id()) {
            return Ok(slots.clone());
        }

        let mut slots = Vec::with_capacity(self.names.len());
        for name in self.names {
            let init = engine.fill(var.shape(), self.initial, DType::F32)?;
            let slot = engine.variable(&init, false, None)?;
            engine.dispose(&init)?;
            log::debug!("created {name} slot {} for '{}'", slot.name(), var.name());
            slots.push(slot);
        }
        self.by_variable.insert(var.id(), slots.clone());
        Ok(slots)
    }

    pub fn dispose<B: Backend>(&mut self, engine: &Engine<B>) -> Result<()> {
        for (_, slots) in self.by_variable.drain() {
            engine.dispose_all(&slots)?;
        }
        Ok(())
    }
}
