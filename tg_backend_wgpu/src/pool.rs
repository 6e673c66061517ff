//! Free list of released device buffers, keyed by byte size.

use std::collections::VecDeque;

use rustc_hash::FxHashMap as HashMap;

/// Recycles buffers so steady-state training loops stop allocating.
///
/// Generic over the buffer type so the bookkeeping is testable without a device.
#[derive(Debug)]
pub(crate) struct BufferPool<T> {
    free: HashMap<u64, VecDeque<T>>,
    pooled_bytes: u64,
    /// Buffers beyond this many pooled bytes are dropped instead.
    max_bytes: u64,
}

impl<T> BufferPool<T> {
    pub fn new(max_bytes: u64) -> Self {
        BufferPool {
            free: HashMap::default(),
            pooled_bytes: 0,
            max_bytes,
        }
    }

    /// A pooled buffer of exactly `size` bytes, if one is free.
    pub fn take(&mut self, size: u64) -> Option<T> {
        let buffer = self.free.get_mut(&size)?.pop_front()?;
        self.pooled_bytes -= size;
        Some(buffer)
    }

    /// Return a buffer to the pool. Gives it back when the pool is full.
    pub fn give(&mut self, size: u64, buffer: T) -> Option<T> {
        if self.pooled_bytes + size > self.max_bytes {
            return Some(buffer);
        }
        self.pooled_bytes += size;
        self.free.entry(size).or_default().push_back(buffer);
        None
    }

    pub fn pooled_bytes(&self) -> u64 {
        self.pooled_bytes
    }

    /// Empty the pool, returning every buffer.
    pub fn drain(&mut self) -> Vec<T> {
        self.pooled_bytes = 0;
        self.free.drain().flat_map(|(_, list)| list).collect()
    }
}
