//! Slab buffer pools.
//!
//! Each session owns a pool of guaranteed output slabs and may borrow
//! from a shared overflow pool bound to the server. Pools are reference
//! counted; a pool outlives every slab it issued because each slab keeps
//! a handle back to it for recycling.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

struct PoolState {
    free: Vec<Vec<u8>>,
    in_use: usize,
    /// Hard cap on concurrently outstanding slabs.
    max: usize,
    peak: usize,
}

struct PoolShared {
    slab_size: usize,
    state: Mutex<PoolState>,
    overflow: Option<BufferPool>,
}

/// A reference-counted pool of fixed-size slabs.
#[derive(Clone)]
pub struct BufferPool {
    shared: Arc<PoolShared>,
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub in_use: usize,
    pub peak: usize,
    pub max: usize,
}

impl BufferPool {
    pub fn new(slab_size: usize, max: usize) -> BufferPool {
        BufferPool {
            shared: Arc::new(PoolShared {
                slab_size,
                state: Mutex::new(PoolState {
                    free: Vec::new(),
                    in_use: 0,
                    max,
                    peak: 0,
                }),
                overflow: None,
            }),
        }
    }

    /// A pool that promotes allocation misses to `overflow`.
    pub fn with_overflow(slab_size: usize, max: usize, overflow: BufferPool) -> BufferPool {
        BufferPool {
            shared: Arc::new(PoolShared {
                slab_size,
                state: Mutex::new(PoolState {
                    free: Vec::new(),
                    in_use: 0,
                    max,
                    peak: 0,
                }),
                overflow: Some(overflow),
            }),
        }
    }

    pub fn slab_size(&self) -> usize {
        self.shared.slab_size
    }

    /// Takes a slab able to hold `size` bytes, or `None` when the hard
    /// cap is reached. Never returns a short slab.
    pub fn alloc(&self, size: usize) -> Option<Slab> {
        if size > self.shared.slab_size {
            return None;
        }
        let mut state = self.shared.state.lock();
        if state.in_use >= state.max {
            return None;
        }
        let mut bytes = state.free.pop().unwrap_or_default();
        bytes.clear();
        bytes.resize(self.shared.slab_size, 0);
        state.in_use += 1;
        if state.in_use > state.peak {
            state.peak = state.in_use;
        }
        drop(state);
        Some(Slab {
            bytes,
            origin: Arc::clone(&self.shared),
        })
    }

    /// Like [`BufferPool::alloc`] but falls through to the shared
    /// overflow pool when this pool is exhausted.
    pub fn alloc_shared(&self, size: usize) -> Option<Slab> {
        if let Some(slab) = self.alloc(size) {
            return Some(slab);
        }
        let overflow = self.shared.overflow.as_ref()?;
        trace!(size, "guaranteed pool exhausted, promoting to shared pool");
        overflow.alloc_shared(size)
    }

    pub fn set_max(&self, max: usize) {
        self.shared.state.lock().max = max;
    }

    pub fn reset_peak(&self) {
        let mut state = self.shared.state.lock();
        state.peak = state.in_use;
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.shared.state.lock();
        PoolStats {
            in_use: state.in_use,
            peak: state.peak,
            max: state.max,
        }
    }
}

/// One pooled slab. Dropping it returns the storage to its pool.
pub struct Slab {
    bytes: Vec<u8>,
    origin: Arc<PoolShared>,
}

impl Slab {
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}

impl std::fmt::Debug for Slab {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Slab").field("len", &self.bytes.len()).finish()
    }
}

impl Drop for Slab {
    fn drop(&mut self) {
        let bytes = std::mem::take(&mut self.bytes);
        let mut state = self.origin.state.lock();
        state.in_use = state.in_use.saturating_sub(1);
        // Keep a bounded free list; anything beyond the cap is cheaper
        // to hand back to the allocator.
        if state.free.len() < state.max {
            state.free.push(bytes);
        }
    }
}
