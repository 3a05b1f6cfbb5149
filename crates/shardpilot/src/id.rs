//! Monotonic id allocation for stores, regions and peers.

use std::sync::atomic::{AtomicU64, Ordering};

/// Hands out process-unique ids. Embedders seed the floor from durable
/// state so restarts never re-issue an id.
pub struct IdAllocator {
    next: AtomicU64,
}

impl IdAllocator {
    pub fn new(start: u64) -> Self {
        Self {
            next: AtomicU64::new(start.max(1)),
        }
    }

    pub fn alloc(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    /// Raise the floor above `floor`; never lowers it.
    pub fn seed(&self, floor: u64) {
        self.next.fetch_max(floor + 1, Ordering::Relaxed);
    }
}
