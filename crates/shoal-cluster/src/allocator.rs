//! Member ordinal allocation.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Monotonic allocator for cluster member ordinals.
///
/// Ordinals are unique within a cluster's lifetime and strictly increasing in
/// allocation order. The current value is published as a cluster sensor so a
/// rehydrated cluster resumes past every ordinal it ever handed out.
#[derive(Debug, Default)]
pub struct MemberIdAllocator {
    next: AtomicU64,
    initialized: AtomicBool,
}

impl MemberIdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Initialize the counter. The first call wins; repeated calls are no-ops.
    pub fn ensure_initialized(&self, start: u64) {
        if self
            .initialized
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.next.store(start, Ordering::Release);
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Allocate the next ordinal
    pub fn get_and_increment(&self) -> u64 {
        debug_assert!(self.is_initialized(), "allocator used before initialization");
        self.next.fetch_add(1, Ordering::AcqRel)
    }

    /// The next ordinal that would be allocated; this is the value persisted
    /// for rehydration.
    pub fn persisted_value(&self) -> u64 {
        self.next.load(Ordering::Acquire)
    }
}
