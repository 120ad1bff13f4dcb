//! Per-arena diagnostic counters.
//!
//! Everything here is `Relaxed`: each counter converges on its own, but a
//! snapshot across several may be momentarily skewed (an allocation can
//! land before its class counter does). Good enough for metrics output;
//! never base an allocation decision on these values.

use crate::sync::atomic::{AtomicU64, Ordering};

/// Monotone diagnostic counter, incremented outside the arena guard.
///
/// The guarded counters (Normal allocations, per-class deallocations) are
/// plain integers inside the pooled-state mutex; this type covers only the
/// classes whose hot path never takes that mutex.
pub(crate) struct Counter(AtomicU64);

impl Counter {
    #[cfg(not(loom))]
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    #[cfg(loom)]
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    #[inline]
    pub fn add(&self, val: u64) {
        self.0.fetch_add(val, Ordering::Relaxed);
    }

    #[inline]
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}
