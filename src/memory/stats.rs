//! Process-wide telemetry gauges.
//!
//! All counters use `Relaxed` ordering. Individual counter values are
//! eventually consistent. Cross-counter snapshots may be transiently
//! inconsistent (e.g. mapped may briefly exceed committed while a harvest is
//! in flight). This is acceptable for diagnostic display.
//! Do NOT use these values for allocation decisions; partitions keep their
//! own exact counters for that.

use crate::sync::atomic::{AtomicIsize, Ordering};

/// Diagnostic-only gauge counter.
///
/// Under contention, subtract-before-add races are tolerated and the raw value
/// may transiently dip below zero. Readers should always use `load()`/`get()`,
/// which clamp negative values to zero.
pub struct Counter(AtomicIsize);

impl Counter {
    #[cfg(not(loom))]
    pub const fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[cfg(loom)]
    pub fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[inline]
    fn delta(val: usize) -> isize {
        // Diagnostic counters only: clamp absurd deltas instead of panicking.
        std::cmp::min(val, isize::MAX as usize).cast_signed()
    }

    #[inline]
    pub fn add(&self, val: usize) {
        self.0.fetch_add(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    pub fn sub(&self, val: usize) {
        self.0.fetch_sub(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    pub fn get(&self) -> usize {
        self.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn load(&self, ordering: Ordering) -> usize {
        self.0.load(ordering).max(0).cast_unsigned()
    }
}

// Address space reserved across all views
crate::sync::static_atomic! {
    pub static TOTAL_RESERVED: Counter = Counter::new();
}
// Backing memory committed by every partition
crate::sync::static_atomic! {
    pub static TOTAL_COMMITTED: Counter = Counter::new();
}
// Bytes mapped, counted once per view
crate::sync::static_atomic! {
    pub static TOTAL_MAPPED: Counter = Counter::new();
}

/// Process-wide gauges at one instant.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GlobalStats {
    pub reserved: usize,
    pub committed: usize,
    pub mapped: usize,
}

#[must_use]
pub fn global() -> GlobalStats {
    GlobalStats {
        reserved: TOTAL_RESERVED.get(),
        committed: TOTAL_COMMITTED.get(),
        mapped: TOTAL_MAPPED.get(),
    }
}
