//! Per-backend diagnostic counters.
//!
//! All counters use `Relaxed` ordering. Individual counter values are
//! eventually consistent. A [`Stats`](super::Stats) snapshot taken while
//! other threads allocate may be transiently inconsistent across counters
//! (e.g. current count briefly ahead of current bytes). Snapshots taken
//! between phases, after every worker joined, are exact.

use crate::sync::atomic::{AtomicIsize, Ordering};

/// Diagnostic-only gauge counter.
///
/// Under contention, subtract-before-add races are tolerated and the raw value
/// may transiently dip below zero. Readers should always use `get()`, which
/// clamps negative values to zero.
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
        self.0.load(Ordering::Relaxed).max(0).cast_unsigned()
    }

    /// Reset to zero. Only meaningful while no other thread touches the
    /// counter (backend `initialize`).
    #[inline]
    pub fn reset(&self) {
        self.0.store(0, Ordering::Relaxed);
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

/// The four counters every backend keeps for the harness: requested bytes and
/// allocation counts, both as live gauges and running totals.
#[derive(Default)]
pub struct UsageCounters {
    pub bytes_current: Counter,
    pub bytes_total: Counter,
    pub count_current: Counter,
    pub count_total: Counter,
}

impl UsageCounters {
    #[inline]
    pub fn on_alloc(&self, size: usize) {
        self.bytes_current.add(size);
        self.bytes_total.add(size);
        self.count_current.add(1);
        self.count_total.add(1);
    }

    #[inline]
    pub fn on_free(&self, size: usize) {
        self.bytes_current.sub(size);
        self.count_current.sub(1);
    }

    pub fn reset(&self) {
        self.bytes_current.reset();
        self.bytes_total.reset();
        self.count_current.reset();
        self.count_total.reset();
    }

    /// Build a snapshot with the given backend-specific counters attached.
    pub fn snapshot(&self, backend: Vec<(String, usize)>) -> super::Stats {
        super::Stats {
            allocated_current: self.bytes_current.get(),
            allocated_total: self.bytes_total.get(),
            allocation_count_current: self.count_current.get(),
            allocation_count_total: self.count_total.get(),
            backend,
        }
    }
}
