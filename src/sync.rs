// Unified synchronization primitive shim.
//
// Under `cfg(loom)`, re-exports from the `loom` crate. Otherwise, re-exports
// from `std`.
//
// **Every** file in the crate must import sync primitives through this module.
// A single direct `use std::sync::atomic::*` would bypass loom's scheduler and
// silently break exhaustive testing.
#![allow(unused_imports, dead_code)]

// ---------------------------------------------------------------------------
// atomic
// ---------------------------------------------------------------------------
pub(crate) mod atomic {
    #[cfg(loom)]
    pub(crate) use loom::sync::atomic::{AtomicBool, AtomicIsize, AtomicU64, AtomicUsize, Ordering};

    #[cfg(not(loom))]
    pub(crate) use std::sync::atomic::{AtomicBool, AtomicIsize, AtomicU64, AtomicUsize, Ordering};
}

// ---------------------------------------------------------------------------
// sync (Mutex, Arc, Condvar)
// ---------------------------------------------------------------------------
#[cfg(loom)]
pub(crate) use loom::sync::{Condvar, Mutex, MutexGuard};

#[cfg(not(loom))]
pub(crate) use std::sync::{Condvar, Mutex, MutexGuard};

// loom's Arc cannot coerce to `Arc<dyn AllocatorHandle>`, so shared backends
// use the std Arc under both configurations.
pub(crate) use std::sync::Arc;

/// Lock a mutex, recovering the guard if a previous holder panicked.
///
/// A panicking worker must not take the allocator (or the pool's completion
/// latch) down with it, so poisoning is ignored everywhere in the crate.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// thread
// ---------------------------------------------------------------------------
pub(crate) mod thread {
    #[cfg(loom)]
    pub(crate) use loom::thread::{Builder, JoinHandle, spawn, yield_now};

    #[cfg(not(loom))]
    pub(crate) use std::thread::{Builder, JoinHandle, spawn, yield_now};

    /// Sleep for `duration`. Under loom there is no wall clock, so this
    /// degrades to a yield that still lets the model explore a reschedule.
    pub(crate) fn sleep(duration: std::time::Duration) {
        #[cfg(loom)]
        {
            let _ = duration;
            loom::thread::yield_now();
        }
        #[cfg(not(loom))]
        std::thread::sleep(duration);
    }
}

// ---------------------------------------------------------------------------
// OnceLock: only the mmap layer caches the page size, and it is compiled out
// under loom.
// ---------------------------------------------------------------------------
#[cfg(not(loom))]
pub(crate) use std::sync::OnceLock;
