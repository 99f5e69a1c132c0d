//! Allocator backends the harness drives.
//!
//! The harness only ever talks to an [`AllocatorHandle`]; concrete backends
//! are picked at configuration time through [`BackendKind`].

pub mod pool;
pub(crate) mod stats;
pub mod system;
pub(crate) mod vm;

use std::fmt;
use std::ptr::NonNull;

use crate::sync::Arc;

pub use pool::{PoolAllocator, PoolConfig};
pub use system::SystemAllocator;
pub use vm::VmError;

/// Alignment used when a caller passes 0.
pub const DEFAULT_ALIGN: usize = 16;

/// Largest alignment a backend accepts. Also the upper bound of the empty
/// allocation sentinel, so no real mapping can ever be mistaken for it.
pub const MAX_ALIGN: usize = 4096;

bitflags::bitflags! {
    /// Allocation hints passed through to the backend.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct AllocFlags: u32 {
        /// Block outlives the current scope (the harness default).
        const PERSISTENT = 1 << 0;
        /// Block is short lived.
        const TEMPORARY = 1 << 1;
        /// Returned memory must read back as zero.
        const ZEROED = 1 << 2;
    }
}

/// Resolve a caller-supplied alignment. `None` for anything that is not a
/// power of two in `1..=MAX_ALIGN` (0 maps to [`DEFAULT_ALIGN`]).
#[inline]
#[must_use]
pub fn effective_align(align: usize) -> Option<usize> {
    let align = if align == 0 { DEFAULT_ALIGN } else { align };
    (align.is_power_of_two() && align <= MAX_ALIGN).then_some(align)
}

/// The address every backend hands out for a zero-size request.
///
/// Non-null, suitably aligned and never dereferenceable: it lies inside the
/// first page, which no backend ever maps.
#[inline]
#[must_use]
pub fn empty_allocation(align: usize) -> NonNull<u8> {
    debug_assert!(align.is_power_of_two() && align <= MAX_ALIGN);
    // Safety: align is non-zero (power of two).
    unsafe { NonNull::new_unchecked(std::ptr::without_provenance_mut(align)) }
}

/// True if `ptr` is the sentinel returned by [`empty_allocation`].
#[inline]
#[must_use]
pub fn is_empty_allocation(ptr: NonNull<u8>) -> bool {
    ptr.addr().get() <= MAX_ALIGN
}

/// Point-in-time allocator statistics. Produced by the backend on demand and
/// never mutated by the harness.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Stats {
    /// Bytes requested by live allocations.
    pub allocated_current: usize,
    /// Bytes requested since `initialize`.
    pub allocated_total: usize,
    /// Live allocations.
    pub allocation_count_current: usize,
    /// Allocations since `initialize`.
    pub allocation_count_total: usize,
    /// Backend-specific occupancy counters, in a stable order.
    pub backend: Vec<(String, usize)>,
}

impl Stats {
    /// Look up a backend-specific counter by name.
    #[must_use]
    pub fn backend_counter(&self, name: &str) -> Option<usize> {
        self.backend.iter().find(|(n, _)| n == name).map(|&(_, v)| v)
    }
}

/// Capability set every allocator under test provides.
///
/// Implementations must be safe to call from any number of threads at once:
/// the harness applies no locking of its own around `allocate`/`deallocate`,
/// since that thread safety is exactly the property under test.
pub trait AllocatorHandle: Send + Sync {
    /// Short backend name for reports.
    fn name(&self) -> &'static str;

    /// Bring the backend up. Must be called before the first `allocate`.
    ///
    /// # Errors
    ///
    /// Returns `VmError` if the backend cannot acquire its backing memory.
    fn initialize(&self) -> Result<(), VmError>;

    /// Tear the backend down. Every block must have been deallocated.
    fn shutdown(&self);

    /// Allocate `size` bytes aligned to `align` (0 = [`DEFAULT_ALIGN`]).
    ///
    /// `hint` is an opaque context tag (the harness passes the worker id).
    /// Returns `None` on failure, and for every request (zero-size included)
    /// while the backend is not initialized. Zero-size requests to a live
    /// backend return the [`empty_allocation`] sentinel.
    fn allocate(&self, hint: u64, size: usize, align: usize, flags: AllocFlags) -> Option<NonNull<u8>>;

    /// Release a block.
    ///
    /// # Safety
    /// `ptr` must have been returned by `allocate` on this backend and not
    /// deallocated since.
    unsafe fn deallocate(&self, ptr: NonNull<u8>);

    /// Snapshot the backend statistics.
    fn statistics(&self) -> Stats;

    /// Hand retained-but-unused capacity back to the OS.
    fn trim(&self) {}

    /// True if live blocks may abut exactly, with no bookkeeping bytes
    /// between them (size-class bins carved back to back).
    fn packs_blocks(&self) -> bool {
        false
    }
}

/// Backend variants selectable at configuration time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, clap::ValueEnum)]
pub enum BackendKind {
    /// The process system allocator (baseline).
    System,
    /// The size-class pool allocator.
    Pool,
}

impl BackendKind {
    /// Build a fresh, uninitialized backend of this kind.
    #[must_use]
    pub fn create(self, pool: &PoolConfig) -> Arc<dyn AllocatorHandle> {
        match self {
            BackendKind::System => Arc::new(SystemAllocator::new()),
            BackendKind::Pool => Arc::new(PoolAllocator::with_config(pool.clone())),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::System => f.write_str("system"),
            BackendKind::Pool => f.write_str("pool"),
        }
    }
}
