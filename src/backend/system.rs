//! Baseline backend over the process system allocator.
//!
//! `deallocate` only receives an address, so every block carries a 16-byte
//! header directly in front of it recording the requested size and alignment.
//! That header is the bookkeeping overhead between neighbouring blocks.

use std::alloc::{GlobalAlloc, Layout, System};
use std::ptr::NonNull;

use super::stats::{Counter, UsageCounters};
use super::{AllocFlags, AllocatorHandle, Stats, VmError, effective_align, empty_allocation, is_empty_allocation};
use crate::sync::atomic::{AtomicBool, Ordering};

const HEADER_SIZE: usize = 16;

#[repr(C)]
struct Header {
    size: usize,
    align: usize,
}

const _: () = assert!(std::mem::size_of::<Header>() == HEADER_SIZE);

pub struct SystemAllocator {
    live: AtomicBool,
    usage: UsageCounters,
    /// Bytes obtained from the system, headers and padding included.
    raw_current: Counter,
}

impl Default for SystemAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemAllocator {
    #[must_use]
    pub fn new() -> Self {
        Self {
            live: AtomicBool::new(false),
            usage: UsageCounters::default(),
            raw_current: Counter::new(),
        }
    }

    /// Front padding for a block: room for the header, rounded so the user
    /// pointer keeps the requested alignment.
    #[inline]
    fn padding(align: usize) -> usize {
        align.max(HEADER_SIZE)
    }

    #[inline]
    fn raw_layout(size: usize, align: usize) -> Option<Layout> {
        let total = size.checked_add(Self::padding(align))?;
        Layout::from_size_align(total, align.max(HEADER_SIZE)).ok()
    }
}

impl AllocatorHandle for SystemAllocator {
    fn name(&self) -> &'static str {
        "system"
    }

    fn initialize(&self) -> Result<(), VmError> {
        if self.live.swap(true, Ordering::AcqRel) {
            return Err(VmError::InitializationFailed("system backend already initialized".to_string()));
        }
        self.usage.reset();
        self.raw_current.reset();
        Ok(())
    }

    fn shutdown(&self) {
        self.live.store(false, Ordering::Release);
        let leaked = self.usage.count_current.get();
        if leaked != 0 {
            log::warn!("system backend shut down with {leaked} live allocation(s)");
        }
    }

    fn allocate(&self, _hint: u64, size: usize, align: usize, flags: AllocFlags) -> Option<NonNull<u8>> {
        if !self.live.load(Ordering::Acquire) {
            return None;
        }
        let align = effective_align(align)?;
        if size == 0 {
            return Some(empty_allocation(align));
        }
        let layout = Self::raw_layout(size, align)?;

        // Safety: layout has non-zero size.
        let raw = unsafe {
            if flags.contains(AllocFlags::ZEROED) {
                System.alloc_zeroed(layout)
            } else {
                System.alloc(layout)
            }
        };
        let raw = NonNull::new(raw)?;

        // Safety: padding < layout.size(), so the user pointer and the header
        // in front of it are inside the block.
        let user = unsafe { raw.add(Self::padding(align)) };
        // Safety: the header slot is in bounds and 8-byte aligned (user is
        // at least 16-byte aligned).
        unsafe {
            user.cast::<Header>().sub(1).write(Header { size, align });
        }

        self.usage.on_alloc(size);
        self.raw_current.add(layout.size());
        Some(user)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>) {
        if is_empty_allocation(ptr) {
            return;
        }
        // Safety: ptr came from `allocate`, which wrote the header.
        let Header { size, align } = unsafe { ptr.cast::<Header>().sub(1).read() };
        let Some(layout) = Self::raw_layout(size, align) else {
            debug_assert!(false, "corrupt system block header at {ptr:p}");
            return;
        };
        // Safety: reconstructs the exact base and layout used by `allocate`.
        unsafe {
            let raw = ptr.sub(Self::padding(align));
            System.dealloc(raw.as_ptr(), layout);
        }
        self.usage.on_free(size);
        self.raw_current.sub(layout.size());
    }

    fn statistics(&self) -> Stats {
        self.usage.snapshot(vec![("raw_current".to_string(), self.raw_current.get())])
    }
}
