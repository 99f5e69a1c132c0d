//! Address-space calls behind the pool backend.
//!
//! The pool makes one `PROT_NONE` reservation for all of its class regions,
//! commits 64 KiB blocks inside it as bins are needed, and decommits empty
//! blocks on `trim()`. Requests too large for a size class get a mapping of
//! their own through [`map_zeroed`].

use std::fmt;
use std::io;
use std::ptr::NonNull;

#[derive(Debug)]
pub enum VmError {
    /// `op` (reserve, commit, decommit or release) was refused by the OS.
    Mapping { op: &'static str, source: io::Error },
    /// Every block of a size-class region is in use.
    ClassExhausted { bin_size: usize, blocks: usize },
    InitializationFailed(String),
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmError::Mapping { op, source } => write!(f, "{op} failed: {source}"),
            VmError::ClassExhausted { bin_size, blocks } => {
                write!(f, "size class {bin_size} exhausted ({blocks} blocks)")
            }
            VmError::InitializationFailed(msg) => write!(f, "allocator initialization failed: {msg}"),
        }
    }
}

impl std::error::Error for VmError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            VmError::Mapping { source, .. } => Some(source),
            _ => None,
        }
    }
}

pub(crate) use os::{commit, decommit, page_size, release, reserve};

#[cfg(all(unix, not(any(loom, miri))))]
mod os {
    use super::{NonNull, VmError};
    use libc::c_void;
    use std::io;

    fn os_error(op: &'static str) -> VmError {
        VmError::Mapping {
            op,
            source: io::Error::last_os_error(),
        }
    }

    /// Reserve `len` bytes of inaccessible address space.
    pub(crate) fn reserve(len: usize) -> Result<NonNull<u8>, VmError> {
        // Safety: a fresh anonymous mapping aliases nothing.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(os_error("reserve"));
        }
        NonNull::new(ptr.cast::<u8>()).ok_or_else(|| os_error("reserve"))
    }

    /// Make `[ptr, ptr + len)` readable and writable.
    ///
    /// # Safety
    /// The range must lie inside one live reservation.
    pub(crate) unsafe fn commit(ptr: NonNull<u8>, len: usize) -> Result<(), VmError> {
        // Safety: guaranteed by the caller.
        let rc = unsafe { libc::mprotect(ptr.as_ptr().cast::<c_void>(), len, libc::PROT_READ | libc::PROT_WRITE) };
        if rc != 0 {
            return Err(os_error("commit"));
        }
        Ok(())
    }

    /// Hand the pages of an empty block back to the kernel and make the
    /// range inaccessible again. A later commit reads zeros.
    ///
    /// # Safety
    /// The range must lie inside one live reservation and hold no live bins.
    pub(crate) unsafe fn decommit(ptr: NonNull<u8>, len: usize) -> Result<(), VmError> {
        let addr = ptr.as_ptr().cast::<c_void>();
        // Safety: guaranteed by the caller.
        if unsafe { libc::madvise(addr, len, libc::MADV_DONTNEED) } != 0 {
            return Err(os_error("decommit"));
        }
        // Safety: as above.
        if unsafe { libc::mprotect(addr, len, libc::PROT_NONE) } != 0 {
            return Err(os_error("decommit"));
        }
        Ok(())
    }

    /// Unmap a whole reservation.
    ///
    /// # Safety
    /// `(ptr, len)` must be exactly what `reserve` returned and nothing may
    /// point into it afterwards.
    pub(crate) unsafe fn release(ptr: NonNull<u8>, len: usize) -> Result<(), VmError> {
        // Safety: guaranteed by the caller.
        if unsafe { libc::munmap(ptr.as_ptr().cast::<c_void>(), len) } != 0 {
            return Err(os_error("release"));
        }
        Ok(())
    }

    pub(crate) fn page_size() -> usize {
        use crate::sync::OnceLock;
        static PAGE: OnceLock<usize> = OnceLock::new();
        *PAGE.get_or_init(|| {
            // Safety: sysconf has no preconditions.
            let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
            usize::try_from(raw).ok().filter(|&p| p > 0).unwrap_or(4096)
        })
    }
}

// loom and Miri cannot issue mapping syscalls, so a reservation is a zeroed
// heap allocation that is always accessible.
#[cfg(any(loom, miri, not(unix)))]
mod os {
    use super::{NonNull, VmError};
    use std::alloc::Layout;
    use std::io;

    const PAGE: usize = 4096;

    fn layout(op: &'static str, len: usize) -> Result<Layout, VmError> {
        Layout::from_size_align(len, PAGE)
            .ok()
            .filter(|l| l.size() != 0)
            .ok_or_else(|| VmError::Mapping {
                op,
                source: io::Error::from(io::ErrorKind::InvalidInput),
            })
    }

    pub(crate) fn reserve(len: usize) -> Result<NonNull<u8>, VmError> {
        let layout = layout("reserve", len)?;
        // Safety: layout has non-zero size.
        NonNull::new(unsafe { std::alloc::alloc_zeroed(layout) }).ok_or_else(|| VmError::Mapping {
            op: "reserve",
            source: io::Error::from(io::ErrorKind::OutOfMemory),
        })
    }

    pub(crate) unsafe fn commit(_ptr: NonNull<u8>, _len: usize) -> Result<(), VmError> {
        Ok(())
    }

    pub(crate) unsafe fn decommit(_ptr: NonNull<u8>, _len: usize) -> Result<(), VmError> {
        Ok(())
    }

    pub(crate) unsafe fn release(ptr: NonNull<u8>, len: usize) -> Result<(), VmError> {
        let layout = layout("release", len)?;
        // Safety: `ptr` came from `reserve` with the same length.
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
        Ok(())
    }

    pub(crate) fn page_size() -> usize {
        PAGE
    }
}

/// A fresh readable, writable, zero-filled mapping of `len` bytes for one
/// large block. Release it with [`release`].
pub(crate) fn map_zeroed(len: usize) -> Result<NonNull<u8>, VmError> {
    let ptr = reserve(len)?;
    // Safety: `ptr` heads a reservation of exactly `len` bytes.
    if let Err(e) = unsafe { commit(ptr, len) } {
        // Safety: nothing points into the failed mapping yet.
        let _ = unsafe { release(ptr, len) };
        return Err(e);
    }
    Ok(ptr)
}

/// Round `size` up to a multiple of `granule` (a power of two).
#[inline]
pub(crate) fn round_up(size: usize, granule: usize) -> Option<usize> {
    debug_assert!(granule.is_power_of_two());
    size.checked_add(granule - 1).map(|s| s & !(granule - 1))
}
