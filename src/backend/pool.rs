//! Size-class pool allocator backend.
//!
//! One contiguous address-space reservation is made at `initialize()` and cut
//! into equal per-class regions, one for each of the 44 size classes. A region
//! is carved into blocks (default 64 KiB) that are committed on demand; each
//! block hands out fixed-size bins, first from a bump cursor and then from an
//! intrusive free list threaded through freed bins. Requests above 64 KiB get
//! their own page-granular mapping.
//!
//! Because the region of a pointer identifies its size class, `deallocate`
//! needs nothing but the address.
//!
//! Each size class sits behind its own mutex; there is no thread cache, so
//! every call takes exactly one lock.

use std::collections::HashMap;
use std::ptr::NonNull;

#[cfg(debug_assertions)]
use fixedbitset::FixedBitSet;

use super::stats::{Counter, UsageCounters};
use super::vm::{self, VmError, round_up};
use super::{AllocFlags, AllocatorHandle, Stats, effective_align, empty_allocation, is_empty_allocation};
use crate::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use crate::sync::{Mutex, lock};

/// Largest request served from a size class.
pub(crate) const MAX_SMALL_SIZE: usize = 65536;

/// Default address space reserved per size class.
pub(crate) const CLASS_RESERVED_SIZE: usize = 256 * 1024 * 1024;

/// Configuration for [`PoolAllocator`]. Resolved and validated at
/// `initialize()`.
#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// Address space reserved per size class. Rounded up to a whole number of
    /// blocks. Default: 256 MB.
    pub class_reserved_size: usize,

    /// Block size in bytes. Default: `max(64KB, system page size)`.
    pub block_size: usize,

    /// Decommit fully empty blocks on `trim()`. Default: true.
    pub decommit_on_trim: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            class_reserved_size: CLASS_RESERVED_SIZE,
            block_size: 0, // 0 = auto-detect (max(64KB, page_size))
            decommit_on_trim: true,
        }
    }
}

// 44 size classes: 16B..128B (step 16), then four steps per doubling up to 64KB.
pub(crate) const SIZE_CLASSES: &[usize] = &[
    16, 32, 48, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 384, 448, 512, 640, 768, 896, 1024,
    1280, 1536, 1792, 2048, 2560, 3072, 3584, 4096, 5120, 6144, 7168, 8192, 10240, 12288, 14336,
    16384, 20480, 24576, 28672, 32768, 40960, 49152, 57344, 65536,
];

const NUM_CLASSES: usize = 44;

/// O(1) size-to-class lookup. Index by `ceil(size / 16)`; 4097 entries cover
/// sizes 1..=65536 in 16-byte quanta.
static SIZE_CLASS_LUT: [u8; 4097] = build_size_class_lut();

const fn build_size_class_lut() -> [u8; 4097] {
    const CLASSES: [usize; NUM_CLASSES] = [
        16, 32, 48, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 384, 448, 512, 640, 768, 896,
        1024, 1280, 1536, 1792, 2048, 2560, 3072, 3584, 4096, 5120, 6144, 7168, 8192, 10240, 12288,
        14336, 16384, 20480, 24576, 28672, 32768, 40960, 49152, 57344, 65536,
    ];
    let mut table = [0u8; 4097];
    let mut q: usize = 1;
    let mut sc: usize = 0;
    while sc < NUM_CLASSES {
        let class_quanta = CLASSES[sc] / 16;
        while q <= class_quanta {
            table[q] = sc as u8;
            q += 1;
        }
        sc += 1;
    }
    table
}

/// Smallest size class that fits `size` and whose bin size is a multiple of
/// `align`. `None` for zero or oversized requests.
pub(crate) fn size_class(size: usize, align: usize) -> Option<usize> {
    if size == 0 || size > MAX_SMALL_SIZE {
        return None;
    }
    let first = SIZE_CLASS_LUT[size.div_ceil(16)] as usize;
    (first..NUM_CLASSES).find(|&idx| SIZE_CLASSES[idx].is_multiple_of(align))
}

// ----------------------------------------------------------------------------
// BitTree
// ----------------------------------------------------------------------------

/// Blocks tracked by one [`BitTree`]; also the per-class block limit.
pub(crate) const BITTREE_CAPACITY: usize = 16384;

/// Three-level bitset answering "lowest block with a free bin" in three
/// `trailing_zeros` steps.
pub(crate) struct BitTree {
    l0: u64,        // bit i: l1[i] non-zero
    l1: [u64; 4],   // bit j of word i: l2[i * 64 + j] non-zero
    l2: [u64; 256], // one bit per block
}

impl BitTree {
    pub fn new() -> Self {
        Self {
            l0: 0,
            l1: [0; 4],
            l2: [0; 256],
        }
    }

    /// Mark block as having free space.
    pub fn mark_free(&mut self, block_index: usize) {
        let (l2_word, l2_bit) = (block_index / 64, block_index % 64);
        let (l1_word, l1_bit) = (l2_word / 64, l2_word % 64);

        self.l2[l2_word] |= 1u64 << l2_bit;
        self.l1[l1_word] |= 1u64 << l1_bit;
        self.l0 |= 1u64 << l1_word;
    }

    /// Mark block as full.
    pub fn mark_full(&mut self, block_index: usize) {
        let (l2_word, l2_bit) = (block_index / 64, block_index % 64);

        self.l2[l2_word] &= !(1u64 << l2_bit);
        if self.l2[l2_word] == 0 {
            let (l1_word, l1_bit) = (l2_word / 64, l2_word % 64);
            self.l1[l1_word] &= !(1u64 << l1_bit);
            if self.l1[l1_word] == 0 {
                self.l0 &= !(1u64 << l1_word);
            }
        }
    }

    /// Lowest block with free space.
    pub fn find_free(&self) -> Option<usize> {
        if self.l0 == 0 {
            return None;
        }
        let l1_word = self.l0.trailing_zeros() as usize;
        let l2_word = l1_word * 64 + self.l1[l1_word].trailing_zeros() as usize;
        Some(l2_word * 64 + self.l2[l2_word].trailing_zeros() as usize)
    }
}

// ----------------------------------------------------------------------------
// Blocks and per-class pools
// ----------------------------------------------------------------------------

const BIN_SENTINEL: u16 = 0xFFFF;

/// 32-bit canary written at offset 4 of every freed bin.
/// Checked when the bin is handed out again to catch writes after free.
/// Only active when debug assertions are enabled.
#[cfg(debug_assertions)]
const FREE_CANARY: u32 = 0xAB_AD_BA_BE;

struct BlockMeta {
    free_count: u16,
    /// First bin on the intrusive free list, or `BIN_SENTINEL`.
    free_head: u16,
    /// Next never-used bin.
    bump_cursor: u16,
    committed: bool,
    /// Set bits are free bins; catches double frees.
    #[cfg(debug_assertions)]
    free_map: FixedBitSet,
}

impl BlockMeta {
    fn fresh(bins_per_block: u16) -> Self {
        Self {
            free_count: bins_per_block,
            free_head: BIN_SENTINEL,
            bump_cursor: 0,
            committed: true,
            #[cfg(debug_assertions)]
            free_map: {
                let mut map = FixedBitSet::with_capacity(bins_per_block as usize);
                map.insert_range(..);
                map
            },
        }
    }
}

/// All blocks of one size class. Guarded by the class mutex.
struct ClassPool {
    bin_size: usize,
    block_size: usize,
    bins_per_block: u16,
    base: NonNull<u8>,
    max_blocks: usize,
    committed: usize,
    bit_tree: BitTree,
    blocks: Vec<BlockMeta>,
}

// Safety: ClassPool only points into the allocator's own reservation and is
// always accessed under the class mutex.
unsafe impl Send for ClassPool {}

impl ClassPool {
    fn new(bin_size: usize, block_size: usize, base: NonNull<u8>, max_blocks: usize) -> Self {
        let bins_per_block = u16::try_from(block_size / bin_size).unwrap_or(BIN_SENTINEL - 1);
        Self {
            bin_size,
            block_size,
            bins_per_block,
            base,
            max_blocks,
            committed: 0,
            bit_tree: BitTree::new(),
            blocks: Vec::new(),
        }
    }

    #[inline]
    fn block_ptr(&self, block_idx: usize) -> NonNull<u8> {
        // Safety: block_idx < max_blocks, so the offset is inside the region.
        unsafe { self.base.add(block_idx * self.block_size) }
    }

    #[inline]
    fn bin_ptr(&self, block_idx: usize, bin_idx: u16) -> NonNull<u8> {
        // Safety: bin_idx < bins_per_block, so the bin is inside the block.
        unsafe { self.block_ptr(block_idx).add(bin_idx as usize * self.bin_size) }
    }

    /// Pick (and if needed commit) a block with at least one free bin.
    fn acquire_block(&mut self, committed: &Counter) -> Result<usize, VmError> {
        if let Some(idx) = self.bit_tree.find_free() {
            if !self.blocks[idx].committed {
                // Safety: the block lies inside our reservation.
                unsafe { vm::commit(self.block_ptr(idx), self.block_size)? };
                self.committed += self.block_size;
                committed.add(self.block_size);
                self.blocks[idx] = BlockMeta::fresh(self.bins_per_block);
            }
            return Ok(idx);
        }

        let idx = self.blocks.len();
        if idx >= self.max_blocks {
            return Err(VmError::ClassExhausted {
                bin_size: self.bin_size,
                blocks: self.max_blocks,
            });
        }
        // Safety: idx < max_blocks, inside our reservation.
        unsafe { vm::commit(self.block_ptr(idx), self.block_size)? };
        self.committed += self.block_size;
        committed.add(self.block_size);
        self.blocks.push(BlockMeta::fresh(self.bins_per_block));
        self.bit_tree.mark_free(idx);
        Ok(idx)
    }

    fn alloc(&mut self, committed: &Counter) -> Result<NonNull<u8>, VmError> {
        let block_idx = self.acquire_block(committed)?;
        let block = &mut self.blocks[block_idx];

        let bin_idx = if block.free_head == BIN_SENTINEL {
            debug_assert!(block.bump_cursor < self.bins_per_block);
            let bin_idx = block.bump_cursor;
            block.bump_cursor += 1;
            bin_idx
        } else {
            block.free_head
        };
        let bin_ptr = self.bin_ptr(block_idx, bin_idx);
        let block = &mut self.blocks[block_idx];

        if block.free_head == bin_idx {
            #[cfg(debug_assertions)]
            {
                // Safety: bin is at least 16 bytes and was written by `free`.
                let canary = unsafe { bin_ptr.add(4).cast::<u32>().read_unaligned() };
                assert!(
                    canary == FREE_CANARY,
                    "pool corruption: free-bin canary at {bin_ptr:p}+4 was 0x{canary:08x}, expected 0x{FREE_CANARY:08x}",
                );
            }
            // The first two bytes of a free bin hold the next free index.
            // Safety: bin_ptr is a free bin inside a committed block.
            block.free_head = unsafe { bin_ptr.cast::<u16>().read() };
        }

        block.free_count -= 1;
        if block.free_count == 0 {
            self.bit_tree.mark_full(block_idx);
        }

        #[cfg(debug_assertions)]
        block.free_map.set(bin_idx as usize, false);

        Ok(bin_ptr)
    }

    fn free(&mut self, ptr: NonNull<u8>) {
        let offset = ptr.addr().get() - self.base.addr().get();
        let block_idx = offset / self.block_size;
        let offset_in_block = offset % self.block_size;

        assert!(
            block_idx < self.blocks.len() && self.blocks[block_idx].committed,
            "pointer {ptr:p} is not inside a live block of size class {}",
            self.bin_size
        );
        assert!(
            offset_in_block.is_multiple_of(self.bin_size),
            "pointer {ptr:p} is not aligned to bin size {}",
            self.bin_size
        );
        let bin_idx = u16::try_from(offset_in_block / self.bin_size).unwrap_or(BIN_SENTINEL);

        let block = &mut self.blocks[block_idx];

        #[cfg(debug_assertions)]
        {
            assert!(
                !block.free_map.contains(bin_idx as usize),
                "double free in size class {}: block {block_idx}, bin {bin_idx}",
                self.bin_size,
            );
            block.free_map.insert(bin_idx as usize);
        }

        // Safety: ptr is a live bin of at least 16 bytes owned by this pool.
        unsafe {
            ptr.cast::<u16>().write(block.free_head);
            #[cfg(debug_assertions)]
            ptr.add(4).cast::<u32>().write_unaligned(FREE_CANARY);
        }

        block.free_head = bin_idx;
        block.free_count += 1;
        if block.free_count == 1 {
            self.bit_tree.mark_free(block_idx);
        }
    }

    /// Decommit every fully empty block and drop trailing ones.
    /// Returns the number of bytes decommitted.
    fn trim(&mut self, committed: &Counter) -> usize {
        let mut released = 0;
        for idx in 0..self.blocks.len() {
            let block = &self.blocks[idx];
            if block.committed && block.free_count == self.bins_per_block {
                // Safety: the block is empty and inside our reservation.
                if unsafe { vm::decommit(self.block_ptr(idx), self.block_size) }.is_ok() {
                    self.blocks[idx].committed = false;
                    self.committed -= self.block_size;
                    committed.sub(self.block_size);
                    released += self.block_size;
                }
            }
        }
        while let Some(last) = self.blocks.last()
            && !last.committed
        {
            let idx = self.blocks.len() - 1;
            self.blocks.pop();
            self.bit_tree.mark_full(idx);
        }
        released
    }

    fn live_bins(&self) -> usize {
        self.blocks
            .iter()
            .filter(|b| b.committed)
            .map(|b| usize::from(self.bins_per_block - b.free_count))
            .sum()
    }
}

// ----------------------------------------------------------------------------
// Large allocations
// ----------------------------------------------------------------------------

struct LargeBlock {
    base: NonNull<u8>,
    mapped: usize,
    size: usize,
}

// Safety: a LargeBlock owns its mapping; it only moves between threads inside
// the large-block table.
unsafe impl Send for LargeBlock {}

// ----------------------------------------------------------------------------
// PoolAllocator
// ----------------------------------------------------------------------------

/// The single reservation backing every size class.
struct Arena {
    base: NonNull<u8>,
    len: usize,
}

// Safety: Arena owns its reservation; it is only touched under the lifecycle lock.
unsafe impl Send for Arena {}

pub struct PoolAllocator {
    config: PoolConfig,
    /// `Some` between `initialize` and `shutdown`.
    lifecycle: Mutex<Option<Arena>>,
    /// Arena base address, 0 while down. Read lock-free by `deallocate`.
    arena_base: AtomicUsize,
    /// Bytes of address space per class region.
    class_span: AtomicUsize,
    classes: Vec<Mutex<Option<ClassPool>>>,
    /// Keyed by address.
    large: Mutex<HashMap<usize, LargeBlock>>,
    usage: UsageCounters,
    committed: Counter,
    large_mapped: Counter,
    class_calls: Vec<AtomicU64>,
}

impl Default for PoolAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl PoolAllocator {
    /// Create a pool backend with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(PoolConfig::default())
    }

    /// Create a pool backend with custom configuration. Nothing is reserved
    /// until `initialize()`.
    #[must_use]
    pub fn with_config(config: PoolConfig) -> Self {
        Self {
            config,
            lifecycle: Mutex::new(None),
            arena_base: AtomicUsize::new(0),
            class_span: AtomicUsize::new(0),
            classes: (0..NUM_CLASSES).map(|_| Mutex::new(None)).collect(),
            large: Mutex::new(HashMap::new()),
            usage: UsageCounters::default(),
            committed: Counter::new(),
            large_mapped: Counter::new(),
            class_calls: (0..NUM_CLASSES).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    /// Resolve `(block_size, class_span)` from the configuration.
    fn geometry(&self) -> Result<(usize, usize), VmError> {
        let page = vm::page_size();
        let block_size = if self.config.block_size == 0 {
            std::cmp::max(64 * 1024, page)
        } else {
            self.config.block_size
        };
        if !block_size.is_power_of_two() || block_size < page {
            return Err(VmError::InitializationFailed(format!(
                "block_size {block_size} must be a power of two and at least the page size {page}"
            )));
        }
        if block_size < MAX_SMALL_SIZE {
            return Err(VmError::InitializationFailed(format!(
                "block_size {block_size} cannot hold the largest size class ({MAX_SMALL_SIZE})"
            )));
        }
        if block_size / SIZE_CLASSES[0] >= usize::from(BIN_SENTINEL) {
            return Err(VmError::InitializationFailed(format!(
                "block_size {block_size} yields more bins per block than a u16 index can address"
            )));
        }
        let class_span = round_up(self.config.class_reserved_size.max(block_size), block_size)
            .ok_or_else(|| VmError::InitializationFailed("class_reserved_size overflows".to_string()))?;
        if class_span / block_size > BITTREE_CAPACITY {
            return Err(VmError::InitializationFailed(format!(
                "class_reserved_size {class_span} exceeds {BITTREE_CAPACITY} blocks of {block_size} bytes"
            )));
        }
        Ok((block_size, class_span))
    }

    fn allocate_large(&self, size: usize) -> Option<NonNull<u8>> {
        let mapped = round_up(size, vm::page_size())?;
        let ptr = vm::map_zeroed(mapped)
            .inspect_err(|e| log::debug!("pool backend: large mapping of {mapped} bytes: {e}"))
            .ok()?;
        lock(&self.large).insert(ptr.addr().get(), LargeBlock { base: ptr, mapped, size });
        self.large_mapped.add(mapped);
        self.committed.add(mapped);
        self.usage.on_alloc(size);
        Some(ptr)
    }

    fn deallocate_large(&self, ptr: NonNull<u8>) {
        let entry = lock(&self.large).remove(&ptr.addr().get());
        let Some(LargeBlock { base, mapped, size }) = entry else {
            panic!("pointer {ptr:p} was not allocated by this pool backend");
        };
        // Safety: the mapping was created by `allocate_large` and is no longer referenced.
        if let Err(e) = unsafe { vm::release(base, mapped) } {
            log::warn!("pool backend: releasing large block {ptr:p}: {e}");
        }
        self.large_mapped.sub(mapped);
        self.committed.sub(mapped);
        self.usage.on_free(size);
    }
}

impl AllocatorHandle for PoolAllocator {
    fn name(&self) -> &'static str {
        "pool"
    }

    fn initialize(&self) -> Result<(), VmError> {
        let mut lifecycle = lock(&self.lifecycle);
        if lifecycle.is_some() {
            return Err(VmError::InitializationFailed("pool backend already initialized".to_string()));
        }
        let (block_size, class_span) = self.geometry()?;
        let len = class_span
            .checked_mul(NUM_CLASSES)
            .ok_or_else(|| VmError::InitializationFailed("arena size overflows".to_string()))?;

        let base = vm::reserve(len)?;
        for (idx, (slot, &bin_size)) in self.classes.iter().zip(SIZE_CLASSES).enumerate() {
            // Safety: idx * class_span < len.
            let region = unsafe { base.add(idx * class_span) };
            *lock(slot) = Some(ClassPool::new(bin_size, block_size, region, class_span / block_size));
        }
        for calls in &self.class_calls {
            calls.store(0, Ordering::Relaxed);
        }
        self.usage.reset();
        self.committed.reset();
        self.large_mapped.reset();

        self.class_span.store(class_span, Ordering::Relaxed);
        self.arena_base.store(base.addr().get(), Ordering::Release);
        *lifecycle = Some(Arena { base, len });

        log::debug!(
            "pool backend: reserved {len} bytes ({NUM_CLASSES} classes x {class_span}, blocks of {block_size})"
        );
        Ok(())
    }

    fn shutdown(&self) {
        let mut lifecycle = lock(&self.lifecycle);
        let Some(arena) = lifecycle.take() else {
            return;
        };
        self.arena_base.store(0, Ordering::Release);

        let live = self.usage.count_current.get();
        if live != 0 {
            log::warn!("pool backend shut down with {live} live allocation(s)");
        }

        for slot in &self.classes {
            if let Some(pool) = lock(slot).take() {
                self.committed.sub(pool.committed);
            }
        }
        for (_, block) in lock(&self.large).drain() {
            // Safety: the mapping is ours; live blocks are invalidated by shutdown.
            let _ = unsafe { vm::release(block.base, block.mapped) };
            self.large_mapped.sub(block.mapped);
            self.committed.sub(block.mapped);
        }
        // Safety: every class pool into this reservation was dropped above.
        if let Err(e) = unsafe { vm::release(arena.base, arena.len) } {
            log::warn!("pool backend: releasing arena: {e}");
        }
    }

    fn allocate(&self, _hint: u64, size: usize, align: usize, flags: AllocFlags) -> Option<NonNull<u8>> {
        if self.arena_base.load(Ordering::Acquire) == 0 {
            return None;
        }
        let align = effective_align(align)?;
        if size == 0 {
            return Some(empty_allocation(align));
        }
        if size > MAX_SMALL_SIZE {
            // Fresh mappings are zero-filled and page aligned.
            return self.allocate_large(size);
        }

        let idx = size_class(size, align)?;
        let bin_size = SIZE_CLASSES[idx];
        let ptr = {
            let mut guard = lock(&self.classes[idx]);
            let pool = guard.as_mut()?;
            match pool.alloc(&self.committed) {
                Ok(ptr) => ptr,
                Err(e) => {
                    log::debug!("pool backend: {bin_size}-byte class: {e}");
                    return None;
                }
            }
        };
        if flags.contains(AllocFlags::ZEROED) {
            // Safety: the bin is ours and bin_size bytes long.
            unsafe { ptr.write_bytes(0, bin_size) };
        }
        self.class_calls[idx].fetch_add(1, Ordering::Relaxed);
        self.usage.on_alloc(bin_size);
        Some(ptr)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>) {
        if is_empty_allocation(ptr) {
            return;
        }
        let base = self.arena_base.load(Ordering::Acquire);
        let span = self.class_span.load(Ordering::Relaxed);
        let addr = ptr.addr().get();

        if base != 0 && addr >= base && addr < base + span * NUM_CLASSES {
            let idx = (addr - base) / span;
            let mut guard = lock(&self.classes[idx]);
            if let Some(pool) = guard.as_mut() {
                pool.free(ptr);
                self.usage.on_free(SIZE_CLASSES[idx]);
            }
            return;
        }
        self.deallocate_large(ptr);
    }

    fn statistics(&self) -> Stats {
        let reserved = lock(&self.lifecycle).as_ref().map_or(0, |a| a.len) + self.large_mapped.get();
        let mut backend = vec![
            ("reserved".to_string(), reserved),
            ("committed".to_string(), self.committed.get()),
            ("large_live".to_string(), self.large_mapped.get()),
        ];
        for (calls, bin_size) in self.class_calls.iter().zip(SIZE_CLASSES) {
            let n = calls.load(Ordering::Relaxed);
            if n != 0 {
                backend.push((format!("calls.class_{bin_size}"), usize::try_from(n).unwrap_or(usize::MAX)));
            }
        }
        self.usage.snapshot(backend)
    }

    fn trim(&self) {
        if !self.config.decommit_on_trim {
            return;
        }
        let mut released = 0;
        for slot in &self.classes {
            if let Some(pool) = lock(slot).as_mut() {
                released += pool.trim(&self.committed);
            }
        }
        log::debug!("pool backend: trim decommitted {released} bytes");
    }

    fn packs_blocks(&self) -> bool {
        true
    }
}

impl PoolAllocator {
    /// Bins currently handed out across all size classes.
    #[must_use]
    pub fn live_bins(&self) -> usize {
        self.classes
            .iter()
            .filter_map(|slot| lock(slot).as_ref().map(ClassPool::live_bins))
            .sum()
    }
}

impl Drop for PoolAllocator {
    fn drop(&mut self) {
        self.shutdown();
    }
}
