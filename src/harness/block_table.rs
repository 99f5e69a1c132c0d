//! Per-worker registry of live blocks and the overlap oracle.

use std::fmt;
use std::ptr::NonNull;

use crate::backend::AllocatorHandle;
use crate::error::HarnessError;
use crate::harness::workload::FillPattern;

/// Byte range `[start, start + len)` of a block, by address.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockRange {
    pub start: usize,
    pub len: usize,
}

impl BlockRange {
    #[inline]
    #[must_use]
    pub fn end(&self) -> usize {
        self.start.saturating_add(self.len)
    }
}

impl fmt::Display for BlockRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:#x}, {:#x}) ({} bytes)", self.start, self.end(), self.len)
    }
}

/// How close two live blocks may sit.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, clap::ValueEnum)]
pub enum AdjacencyRule {
    /// Blocks may abut exactly: `lower.end <= upper.start`. Only for
    /// backends that pack blocks with no bookkeeping between them.
    AllowAbut,
    /// At least one byte must separate blocks: `lower.end < upper.start`.
    #[default]
    RequireGap,
}

impl AdjacencyRule {
    /// The strictest rule `allocator` can satisfy.
    #[must_use]
    pub fn for_backend(allocator: &dyn AllocatorHandle) -> Self {
        if allocator.packs_blocks() {
            AdjacencyRule::AllowAbut
        } else {
            AdjacencyRule::RequireGap
        }
    }
}

/// True if two ranges violate `rule`. Zero-size ranges never conflict.
#[must_use]
pub fn ranges_conflict(a: BlockRange, b: BlockRange, rule: AdjacencyRule) -> bool {
    if a.len == 0 || b.len == 0 {
        return false;
    }
    if a.start == b.start {
        return true;
    }
    let (lower, upper) = if a.start < b.start { (a, b) } else { (b, a) };
    match rule {
        AdjacencyRule::AllowAbut => lower.end() > upper.start,
        AdjacencyRule::RequireGap => lower.end() >= upper.start,
    }
}

/// Check `new` against every live block.
///
/// # Errors
///
/// `OverlapDetected` naming the first live block `new` conflicts with.
pub fn check_no_overlap(live: &[AllocatedBlock], new: BlockRange, rule: AdjacencyRule) -> Result<(), HarnessError> {
    match live.iter().find(|b| ranges_conflict(b.range(), new, rule)) {
        Some(existing) => Err(HarnessError::OverlapDetected {
            existing: existing.range(),
            new,
        }),
        None => Ok(()),
    }
}

/// A block owned by one worker from allocation to deallocation.
#[derive(Debug)]
pub struct AllocatedBlock {
    pub ptr: NonNull<u8>,
    pub size: usize,
    pub pattern: FillPattern,
}

impl AllocatedBlock {
    #[inline]
    #[must_use]
    pub fn range(&self) -> BlockRange {
        BlockRange {
            start: self.ptr.addr().get(),
            len: self.size,
        }
    }

    /// Write the fill pattern over the whole block.
    ///
    /// # Safety
    /// `ptr` must be valid for writes of `size` bytes.
    pub unsafe fn fill(&self) {
        if self.size == 0 {
            return;
        }
        // Safety: guaranteed by the caller.
        let bytes = unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.size) };
        self.pattern.fill(bytes);
    }

    /// Compare the block against its fill pattern.
    ///
    /// # Safety
    /// `ptr` must be valid for reads of `size` bytes.
    ///
    /// # Errors
    ///
    /// `CorruptionDetected` at the first mismatching byte.
    pub unsafe fn verify(&self) -> Result<(), HarnessError> {
        if self.size == 0 {
            return Ok(());
        }
        // Safety: guaranteed by the caller.
        let bytes = unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.size) };
        match self.pattern.first_mismatch(bytes) {
            Some((offset, expected, found)) => Err(HarnessError::CorruptionDetected {
                block: self.range(),
                offset,
                expected,
                found,
            }),
            None => Ok(()),
        }
    }
}

/// Live blocks of one worker loop, in insertion order.
///
/// Capacity is fixed at construction; exceeding it is a configuration error.
pub struct LiveBlockTable {
    blocks: Vec<AllocatedBlock>,
    capacity: usize,
    rule: AdjacencyRule,
}

impl LiveBlockTable {
    #[must_use]
    pub fn new(capacity: usize, rule: AdjacencyRule) -> Self {
        Self {
            blocks: Vec::with_capacity(capacity),
            capacity,
            rule,
        }
    }

    /// Append a block.
    ///
    /// # Errors
    ///
    /// `CapacityExceeded` when the table is full.
    pub fn record(&mut self, block: AllocatedBlock) -> Result<(), HarnessError> {
        if self.blocks.len() >= self.capacity {
            return Err(HarnessError::CapacityExceeded {
                requested: self.blocks.len() + 1,
                capacity: self.capacity,
            });
        }
        self.blocks.push(block);
        Ok(())
    }

    /// Check a prospective block against every recorded one.
    ///
    /// # Errors
    ///
    /// `OverlapDetected` with both ranges.
    pub fn check_no_overlap(&self, new: BlockRange) -> Result<(), HarnessError> {
        check_no_overlap(&self.blocks, new, self.rule)
    }

    pub fn clear(&mut self) {
        self.blocks.clear();
    }

    pub fn iter(&self) -> std::slice::Iter<'_, AllocatedBlock> {
        self.blocks.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl<'a> IntoIterator for &'a LiveBlockTable {
    type Item = &'a AllocatedBlock;
    type IntoIter = std::slice::Iter<'a, AllocatedBlock>;

    fn into_iter(self) -> Self::IntoIter {
        self.blocks.iter()
    }
}
