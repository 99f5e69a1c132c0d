//! Workload description and the deterministic size sequence derived from it.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::backend::{AllocFlags, effective_align};
use crate::error::HarnessError;
use crate::harness::block_table::AdjacencyRule;

/// Live-block capacity of a threaded worker.
pub const MAX_THREADED_PASSES: usize = 4096;

/// Live-block capacity of a single-threaded run.
pub const MAX_SINGLE_THREADED_PASSES: usize = 8192;

/// Longest accepted size palette.
pub const MAX_PALETTE: usize = 32;

/// Largest accepted palette entry. Schedules add at most
/// `MAX_SINGLE_THREADED_PASSES` on top, so no requested size can overflow.
pub const MAX_BLOCK_SIZE: usize = 1 << 30;

/// Worker startup jitter is drawn from `[0, MAX_JITTER)` milliseconds.
pub const MAX_JITTER: u64 = 10;

/// Default palette of the threaded stress phase.
pub const THREADED_PALETTE: [usize; 7] = [19, 249, 797, 3, 79, 34, 389];

/// Palette of the mixed-size single-threaded validation phase.
pub const MIXED_PALETTE: [usize; 7] = [473, 39, 195, 24, 73, 376, 245];

/// How a `(loop, pass)` pair maps onto the palette.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, clap::ValueEnum)]
pub enum SizeSchedule {
    /// `palette[(loop + pass + jitter) % n] + loop % 1024`
    #[default]
    Rotating,
    /// `palette[pass % n] + pass`
    Cycling,
    /// `palette[0]`
    Constant,
}

/// Immutable description of the work a worker performs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkloadSpec {
    pub loop_count: usize,
    pub pass_count: usize,
    pub size_palette: Vec<usize>,
    /// Only the first `num_sizes_active` palette entries are used.
    pub num_sizes_active: usize,
    pub schedule: SizeSchedule,
    /// 0 = backend default.
    pub align: usize,
    pub flags: AllocFlags,
    pub adjacency: AdjacencyRule,
    /// Live-block table capacity; `pass_count` may not exceed it.
    pub capacity: usize,
}

impl WorkloadSpec {
    /// Rotating sizes over `palette`, sized for a threaded worker.
    #[must_use]
    pub fn threaded(loop_count: usize, pass_count: usize, palette: &[usize]) -> Self {
        Self {
            loop_count,
            pass_count,
            size_palette: palette.to_vec(),
            num_sizes_active: palette.len(),
            schedule: SizeSchedule::Rotating,
            align: 0,
            flags: AllocFlags::PERSISTENT,
            adjacency: AdjacencyRule::default(),
            capacity: MAX_THREADED_PASSES,
        }
    }

    /// Every block `size` bytes, sized for a single-threaded run.
    #[must_use]
    pub fn constant(size: usize, loop_count: usize, pass_count: usize) -> Self {
        Self {
            schedule: SizeSchedule::Constant,
            capacity: MAX_SINGLE_THREADED_PASSES,
            ..Self::threaded(loop_count, pass_count, &[size])
        }
    }

    /// Sizes cycling through `palette` by pass, sized for a single-threaded run.
    #[must_use]
    pub fn cycling(palette: &[usize], loop_count: usize, pass_count: usize) -> Self {
        Self {
            schedule: SizeSchedule::Cycling,
            capacity: MAX_SINGLE_THREADED_PASSES,
            ..Self::threaded(loop_count, pass_count, palette)
        }
    }

    /// Check the workload before any allocator is touched.
    ///
    /// # Errors
    ///
    /// `CapacityExceeded` if `pass_count` does not fit the live-block table,
    /// `InvalidWorkload` for any other inconsistency.
    pub fn validate(&self) -> Result<(), HarnessError> {
        if self.capacity > MAX_SINGLE_THREADED_PASSES {
            return Err(HarnessError::InvalidWorkload(format!(
                "live-block capacity {} exceeds the maximum of {MAX_SINGLE_THREADED_PASSES}",
                self.capacity
            )));
        }
        if self.pass_count > self.capacity {
            return Err(HarnessError::CapacityExceeded {
                requested: self.pass_count,
                capacity: self.capacity,
            });
        }
        if self.size_palette.is_empty() || self.size_palette.len() > MAX_PALETTE {
            return Err(HarnessError::InvalidWorkload(format!(
                "size palette must hold 1..={MAX_PALETTE} sizes, got {}",
                self.size_palette.len()
            )));
        }
        if let Some(&size) = self.size_palette.iter().find(|&&size| size > MAX_BLOCK_SIZE) {
            return Err(HarnessError::InvalidWorkload(format!(
                "palette size {size} exceeds the maximum block size of {MAX_BLOCK_SIZE}"
            )));
        }
        if self.num_sizes_active == 0 || self.num_sizes_active > self.size_palette.len() {
            return Err(HarnessError::InvalidWorkload(format!(
                "num_sizes_active {} out of range 1..={}",
                self.num_sizes_active,
                self.size_palette.len()
            )));
        }
        if effective_align(self.align).is_none() {
            return Err(HarnessError::InvalidWorkload(format!(
                "alignment {} is not a supported power of two",
                self.align
            )));
        }
        Ok(())
    }

    /// Same spec with every palette entry replaced by `size`.
    #[must_use]
    pub fn with_uniform_size(&self, size: usize) -> Self {
        Self {
            size_palette: vec![size; self.size_palette.len()],
            ..self.clone()
        }
    }
}

/// Pure size sequence of one worker: `(spec, jitter)` fully determines it.
#[derive(Clone, Copy, Debug)]
pub struct WorkloadGenerator<'a> {
    spec: &'a WorkloadSpec,
    jitter: usize,
}

impl<'a> WorkloadGenerator<'a> {
    #[must_use]
    pub fn new(spec: &'a WorkloadSpec, jitter: usize) -> Self {
        Self { spec, jitter }
    }

    /// Requested size for `(loop_index, pass)`.
    ///
    /// Panics if the workload's palette is shorter than `num_sizes_active`;
    /// `WorkloadSpec::validate` rules that out.
    #[inline]
    #[must_use]
    pub fn size(&self, loop_index: usize, pass: usize) -> usize {
        let palette = &self.spec.size_palette[..self.spec.num_sizes_active];
        match self.spec.schedule {
            SizeSchedule::Rotating => {
                let idx = loop_index.wrapping_add(pass).wrapping_add(self.jitter) % palette.len();
                palette[idx] + loop_index % 1024
            }
            SizeSchedule::Cycling => palette[pass % palette.len()] + pass,
            SizeSchedule::Constant => palette[0],
        }
    }

    /// Sizes of every pass of one loop.
    pub fn sizes(&self, loop_index: usize) -> impl Iterator<Item = usize> + '_ {
        (0..self.spec.pass_count).map(move |pass| self.size(loop_index, pass))
    }
}

/// Deterministic byte pattern of one block, salted by owner and pass so a
/// block carrying another block's bytes is caught too.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FillPattern {
    salt: u32,
}

impl FillPattern {
    #[must_use]
    pub fn new(worker_id: usize, pass: usize) -> Self {
        let salt = (worker_id as u32).wrapping_mul(0x9E37_79B1) ^ (pass as u32).wrapping_mul(0x85EB_CA6B);
        Self { salt }
    }

    #[inline]
    #[must_use]
    pub fn byte_at(&self, offset: usize) -> u8 {
        let x = self.salt.wrapping_add(offset as u32).wrapping_mul(0x2545_F491);
        (x >> 24) as u8
    }

    pub fn fill(&self, bytes: &mut [u8]) {
        for (offset, b) in bytes.iter_mut().enumerate() {
            *b = self.byte_at(offset);
        }
    }

    /// First `(offset, expected, found)` that differs from the pattern.
    #[must_use]
    pub fn first_mismatch(&self, bytes: &[u8]) -> Option<(usize, u8, u8)> {
        bytes
            .iter()
            .enumerate()
            .find_map(|(offset, &found)| {
                let expected = self.byte_at(offset);
                (found != expected).then_some((offset, expected, found))
            })
    }
}

/// Random source of one worker. A fixed harness seed makes every worker's
/// jitter, and so its size sequence, reproducible.
#[must_use]
pub fn worker_rng(seed: Option<u64>, worker_id: usize) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed ^ (worker_id as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15)),
        None => StdRng::from_entropy(),
    }
}

/// Startup jitter in `[0, MAX_JITTER)` milliseconds.
pub fn draw_jitter(rng: &mut impl Rng) -> u64 {
    rng.gen_range(0..MAX_JITTER)
}

/// Jitter as a sleep duration.
#[must_use]
pub fn jitter_delay(jitter: u64) -> Duration {
    Duration::from_millis(jitter)
}
