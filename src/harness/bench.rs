//! Single-threaded throughput measurement over a fixed allocation matrix.
//!
//! The runner only measures. Whether a number is a regression is up to
//! whoever reads the report.

use std::fmt;
use std::ptr::NonNull;
use std::time::{Duration, Instant};

use crate::backend::{AllocFlags, AllocatorHandle};
use crate::error::HarnessError;
use crate::sync::Arc;

/// Time source of a [`BenchmarkRunner`].
pub trait Clock: Send + Sync {
    /// Time since an arbitrary fixed origin. Never decreases.
    fn now(&self) -> Duration;
}

/// Wall-clock time from `Instant`.
#[derive(Debug)]
pub struct MonotonicClock(Instant);

impl Default for MonotonicClock {
    fn default() -> Self {
        Self(Instant::now())
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Duration {
        self.0.elapsed()
    }
}

/// `outer x inner` cells; cell `(i, j)` requests `i + j` bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BenchmarkMatrix {
    pub outer: usize,
    pub inner: usize,
    /// Untimed rounds over the first row before measuring.
    pub warmup_loops: usize,
}

impl Default for BenchmarkMatrix {
    fn default() -> Self {
        Self {
            outer: 128,
            inner: 2048,
            warmup_loops: 16,
        }
    }
}

impl BenchmarkMatrix {
    /// The full-size matrix: 512 x 8192 cells after 64 warm-up rounds.
    #[must_use]
    pub fn original() -> Self {
        Self {
            outer: 512,
            inner: 8192,
            warmup_loops: 64,
        }
    }

    /// # Errors
    ///
    /// `InvalidWorkload` if the matrix has no cells or too many to index.
    pub fn validate(&self) -> Result<(), HarnessError> {
        if self.outer == 0 || self.inner == 0 {
            return Err(HarnessError::InvalidWorkload(format!(
                "benchmark matrix {}x{} is empty",
                self.outer, self.inner
            )));
        }
        if self.outer.checked_mul(self.inner).is_none() {
            return Err(HarnessError::InvalidWorkload(format!(
                "benchmark matrix {}x{} overflows",
                self.outer, self.inner
            )));
        }
        Ok(())
    }

    #[must_use]
    pub fn cells(&self) -> usize {
        self.outer.saturating_mul(self.inner)
    }

    #[inline]
    #[must_use]
    pub fn cell_size(outer: usize, inner: usize) -> usize {
        outer + inner
    }
}

#[derive(Clone, Debug)]
pub struct BenchReport {
    pub backend: &'static str,
    pub matrix: BenchmarkMatrix,
    /// Time to allocate every cell.
    pub alloc_elapsed: Duration,
    /// Time to release every cell. Informational.
    pub dealloc_elapsed: Duration,
    pub allocations: usize,
    /// Cells the backend refused.
    pub failed: usize,
}

impl BenchReport {
    #[must_use]
    pub fn ns_per_alloc(&self) -> f64 {
        if self.allocations == 0 {
            return 0.0;
        }
        self.alloc_elapsed.as_secs_f64() * 1e9 / self.allocations as f64
    }
}

impl fmt::Display for BenchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} allocations in {:.3}s ({:.1} ns/alloc), release {:.3}s",
            self.backend,
            self.allocations,
            self.alloc_elapsed.as_secs_f64(),
            self.ns_per_alloc(),
            self.dealloc_elapsed.as_secs_f64(),
        )?;
        if self.failed != 0 {
            write!(f, ", {} failed", self.failed)?;
        }
        Ok(())
    }
}

/// Allocation-time ratio of `candidate` against `baseline`.
#[derive(Clone, Copy, Debug)]
pub struct BenchComparison {
    pub baseline: &'static str,
    pub candidate: &'static str,
    /// `candidate / baseline`; below 1.0 means the candidate is faster.
    pub ratio: f64,
}

impl BenchComparison {
    /// `None` if the baseline took no measurable time.
    #[must_use]
    pub fn new(baseline: &BenchReport, candidate: &BenchReport) -> Option<Self> {
        let base = baseline.alloc_elapsed.as_secs_f64();
        (base > 0.0).then(|| Self {
            baseline: baseline.backend,
            candidate: candidate.backend,
            ratio: candidate.alloc_elapsed.as_secs_f64() / base,
        })
    }
}

impl fmt::Display for BenchComparison {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} / {} = {:.3}", self.candidate, self.baseline, self.ratio)
    }
}

pub struct BenchmarkRunner {
    matrix: BenchmarkMatrix,
    flags: AllocFlags,
    clock: Arc<dyn Clock>,
}

impl BenchmarkRunner {
    #[must_use]
    pub fn new(matrix: BenchmarkMatrix) -> Self {
        Self {
            matrix,
            flags: AllocFlags::PERSISTENT,
            clock: Arc::new(MonotonicClock::default()),
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn with_flags(mut self, flags: AllocFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Warm up, then time allocating and releasing the whole matrix.
    /// The backend must be initialized; refused cells are counted, not fatal.
    ///
    /// # Errors
    ///
    /// `InvalidWorkload` from [`BenchmarkMatrix::validate`], before anything
    /// is allocated.
    pub fn run(&self, allocator: &dyn AllocatorHandle) -> Result<BenchReport, HarnessError> {
        self.matrix.validate()?;
        let BenchmarkMatrix { outer, inner, warmup_loops } = self.matrix;
        let mut cells: Vec<Option<NonNull<u8>>> = vec![None; self.matrix.cells()];

        for _ in 0..warmup_loops {
            for (j, cell) in cells[..inner].iter_mut().enumerate() {
                *cell = allocator.allocate(0, BenchmarkMatrix::cell_size(0, j), 0, self.flags);
            }
            Self::release(allocator, &mut cells[..inner]);
        }

        let start = self.clock.now();
        for i in 0..outer {
            for j in 0..inner {
                cells[i * inner + j] = allocator.allocate(0, BenchmarkMatrix::cell_size(i, j), 0, self.flags);
            }
        }
        let alloc_elapsed = self.clock.now().saturating_sub(start);

        let failed = cells.iter().filter(|c| c.is_none()).count();

        let start = self.clock.now();
        Self::release(allocator, &mut cells);
        let dealloc_elapsed = self.clock.now().saturating_sub(start);

        let report = BenchReport {
            backend: allocator.name(),
            matrix: self.matrix,
            alloc_elapsed,
            dealloc_elapsed,
            allocations: self.matrix.cells() - failed,
            failed,
        };
        log::info!("benchmark {report}");
        Ok(report)
    }

    fn release(allocator: &dyn AllocatorHandle, cells: &mut [Option<NonNull<u8>>]) {
        for cell in cells {
            if let Some(ptr) = cell.take() {
                // Safety: allocated from this backend by `run` and released once.
                unsafe { allocator.deallocate(ptr) };
            }
        }
    }
}
