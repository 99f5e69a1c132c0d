//! One logical worker: `loop_count` rounds of allocate, verify, release.

use std::any::Any;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};

use crate::backend::{AllocFlags, AllocatorHandle, DEFAULT_ALIGN, effective_align};
use crate::error::HarnessError;
use crate::harness::block_table::{AllocatedBlock, LiveBlockTable};
use crate::harness::workload::{FillPattern, WorkloadGenerator, WorkloadSpec};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerState {
    Allocating,
    Verifying,
    Releasing,
    Done,
    Failed,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkerState::Allocating => "allocating",
            WorkerState::Verifying => "verifying",
            WorkerState::Releasing => "releasing",
            WorkerState::Done => "done",
            WorkerState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Where and how a worker failed.
#[derive(Debug)]
pub struct WorkerFailure {
    pub loop_index: usize,
    pub pass: usize,
    /// State the worker was in when the error surfaced.
    pub state: WorkerState,
    pub error: HarnessError,
}

/// Outcome of one worker.
#[derive(Debug)]
pub struct WorkerResult {
    pub worker_id: usize,
    pub jitter: u64,
    /// Successful `allocate` calls.
    pub allocations: u64,
    pub loops_completed: usize,
    pub failure: Option<WorkerFailure>,
}

impl WorkerResult {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.failure.is_none()
    }

    /// Result of a worker that never produced one (it panicked or never
    /// got past the start gate).
    #[must_use]
    pub fn panicked(worker_id: usize, jitter: u64, message: String) -> Self {
        Self {
            worker_id,
            jitter,
            allocations: 0,
            loops_completed: 0,
            failure: Some(WorkerFailure {
                loop_index: 0,
                pass: 0,
                state: WorkerState::Failed,
                error: HarnessError::WorkerPanicked {
                    worker: worker_id,
                    message,
                },
            }),
        }
    }
}

impl fmt::Display for WorkerResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.failure {
            None => write!(
                f,
                "worker {} passed ({} loops, {} allocations, jitter {})",
                self.worker_id, self.loops_completed, self.allocations, self.jitter
            ),
            Some(WorkerFailure {
                error: error @ HarnessError::WorkerPanicked { .. },
                ..
            }) => write!(f, "{error}"),
            Some(failure) => write!(
                f,
                "worker {} failed while {} (loop {}, pass {}, jitter {}): {}",
                self.worker_id, failure.state, failure.loop_index, failure.pass, self.jitter, failure.error
            ),
        }
    }
}

/// Extract the message of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

pub struct Worker<'a> {
    id: usize,
    allocator: &'a dyn AllocatorHandle,
    spec: &'a WorkloadSpec,
    jitter: u64,
    table: LiveBlockTable,
    state: WorkerState,
    allocations: u64,
}

impl<'a> Worker<'a> {
    /// `spec` must already be validated.
    #[must_use]
    pub fn new(id: usize, allocator: &'a dyn AllocatorHandle, spec: &'a WorkloadSpec, jitter: u64) -> Self {
        Self {
            id,
            allocator,
            spec,
            jitter,
            table: LiveBlockTable::new(spec.capacity, spec.adjacency),
            state: WorkerState::Allocating,
            allocations: 0,
        }
    }

    #[must_use]
    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Run every loop. Stops at the first failure.
    ///
    /// A failed worker abandons its live blocks rather than handing possibly
    /// overlapping memory back to a backend that is already misbehaving.
    #[must_use]
    pub fn run(mut self) -> WorkerResult {
        let spec = self.spec;
        let generator = WorkloadGenerator::new(spec, usize::try_from(self.jitter).unwrap_or(0));
        log::trace!("worker {} starting (jitter {})", self.id, self.jitter);

        for loop_index in 0..spec.loop_count {
            if let Err((pass, error)) = self.run_loop(&generator, loop_index) {
                let failure = WorkerFailure {
                    loop_index,
                    pass,
                    state: self.state,
                    error,
                };
                self.state = WorkerState::Failed;
                if !self.table.is_empty() {
                    log::debug!("worker {} abandons {} live block(s)", self.id, self.table.len());
                }
                let result = WorkerResult {
                    worker_id: self.id,
                    jitter: self.jitter,
                    allocations: self.allocations,
                    loops_completed: loop_index,
                    failure: Some(failure),
                };
                log::error!("{result}");
                return result;
            }
        }

        self.state = WorkerState::Done;
        log::trace!("worker {} done ({} allocations)", self.id, self.allocations);
        WorkerResult {
            worker_id: self.id,
            jitter: self.jitter,
            allocations: self.allocations,
            loops_completed: spec.loop_count,
            failure: None,
        }
    }

    /// [`run`](Self::run), turning a panic inside the backend into a failed
    /// result.
    #[must_use]
    pub fn run_catching(self) -> WorkerResult {
        let (id, jitter) = (self.id, self.jitter);
        match catch_unwind(AssertUnwindSafe(|| self.run())) {
            Ok(result) => result,
            Err(payload) => {
                let result = WorkerResult::panicked(id, jitter, panic_message(payload.as_ref()));
                log::error!("{result}");
                result
            }
        }
    }

    fn run_loop(&mut self, generator: &WorkloadGenerator<'_>, loop_index: usize) -> Result<(), (usize, HarnessError)> {
        let spec = self.spec;
        let align = effective_align(spec.align).unwrap_or(DEFAULT_ALIGN);

        self.state = WorkerState::Allocating;
        for pass in 0..spec.pass_count {
            self.allocate_one(generator.size(loop_index, pass), align, pass)
                .map_err(|e| (pass, e))?;
        }

        self.state = WorkerState::Verifying;
        for (pass, block) in self.table.iter().enumerate() {
            // Safety: the block is live and `size` bytes long.
            unsafe { block.verify() }.map_err(|e| (pass, e))?;
        }

        self.state = WorkerState::Releasing;
        for block in &self.table {
            // Safety: allocated from this backend in this loop, freed once.
            unsafe { self.allocator.deallocate(block.ptr) };
        }
        self.table.clear();
        Ok(())
    }

    fn allocate_one(&mut self, size: usize, align: usize, pass: usize) -> Result<(), HarnessError> {
        let spec = self.spec;
        let ptr = self
            .allocator
            .allocate(self.id as u64, size, spec.align, spec.flags)
            .ok_or(HarnessError::AllocationFailed { size, align })?;
        self.allocations += 1;

        if !ptr.addr().get().is_multiple_of(align) {
            return Err(HarnessError::MisalignedAllocation {
                address: ptr.addr().get(),
                align,
            });
        }

        let block = AllocatedBlock {
            ptr,
            size,
            pattern: FillPattern::new(self.id, pass),
        };

        if spec.flags.contains(AllocFlags::ZEROED) && size != 0 {
            // Safety: the block was just allocated with `size` bytes.
            let bytes = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), size) };
            if let Some(offset) = bytes.iter().position(|&b| b != 0) {
                return Err(HarnessError::CorruptionDetected {
                    block: block.range(),
                    offset,
                    expected: 0,
                    found: bytes[offset],
                });
            }
        }

        // Safety: the block was just allocated with `size` bytes.
        unsafe { block.fill() };
        self.table.check_no_overlap(block.range())?;
        self.table.record(block)
    }
}
