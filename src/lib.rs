#[cfg(not(target_pointer_width = "64"))]
compile_error!("alloc-harness supports only 64-bit targets.");

pub(crate) mod sync;

pub mod backend;
pub mod config;
pub mod error;
pub mod harness;

#[cfg(loom)]
mod loom_tests;

// backends
pub use backend::{AllocFlags, AllocatorHandle, BackendKind, PoolAllocator, PoolConfig, Stats, SystemAllocator, VmError};

// configuration / errors
pub use config::{HarnessConfig, Phases, ValidationSuite};
pub use error::HarnessError;

// harness
pub use harness::bench::{BenchComparison, BenchReport, BenchmarkMatrix, BenchmarkRunner, Clock, MonotonicClock};
pub use harness::block_table::{AdjacencyRule, AllocatedBlock, BlockRange, LiveBlockTable, check_no_overlap};
pub use harness::compare::{LeakSuspected, PhaseStats, StatisticsComparator, StatsDelta};
pub use harness::worker::{Worker, WorkerFailure, WorkerResult, WorkerState};
pub use harness::worker_pool::{PoolReport, WorkerPool, default_worker_count};
pub use harness::workload::{FillPattern, SizeSchedule, WorkloadGenerator, WorkloadSpec};
pub use harness::{BackendReport, Harness, HarnessReport, PhaseReport};
