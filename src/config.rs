//! Harness configuration.
//!
//! Everything here is plain data with a `Default`; the binary maps its
//! command line onto it and `validate()` runs before any backend is touched.

use crate::backend::{BackendKind, PoolConfig};
use crate::error::HarnessError;
use crate::harness::bench::BenchmarkMatrix;
use crate::harness::block_table::AdjacencyRule;
use crate::harness::worker_pool::default_worker_count;
use crate::harness::workload::{MIXED_PALETTE, THREADED_PALETTE, WorkloadSpec};

bitflags::bitflags! {
    /// Phases run against every backend, in this order.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct Phases: u8 {
        /// Single-threaded validation suite.
        const VALIDATION = 1 << 0;
        /// Single-threaded throughput matrix.
        const BENCHMARK = 1 << 1;
        /// Multi-threaded stress run.
        const THREADED = 1 << 2;
    }
}

impl Default for Phases {
    fn default() -> Self {
        Phases::all()
    }
}

/// Loop and pass counts of the single-threaded validation suite.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ValidationSuite {
    pub fixed_loops: usize,
    pub fixed_passes: usize,
    pub mixed_loops: usize,
    pub mixed_passes: usize,
    pub batch_loops: usize,
    pub batch_passes: usize,
}

impl Default for ValidationSuite {
    fn default() -> Self {
        Self {
            fixed_loops: 8,
            fixed_passes: 8142,
            mixed_loops: 16,
            mixed_passes: 1024,
            batch_loops: 32,
            batch_passes: 1024,
        }
    }
}

impl ValidationSuite {
    /// Full-length suite: 64 / 64 / 128 loops.
    #[must_use]
    pub fn original() -> Self {
        Self {
            fixed_loops: 64,
            mixed_loops: 64,
            batch_loops: 128,
            ..Self::default()
        }
    }

    /// The three phases as named workloads.
    #[must_use]
    pub fn specs(&self, adjacency: AdjacencyRule) -> [(&'static str, WorkloadSpec); 3] {
        let with_rule = |mut spec: WorkloadSpec| {
            spec.adjacency = adjacency;
            spec
        };
        [
            (
                "fixed-size validation",
                with_rule(WorkloadSpec::constant(500, self.fixed_loops, self.fixed_passes)),
            ),
            (
                "mixed-size validation",
                with_rule(WorkloadSpec::cycling(&MIXED_PALETTE, self.mixed_loops, self.mixed_passes)),
            ),
            (
                "batch validation",
                with_rule(WorkloadSpec::constant(500, self.batch_loops, self.batch_passes)),
            ),
        ]
    }
}

#[derive(Clone, Debug)]
pub struct HarnessConfig {
    /// Backends to run, in report order. The first is the benchmark baseline.
    pub backends: Vec<BackendKind>,
    pub pool: PoolConfig,
    pub phases: Phases,
    pub validation: ValidationSuite,
    pub matrix: BenchmarkMatrix,
    /// Workload of each threaded worker. Its `adjacency` is replaced by the
    /// per-backend rule below.
    pub threaded: WorkloadSpec,
    /// Overlap rule for every phase. `None` picks the strictest rule each
    /// backend can satisfy ([`AdjacencyRule::for_backend`]).
    pub adjacency: Option<AdjacencyRule>,
    pub workers: usize,
    /// Seed for worker jitter. `None` draws from the OS.
    pub seed: Option<u64>,
    /// Run the threaded workload on the calling thread before the pool.
    pub threaded_warmup: bool,
    /// Call `trim()` on the backend after each phase.
    pub trim_between_phases: bool,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            backends: vec![BackendKind::System, BackendKind::Pool],
            pool: PoolConfig::default(),
            phases: Phases::default(),
            validation: ValidationSuite::default(),
            matrix: BenchmarkMatrix::default(),
            threaded: WorkloadSpec::threaded(512, 1024, &THREADED_PALETTE),
            adjacency: None,
            workers: default_worker_count(),
            seed: None,
            threaded_warmup: true,
            trim_between_phases: false,
        }
    }
}

impl HarnessConfig {
    /// Check every workload the configuration implies.
    ///
    /// # Errors
    ///
    /// `CapacityExceeded` or `InvalidWorkload`, before anything is allocated.
    pub fn validate(&self) -> Result<(), HarnessError> {
        if self.backends.is_empty() {
            return Err(HarnessError::InvalidWorkload("no backend selected".to_string()));
        }
        if self.phases.contains(Phases::VALIDATION) {
            for (_, spec) in self.validation.specs(AdjacencyRule::default()) {
                spec.validate()?;
            }
        }
        if self.phases.contains(Phases::BENCHMARK) {
            self.matrix.validate()?;
        }
        if self.phases.contains(Phases::THREADED) {
            self.threaded.validate()?;
            if self.workers == 0 {
                return Err(HarnessError::InvalidWorkload("worker count must be at least 1".to_string()));
            }
        }
        Ok(())
    }
}
