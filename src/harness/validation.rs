//! Single-threaded validation: workloads run as worker 0 on the calling
//! thread, with the single-threaded live-block capacity.

use std::time::Instant;

use crate::backend::AllocatorHandle;
use crate::config::ValidationSuite;
use crate::error::HarnessError;
use crate::harness::PhaseReport;
use crate::harness::block_table::AdjacencyRule;
use crate::harness::compare::StatisticsComparator;
use crate::harness::worker::Worker;
use crate::harness::workload::WorkloadSpec;

/// Run `spec` once on the calling thread.
pub fn run_single_threaded(allocator: &dyn AllocatorHandle, name: &str, spec: &WorkloadSpec) -> PhaseReport {
    if let Err(error) = spec.validate() {
        return PhaseReport::rejected(name, error);
    }
    let cmp = StatisticsComparator::begin(allocator, name);
    let start = Instant::now();
    let result = Worker::new(0, allocator, spec, 0).run_catching();
    let elapsed = start.elapsed();
    let stats = cmp.finish(result.passed());

    let error = (!result.passed()).then(|| HarnessError::PoolFailed {
        first: Box::new(result),
        failed: 1,
        total: 1,
    });
    PhaseReport {
        name: name.to_string(),
        elapsed,
        stats: Some(stats),
        error,
    }
}

/// Fixed-size, mixed-size and batch phases in order. Every phase runs even if
/// an earlier one failed.
pub fn run_suite(allocator: &dyn AllocatorHandle, suite: &ValidationSuite, adjacency: AdjacencyRule) -> Vec<PhaseReport> {
    suite
        .specs(adjacency)
        .iter()
        .map(|(name, spec)| {
            let report = run_single_threaded(allocator, name, spec);
            log::info!("{report}");
            report
        })
        .collect()
}
