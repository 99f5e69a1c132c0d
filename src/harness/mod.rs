//! The harness: runs every configured phase against every backend.
//!
//! Per backend the lifecycle is `initialize`, validation suite, benchmark,
//! threaded warm-up and stress run, `shutdown`. Each phase is wrapped in a
//! [`StatisticsComparator`]. A failing phase is recorded and the remaining
//! phases still run, so one report carries every defect found.

pub mod bench;
pub mod block_table;
pub mod compare;
pub mod validation;
pub mod worker;
pub mod worker_pool;
pub mod workload;

#[cfg(all(test, not(loom)))]
mod integration;

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::{Duration, Instant};

use crate::backend::AllocatorHandle;
use crate::config::{HarnessConfig, Phases};
use crate::error::HarnessError;
use crate::sync::Arc;

use bench::{BenchComparison, BenchReport, BenchmarkRunner};
use block_table::AdjacencyRule;
use compare::{LeakSuspected, PhaseStats, StatisticsComparator, log_stats};
use worker::{Worker, panic_message};
use worker_pool::WorkerPool;
use workload::WorkloadSpec;

/// Outcome of one phase on one backend.
#[derive(Debug)]
pub struct PhaseReport {
    pub name: String,
    pub elapsed: Duration,
    /// `None` if the phase was rejected before running.
    pub stats: Option<PhaseStats>,
    pub error: Option<HarnessError>,
}

impl PhaseReport {
    pub(crate) fn rejected(name: &str, error: HarnessError) -> Self {
        Self {
            name: name.to_string(),
            elapsed: Duration::ZERO,
            stats: None,
            error: Some(error),
        }
    }

    #[must_use]
    pub fn passed(&self) -> bool {
        self.error.is_none()
    }

    #[must_use]
    pub fn leak(&self) -> Option<&LeakSuspected> {
        self.stats.as_ref().and_then(|s| s.leak.as_ref())
    }
}

impl fmt::Display for PhaseReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.error {
            None => write!(f, "{}: passed in {:.3}s", self.name, self.elapsed.as_secs_f64()),
            Some(error) => write!(f, "{}: FAILED: {error}", self.name),
        }
    }
}

/// Everything that happened to one backend.
#[derive(Debug)]
pub struct BackendReport {
    pub backend: &'static str,
    /// Set if the backend could not be brought up; no phase ran then.
    pub error: Option<HarnessError>,
    pub phases: Vec<PhaseReport>,
    pub bench: Option<BenchReport>,
}

impl BackendReport {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.error.is_none() && self.phases.iter().all(PhaseReport::passed)
    }

    pub fn leaks(&self) -> impl Iterator<Item = &LeakSuspected> {
        self.phases.iter().filter_map(PhaseReport::leak)
    }
}

/// Final report of a harness run.
#[derive(Debug)]
pub struct HarnessReport {
    pub backends: Vec<BackendReport>,
    /// Each benchmarked backend against the first one.
    pub comparisons: Vec<BenchComparison>,
}

impl HarnessReport {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.backends.iter().all(BackendReport::passed)
    }

    /// Log the per-backend summary.
    pub fn log_summary(&self) {
        for backend in &self.backends {
            let verdict = if backend.passed() { "PASS" } else { "FAIL" };
            log::info!("[{verdict}] {} backend", backend.backend);
            if let Some(error) = &backend.error {
                log::error!("  {error}");
            }
            for phase in &backend.phases {
                if phase.passed() {
                    log::info!("  {phase}");
                } else {
                    log::error!("  {phase}");
                }
            }
            if let Some(bench) = &backend.bench {
                log::info!("  benchmark {bench}");
            }
            for leak in backend.leaks() {
                log::warn!("  {leak}");
            }
        }
        for cmp in &self.comparisons {
            log::info!("allocation time ratio {cmp}");
        }
    }
}

pub struct Harness {
    config: HarnessConfig,
    backends: Vec<Arc<dyn AllocatorHandle>>,
}

impl Harness {
    /// Validate `config` and build its backends.
    ///
    /// # Errors
    ///
    /// Configuration errors; nothing has been allocated when they occur.
    pub fn new(config: HarnessConfig) -> Result<Self, HarnessError> {
        let backends = config.backends.iter().map(|kind| kind.create(&config.pool)).collect();
        Self::with_backends(config, backends)
    }

    /// Use caller-supplied backends instead of `config.backends`.
    ///
    /// # Errors
    ///
    /// Configuration errors; nothing has been allocated when they occur.
    pub fn with_backends(config: HarnessConfig, backends: Vec<Arc<dyn AllocatorHandle>>) -> Result<Self, HarnessError> {
        config.validate()?;
        if backends.is_empty() {
            return Err(HarnessError::InvalidWorkload("no backend selected".to_string()));
        }
        Ok(Self { config, backends })
    }

    #[must_use]
    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Run every phase against every backend.
    #[must_use]
    pub fn run(&self) -> HarnessReport {
        let backends: Vec<BackendReport> = self.backends.iter().map(|b| self.run_backend(b)).collect();

        let mut comparisons = Vec::new();
        let mut benches = backends.iter().filter_map(|b| b.bench.as_ref());
        if let Some(baseline) = benches.next() {
            comparisons.extend(benches.filter_map(|candidate| BenchComparison::new(baseline, candidate)));
        }

        let report = HarnessReport { backends, comparisons };
        report.log_summary();
        report
    }

    fn run_backend(&self, backend: &Arc<dyn AllocatorHandle>) -> BackendReport {
        let name = backend.name();
        log::info!("=== {name} backend ===");

        if let Err(source) = backend.initialize() {
            let error = HarnessError::Backend { backend: name, source };
            log::error!("{error}");
            return BackendReport {
                backend: name,
                error: Some(error),
                phases: Vec::new(),
                bench: None,
            };
        }
        log_stats(name, "INITIALIZE", &backend.statistics());

        let config = &self.config;
        let adjacency = config
            .adjacency
            .unwrap_or_else(|| AdjacencyRule::for_backend(backend.as_ref()));
        log::debug!("{name} backend: overlap rule {adjacency:?}");
        let threaded = WorkloadSpec {
            adjacency,
            ..config.threaded.clone()
        };
        let mut phases = Vec::new();
        let mut bench = None;

        if config.phases.contains(Phases::VALIDATION) {
            phases.extend(validation::run_suite(backend.as_ref(), &config.validation, adjacency));
            self.after_phase(backend.as_ref());
        }

        if config.phases.contains(Phases::BENCHMARK) {
            let (report, result) = self.run_benchmark(backend.as_ref());
            phases.push(report);
            bench = result;
            self.after_phase(backend.as_ref());
        }

        if config.phases.contains(Phases::THREADED) {
            if config.threaded_warmup {
                phases.push(Self::run_threaded_warmup(backend.as_ref(), &threaded));
            }
            phases.push(self.run_threaded(backend, threaded));
            self.after_phase(backend.as_ref());
        }

        log_stats(name, "TEST", &backend.statistics());
        backend.shutdown();
        log_stats(name, "SHUTDOWN", &backend.statistics());

        BackendReport {
            backend: name,
            error: None,
            phases,
            bench,
        }
    }

    fn after_phase(&self, backend: &dyn AllocatorHandle) {
        if self.config.trim_between_phases {
            backend.trim();
        }
    }

    fn run_benchmark(&self, backend: &dyn AllocatorHandle) -> (PhaseReport, Option<BenchReport>) {
        let cmp = StatisticsComparator::begin(backend, "benchmark");
        let start = Instant::now();
        let outcome = catch_unwind(AssertUnwindSafe(|| BenchmarkRunner::new(self.config.matrix).run(backend)));
        let elapsed = start.elapsed();

        let outcome = match outcome {
            Ok(result) => result,
            Err(payload) => Err(HarnessError::WorkerPanicked {
                worker: 0,
                message: panic_message(payload.as_ref()),
            }),
        };
        match outcome {
            Ok(bench) => (
                PhaseReport {
                    name: "benchmark".to_string(),
                    elapsed,
                    stats: Some(cmp.finish(true)),
                    error: None,
                },
                Some(bench),
            ),
            Err(error) => {
                log::error!("benchmark on {}: {error}", backend.name());
                (
                    PhaseReport {
                        name: "benchmark".to_string(),
                        elapsed,
                        stats: Some(cmp.finish(false)),
                        error: Some(error),
                    },
                    None,
                )
            }
        }
    }

    /// The threaded workload on the calling thread: once as configured, once
    /// with every size set to 500 bytes.
    fn run_threaded_warmup(backend: &dyn AllocatorHandle, spec: &WorkloadSpec) -> PhaseReport {
        let uniform = spec.with_uniform_size(500);
        let cmp = StatisticsComparator::begin(backend, "threaded warm-up");
        let start = Instant::now();

        let mut error = None;
        for spec in [spec, &uniform] {
            let result = Worker::new(0, backend, spec, 0).run_catching();
            if !result.passed() {
                error = Some(HarnessError::PoolFailed {
                    first: Box::new(result),
                    failed: 1,
                    total: 1,
                });
                break;
            }
        }

        let report = PhaseReport {
            name: "threaded warm-up".to_string(),
            elapsed: start.elapsed(),
            stats: Some(cmp.finish(error.is_none())),
            error,
        };
        log::info!("{report}");
        report
    }

    fn run_threaded(&self, backend: &Arc<dyn AllocatorHandle>, spec: WorkloadSpec) -> PhaseReport {
        let config = &self.config;
        let pool = WorkerPool::new(Arc::clone(backend), spec, config.workers).with_seed(config.seed);
        let name = format!("threaded ({} workers)", pool.workers());
        let cmp = StatisticsComparator::begin(backend.as_ref(), name.clone());
        let start = Instant::now();

        let outcome = pool.run();
        let elapsed = outcome.as_ref().map_or_else(|_| start.elapsed(), |r| r.elapsed);
        let (stats, error) = match outcome {
            Ok(report) => {
                log::debug!("threaded phase: {} allocations", report.allocations());
                (cmp.finish(true), None)
            }
            Err(error) => (cmp.finish(false), Some(error)),
        };

        let report = PhaseReport {
            name,
            elapsed,
            stats: Some(stats),
            error,
        };
        log::info!("{report}");
        report
    }
}
