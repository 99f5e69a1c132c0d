//! End-to-end scenarios: real backends, plus test doubles that misbehave on
//! purpose so every failure path of the harness is exercised.

use std::collections::HashMap;
use std::ptr::NonNull;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::backend::stats::UsageCounters;
use crate::backend::{
    AllocFlags, AllocatorHandle, BackendKind, PoolAllocator, PoolConfig, Stats, SystemAllocator, VmError,
    effective_align, empty_allocation, is_empty_allocation,
};
use crate::config::{HarnessConfig, Phases, ValidationSuite};
use crate::error::HarnessError;
use crate::harness::bench::BenchmarkMatrix;
use crate::harness::block_table::{AdjacencyRule, BlockRange, ranges_conflict};
use crate::harness::compare::StatisticsComparator;
use crate::harness::validation::run_single_threaded;
use crate::harness::worker::{Worker, WorkerState};
use crate::harness::worker_pool::WorkerPool;
use crate::harness::workload::{SizeSchedule, THREADED_PALETTE, WorkloadGenerator, WorkloadSpec};
use crate::harness::{Harness, PhaseReport};
use crate::sync::atomic::{AtomicU64, Ordering};
use crate::sync::{Arc, Mutex, lock};

// ---------------------------------------------------------------------------
// Test doubles
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Fault {
    None,
    /// Hand out the previous block again.
    ReturnPrevious,
    /// Flip the first byte of the previous block, then allocate normally.
    ScribblePrevious,
    /// Return `None`.
    Refuse,
    Panic,
    /// Never account for frees.
    ForgetFree,
}

struct ArenaState {
    cursor: usize,
    /// Most recent block per hint.
    last: HashMap<u64, NonNull<u8>>,
    sizes: HashMap<usize, usize>,
}

/// Bytes the arena double leaves between blocks unless packed.
const ARENA_GAP: usize = 16;

/// Bump allocator over one fixed buffer with an injectable defect. Blocks sit
/// `ARENA_GAP` bytes apart; a packed arena puts them back to back at 16-byte
/// granularity, so equal 16-multiple sizes abut exactly.
struct ArenaDouble {
    base: NonNull<u8>,
    len: usize,
    packed: bool,
    state: Mutex<ArenaState>,
    fault: Fault,
    /// Call number (1-based, counted over armed calls) at which the fault fires.
    fault_at: u64,
    /// Only calls with this hint are armed.
    only_hint: Option<u64>,
    armed_calls: AtomicU64,
    usage: UsageCounters,
}

// Safety: the buffer is owned by the double; all bookkeeping is under `state`.
unsafe impl Send for ArenaDouble {}
// Safety: as above.
unsafe impl Sync for ArenaDouble {}

const ARENA_LEN: usize = 16 * 1024 * 1024;

impl ArenaDouble {
    fn layout() -> std::alloc::Layout {
        std::alloc::Layout::from_size_align(ARENA_LEN, 4096).unwrap()
    }

    fn new(fault: Fault, fault_at: u64) -> Self {
        // Safety: non-zero layout.
        let base = NonNull::new(unsafe { std::alloc::alloc_zeroed(Self::layout()) }).unwrap();
        Self {
            base,
            len: ARENA_LEN,
            packed: false,
            state: Mutex::new(ArenaState {
                cursor: 0,
                last: HashMap::new(),
                sizes: HashMap::new(),
            }),
            fault,
            fault_at,
            only_hint: None,
            armed_calls: AtomicU64::new(0),
            usage: UsageCounters::default(),
        }
    }

    fn healthy() -> Self {
        Self::new(Fault::None, 0)
    }

    fn only_for(mut self, hint: u64) -> Self {
        self.only_hint = Some(hint);
        self
    }

    fn packed(mut self) -> Self {
        self.packed = true;
        self
    }
}

impl Drop for ArenaDouble {
    fn drop(&mut self) {
        // Safety: allocated in `new` with the same layout.
        unsafe { std::alloc::dealloc(self.base.as_ptr(), Self::layout()) };
    }
}

impl AllocatorHandle for ArenaDouble {
    fn name(&self) -> &'static str {
        "arena-double"
    }

    fn initialize(&self) -> Result<(), VmError> {
        Ok(())
    }

    fn shutdown(&self) {}

    fn allocate(&self, hint: u64, size: usize, align: usize, _flags: AllocFlags) -> Option<NonNull<u8>> {
        let align = effective_align(align)?;
        if size == 0 {
            return Some(empty_allocation(align));
        }
        let armed = self.only_hint.is_none_or(|h| h == hint);
        let fire = armed && self.armed_calls.fetch_add(1, Ordering::Relaxed) + 1 == self.fault_at;

        let mut state = lock(&self.state);
        if fire {
            match self.fault {
                Fault::Refuse => return None,
                Fault::Panic => {
                    drop(state);
                    panic!("arena double: injected failure");
                }
                Fault::ReturnPrevious => {
                    if let Some(&prev) = state.last.get(&hint) {
                        self.usage.on_alloc(size);
                        return Some(prev);
                    }
                }
                Fault::ScribblePrevious => {
                    if let Some(&prev) = state.last.get(&hint) {
                        // Safety: prev is inside our buffer.
                        unsafe { *prev.as_ptr() ^= 0xFF };
                    }
                }
                Fault::None | Fault::ForgetFree => {}
            }
        }

        let start = state.cursor.next_multiple_of(align);
        let end = start.checked_add(size)?;
        if end > self.len {
            return None;
        }
        let gap = if self.packed { 0 } else { ARENA_GAP };
        state.cursor = (end + gap).next_multiple_of(16);
        // Safety: start < len.
        let ptr = unsafe { self.base.add(start) };
        state.last.insert(hint, ptr);
        state.sizes.insert(ptr.addr().get(), size);
        self.usage.on_alloc(size);
        Some(ptr)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>) {
        if is_empty_allocation(ptr) {
            return;
        }
        let mut state = lock(&self.state);
        let size = state.sizes.remove(&ptr.addr().get()).unwrap_or(0);
        if self.fault != Fault::ForgetFree {
            self.usage.on_free(size);
        }
        if state.sizes.is_empty() {
            state.cursor = 0;
            state.last.clear();
        }
    }

    fn statistics(&self) -> Stats {
        self.usage.snapshot(vec![(
            "armed_calls".to_string(),
            usize::try_from(self.armed_calls.load(Ordering::Relaxed)).unwrap_or(usize::MAX),
        )])
    }

    fn packs_blocks(&self) -> bool {
        self.packed
    }
}

/// Records every request and the range it got.
struct Recording<A> {
    inner: A,
    log: Mutex<Vec<BlockRange>>,
}

impl<A: AllocatorHandle> Recording<A> {
    fn new(inner: A) -> Self {
        Self {
            inner,
            log: Mutex::new(Vec::new()),
        }
    }

    fn ranges(&self) -> Vec<BlockRange> {
        lock(&self.log).clone()
    }

    fn sizes(&self) -> Vec<usize> {
        self.ranges().iter().map(|r| r.len).collect()
    }
}

impl<A: AllocatorHandle> AllocatorHandle for Recording<A> {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn initialize(&self) -> Result<(), VmError> {
        self.inner.initialize()
    }

    fn shutdown(&self) {
        self.inner.shutdown();
    }

    fn allocate(&self, hint: u64, size: usize, align: usize, flags: AllocFlags) -> Option<NonNull<u8>> {
        let ptr = self.inner.allocate(hint, size, align, flags)?;
        lock(&self.log).push(BlockRange {
            start: ptr.addr().get(),
            len: size,
        });
        Some(ptr)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>) {
        // Safety: forwarded contract.
        unsafe { self.inner.deallocate(ptr) };
    }

    fn statistics(&self) -> Stats {
        self.inner.statistics()
    }

    fn packs_blocks(&self) -> bool {
        self.inner.packs_blocks()
    }
}

impl AllocatorHandle for &dyn AllocatorHandle {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn initialize(&self) -> Result<(), VmError> {
        (**self).initialize()
    }

    fn shutdown(&self) {
        (**self).shutdown();
    }

    fn allocate(&self, hint: u64, size: usize, align: usize, flags: AllocFlags) -> Option<NonNull<u8>> {
        (**self).allocate(hint, size, align, flags)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>) {
        // Safety: forwarded contract.
        unsafe { (**self).deallocate(ptr) };
    }

    fn statistics(&self) -> Stats {
        (**self).statistics()
    }

    fn packs_blocks(&self) -> bool {
        (**self).packs_blocks()
    }
}

fn system() -> SystemAllocator {
    let a = SystemAllocator::new();
    a.initialize().unwrap();
    a
}

fn pool_config() -> PoolConfig {
    PoolConfig {
        class_reserved_size: 32 * 1024 * 1024,
        ..PoolConfig::default()
    }
}

fn pool() -> PoolAllocator {
    let a = PoolAllocator::with_config(pool_config());
    a.initialize().unwrap();
    a
}

/// `spec` under the strictest overlap rule `backend` can satisfy.
fn spec_for(backend: &dyn AllocatorHandle, spec: &WorkloadSpec) -> WorkloadSpec {
    WorkloadSpec {
        adjacency: AdjacencyRule::for_backend(backend),
        ..spec.clone()
    }
}

fn small_config() -> HarnessConfig {
    HarnessConfig {
        pool: pool_config(),
        validation: ValidationSuite {
            fixed_loops: 1,
            fixed_passes: 2048,
            mixed_loops: 2,
            mixed_passes: 512,
            batch_loops: 2,
            batch_passes: 512,
        },
        matrix: BenchmarkMatrix {
            outer: 16,
            inner: 128,
            warmup_loops: 2,
        },
        threaded: WorkloadSpec::threaded(4, 128, &THREADED_PALETTE),
        workers: 3,
        seed: Some(11),
        ..HarnessConfig::default()
    }
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[test]
fn test_three_fixed_blocks_are_disjoint_and_intact() {
    let a = Recording::new(system());
    let spec = WorkloadSpec::threaded(1, 3, &[500]);
    let result = Worker::new(0, &a, &spec, 7).run();
    assert!(result.passed(), "{result}");

    assert_eq!(a.sizes(), vec![500, 500, 500]);
    let ranges = a.ranges();
    for (i, x) in ranges.iter().enumerate() {
        for y in &ranges[i + 1..] {
            assert!(!ranges_conflict(*x, *y, AdjacencyRule::RequireGap), "{x} vs {y}");
        }
    }
    assert_eq!(a.statistics().allocation_count_current, 0);
}

#[test]
fn test_zero_size_requests_get_the_sentinel() {
    // Loop 0 of the rotating schedule requests zero bytes every other pass.
    let mixed = WorkloadSpec::threaded(3, 8, &[0, 16, 0, 32]);
    let zeros = WorkloadSpec::constant(0, 2, 16);

    let system = system();
    let pool = pool();
    for backend in [&system as &dyn AllocatorHandle, &pool] {
        for spec in [&mixed, &zeros] {
            let rec = Recording::new(backend);
            let spec = &spec_for(backend, spec);
            let result = Worker::new(0, &rec, spec, 0).run();
            assert!(result.passed(), "{:?} on {}: {result}", spec.size_palette, backend.name());
            assert!(rec.sizes().contains(&0));
            for r in rec.ranges().iter().filter(|r| r.len == 0) {
                assert!(is_empty_allocation(NonNull::new(std::ptr::without_provenance_mut(r.start)).unwrap()));
            }
        }
        assert_eq!(backend.statistics().allocation_count_current, 0);
    }
}

#[test]
fn test_four_workers_threaded_palette_pass_on_both_backends() {
    // 100000 loops split over four workers, scaled down by 1000.
    let spec = WorkloadSpec::threaded(100_000 / 4 / 1000, 512, &THREADED_PALETTE);
    for backend in [
        Arc::new(system()) as Arc<dyn AllocatorHandle>,
        Arc::new(pool()) as Arc<dyn AllocatorHandle>,
    ] {
        let report = WorkerPool::new(backend.clone(), spec_for(backend.as_ref(), &spec), 4)
            .with_seed(Some(2024))
            .run()
            .unwrap_or_else(|e| panic!("{} backend: {e}", backend.name()));
        assert_eq!(report.results.len(), 4);
        assert_eq!(report.allocations(), 4 * 25 * 512);
        assert_eq!(backend.statistics().allocation_count_current, 0);
    }
}

#[test]
fn test_benchmark_two_backends_through_harness() {
    let config = HarnessConfig {
        phases: Phases::BENCHMARK,
        ..small_config()
    };
    let report = Harness::new(config).unwrap().run();
    assert!(report.passed());
    assert_eq!(report.backends.len(), 2);
    let benches: Vec<_> = report.backends.iter().filter_map(|b| b.bench.as_ref()).collect();
    assert_eq!(benches.len(), 2);
    assert_eq!(benches[0].backend, "system");
    assert_eq!(benches[1].backend, "pool");
    assert_eq!(benches[0].allocations, benches[1].allocations);
    // Wall-clock ratio. Its run-to-run spread is checked under a virtual
    // clock in the bench tests.
    assert!(report.comparisons.len() <= 1);
}

#[test]
fn test_balanced_phase_zero_delta_and_leak_surfaced() {
    let honest = ArenaDouble::healthy();
    let report = run_single_threaded(&honest, "balanced", &WorkloadSpec::constant(64, 2, 32));
    assert!(report.passed());
    let stats = report.stats.unwrap();
    assert_eq!(stats.delta.allocation_count_current, 0);
    assert!(stats.leak.is_none());

    let forgetful = ArenaDouble::new(Fault::ForgetFree, 0);
    let report = run_single_threaded(&forgetful, "forgetful", &WorkloadSpec::constant(64, 2, 32));
    // A suspected leak is a warning, not a failure.
    assert!(report.passed());
    let leak = report.leak().expect("leak must be surfaced");
    assert_eq!(leak.residual_count, 64);
    assert_eq!(leak.residual_bytes, 64 * 64);
}

// ---------------------------------------------------------------------------
// Failure paths
// ---------------------------------------------------------------------------

#[test]
fn test_overlap_is_detected_with_both_ranges() {
    let a = ArenaDouble::new(Fault::ReturnPrevious, 5);
    let spec = WorkloadSpec::constant(48, 1, 10);
    let result = Worker::new(0, &a, &spec, 0).run();
    let failure = result.failure.expect("overlap must fail the worker");
    assert_eq!(failure.state, WorkerState::Allocating);
    assert_eq!(failure.pass, 4);
    match failure.error {
        HarnessError::OverlapDetected { existing, new } => {
            assert_eq!(existing.start, new.start);
            assert_eq!(existing.len, 48);
        }
        other => panic!("expected overlap, got {other}"),
    }
}

#[test]
fn test_scribble_is_detected_while_verifying() {
    let a = ArenaDouble::new(Fault::ScribblePrevious, 3);
    let spec = WorkloadSpec::constant(32, 1, 6);
    let result = Worker::new(1, &a, &spec, 0).run();
    let failure = result.failure.expect("scribble must fail the worker");
    assert_eq!(failure.state, WorkerState::Verifying);
    assert_eq!(failure.pass, 1);
    assert!(matches!(failure.error, HarnessError::CorruptionDetected { offset: 0, .. }));
}

#[test]
fn test_refused_allocation_fails_fast() {
    let a = ArenaDouble::new(Fault::Refuse, 2);
    let spec = WorkloadSpec::constant(100, 3, 4);
    let result = Worker::new(0, &a, &spec, 0).run();
    assert_eq!(result.allocations, 1);
    assert_eq!(result.loops_completed, 0);
    let failure = result.failure.unwrap();
    assert!(matches!(failure.error, HarnessError::AllocationFailed { size: 100, align: 16 }));
}

#[test]
fn test_abutting_blocks_fail_unless_backend_opts_in() {
    let mut spec = WorkloadSpec::constant(64, 1, 8);
    let gapped = ArenaDouble::healthy();
    assert!(Worker::new(0, &gapped, &spec, 0).run().passed());

    // Back-to-back blocks break the default rule at the second pass.
    let packed = ArenaDouble::healthy().packed();
    let failure = Worker::new(0, &packed, &spec, 0).run().failure.expect("abut must fail");
    assert_eq!(failure.pass, 1);
    match failure.error {
        HarnessError::OverlapDetected { existing, new } => assert_eq!(existing.end(), new.start),
        other => panic!("expected overlap, got {other}"),
    }

    spec.adjacency = AdjacencyRule::for_backend(&packed);
    assert_eq!(spec.adjacency, AdjacencyRule::AllowAbut);
    assert!(Worker::new(0, &packed, &spec, 0).run().passed());
}

#[test]
fn test_harness_picks_rule_per_backend() {
    let packed: Arc<dyn AllocatorHandle> = Arc::new(ArenaDouble::healthy().packed());
    let config = HarnessConfig {
        phases: Phases::VALIDATION | Phases::THREADED,
        ..small_config()
    };
    let report = Harness::with_backends(config.clone(), vec![packed]).unwrap().run();
    assert!(report.passed());

    // Forcing the strict rule exposes the packing.
    let packed: Arc<dyn AllocatorHandle> = Arc::new(ArenaDouble::healthy().packed());
    let strict = HarnessConfig {
        adjacency: Some(AdjacencyRule::RequireGap),
        ..config
    };
    let report = Harness::with_backends(strict, vec![packed]).unwrap().run();
    let phases = &report.backends[0].phases;
    assert!(phases.iter().any(|p| matches!(
        &p.error,
        Some(HarnessError::PoolFailed { first, .. })
            if matches!(first.failure.as_ref().map(|f| &f.error), Some(HarnessError::OverlapDetected { .. }))
    )));
}

#[test]
fn test_failed_worker_does_not_stop_siblings() {
    let backend: Arc<dyn AllocatorHandle> = Arc::new(ArenaDouble::new(Fault::ReturnPrevious, 10).only_for(2));
    let spec = WorkloadSpec::threaded(3, 64, &THREADED_PALETTE);
    let err = WorkerPool::new(backend.clone(), spec, 4).with_seed(Some(1)).run().unwrap_err();
    match err {
        HarnessError::PoolFailed { first, failed, total } => {
            assert_eq!(failed, 1);
            assert_eq!(total, 4);
            assert_eq!(first.worker_id, 2);
            assert!(matches!(
                first.failure.as_ref().map(|f| &f.error),
                Some(HarnessError::OverlapDetected { .. })
            ));
        }
        other => panic!("expected pool failure, got {other}"),
    }
    // Siblings ran every loop: 3 workers x 3 loops x 64 passes, plus the
    // failed worker's partial loop.
    assert!(backend.statistics().allocation_count_total >= 3 * 3 * 64);
}

#[test]
fn test_panicking_backend_reported_per_worker() {
    let backend: Arc<dyn AllocatorHandle> = Arc::new(ArenaDouble::new(Fault::Panic, 1).only_for(0));
    let spec = WorkloadSpec::threaded(2, 16, &THREADED_PALETTE);
    let err = WorkerPool::new(backend, spec, 3).with_seed(Some(3)).run().unwrap_err();
    match err {
        HarnessError::PoolFailed { first, failed, .. } => {
            assert_eq!(failed, 1);
            assert_eq!(first.worker_id, 0);
            assert!(first.to_string().contains("injected failure"), "{first}");
        }
        other => panic!("expected pool failure, got {other}"),
    }
}

// ---------------------------------------------------------------------------
// Harness level
// ---------------------------------------------------------------------------

#[test]
fn test_full_harness_run_passes_on_both_backends() {
    let report = Harness::new(small_config()).unwrap().run();
    for backend in &report.backends {
        assert!(backend.passed(), "{} backend failed", backend.backend);
        // validation x3, benchmark, warm-up, threaded
        assert_eq!(backend.phases.len(), 6);
        assert_eq!(backend.leaks().count(), 0);
    }
    assert!(report.passed());
}

#[test]
fn test_capacity_boundary_checked_before_any_allocation() {
    let at_max = HarnessConfig {
        phases: Phases::THREADED,
        threaded: WorkloadSpec::threaded(1, 4096, &THREADED_PALETTE),
        ..small_config()
    };
    assert!(Harness::new(at_max).is_ok());

    let backend = Arc::new(Recording::new(SystemAllocator::new()));
    let above = HarnessConfig {
        phases: Phases::THREADED,
        threaded: WorkloadSpec::threaded(1, 4097, &THREADED_PALETTE),
        ..small_config()
    };
    let err = Harness::with_backends(above, vec![backend.clone() as Arc<dyn AllocatorHandle>])
        .err()
        .unwrap();
    assert!(matches!(err, HarnessError::CapacityExceeded { requested: 4097, capacity: 4096 }));
    assert!(backend.ranges().is_empty());
}

#[test]
fn test_backend_init_failure_does_not_stop_others() {
    let broken = PoolAllocator::with_config(PoolConfig {
        block_size: 3 * 4096,
        ..pool_config()
    });
    let config = HarnessConfig {
        phases: Phases::VALIDATION,
        ..small_config()
    };
    let backends = vec![
        Arc::new(broken) as Arc<dyn AllocatorHandle>,
        BackendKind::System.create(&config.pool),
    ];
    let report = Harness::with_backends(config, backends).unwrap().run();
    assert!(!report.passed());
    assert!(matches!(report.backends[0].error, Some(HarnessError::Backend { backend: "pool", .. })));
    assert!(report.backends[1].passed());
    assert!(report.backends[1].phases.iter().all(PhaseReport::passed));
}

#[test]
fn test_faulty_backend_fails_its_phases_only() {
    let backend: Arc<dyn AllocatorHandle> = Arc::new(ArenaDouble::new(Fault::ScribblePrevious, 100));
    let config = HarnessConfig {
        phases: Phases::VALIDATION,
        ..small_config()
    };
    let report = Harness::with_backends(config, vec![backend]).unwrap().run();
    let phases = &report.backends[0].phases;
    assert!(!phases[0].passed());
    // The fault fires once; later phases run and pass.
    assert!(phases[1].passed());
    assert!(phases[2].passed());
}

// ---------------------------------------------------------------------------
// Randomized properties
// ---------------------------------------------------------------------------

fn random_spec(rng: &mut StdRng) -> WorkloadSpec {
    let palette: Vec<usize> = (0..rng.gen_range(1..=8)).map(|_| rng.gen_range(0..=2048)).collect();
    let schedule = match rng.gen_range(0..3) {
        0 => SizeSchedule::Rotating,
        1 => SizeSchedule::Cycling,
        _ => SizeSchedule::Constant,
    };
    WorkloadSpec {
        schedule,
        align: [0, 1, 16, 64, 256][rng.gen_range(0..5)],
        ..WorkloadSpec::threaded(rng.gen_range(1..=3), rng.gen_range(1..=256), &palette)
    }
}

#[test]
fn test_random_workloads_never_overlap_on_correct_backends() {
    let system = system();
    let pool = pool();
    let mut rng = StdRng::seed_from_u64(0x5EED);
    for _ in 0..24 {
        let spec = random_spec(&mut rng);
        spec.validate().unwrap();
        let jitter = rng.gen_range(0..10);
        for backend in [&system as &dyn AllocatorHandle, &pool] {
            let spec = spec_for(backend, &spec);
            let result = Worker::new(0, backend, &spec, jitter).run();
            assert!(result.passed(), "{:?} on {}: {result}", spec, backend.name());
        }
    }
    assert_eq!(system.statistics().allocation_count_current, 0);
    assert_eq!(pool.statistics().allocation_count_current, 0);
}

#[test]
fn test_same_seed_same_outcome_and_sizes() {
    let mut rng = StdRng::seed_from_u64(99);
    let spec = WorkloadSpec {
        adjacency: AdjacencyRule::AllowAbut,
        ..random_spec(&mut rng)
    };
    let run = || {
        let rec = Recording::new(pool());
        let result = Worker::new(5, &rec, &spec, 4).run();
        (result.passed(), result.allocations, rec.sizes())
    };
    let (a_passed, a_allocs, a_sizes) = run();
    let (b_passed, b_allocs, b_sizes) = run();
    assert!(a_passed && b_passed);
    assert_eq!(a_allocs, b_allocs);
    assert_eq!(a_sizes, b_sizes);

    let generator = WorkloadGenerator::new(&spec, 4);
    let expected: Vec<usize> = (0..spec.loop_count).flat_map(|l| generator.sizes(l).collect::<Vec<_>>()).collect();
    assert_eq!(a_sizes, expected);
}

#[test]
fn test_balanced_pool_phase_has_no_residual() {
    let a = pool();
    let cmp = StatisticsComparator::begin(&a, "pool balanced");
    let spec = spec_for(&a, &WorkloadSpec::threaded(3, 300, &THREADED_PALETTE));
    let result = Worker::new(0, &a, &spec, 0).run();
    assert!(result.passed());
    let stats = cmp.finish(true);
    assert!(stats.leak.is_none());
    assert!(stats.delta.allocation_count_total > 0);
}
