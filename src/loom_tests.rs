/// Loom models of the concurrent pieces.
///
/// Run w/ `RUSTFLAGS="--cfg loom" cargo test --lib --release`
///
/// Loom enumerates interleavings exhaustively, so thread counts stay at two
/// and every thread does one or two operations. Backends are created fresh
/// per iteration; under loom the VM layer is the heap-backed mock.
#[cfg(loom)]
mod tests {
    use std::time::Duration;

    use crate::backend::{AllocFlags, AllocatorHandle, PoolAllocator, PoolConfig, SystemAllocator};
    use crate::harness::worker_pool::{CompletionLatch, StartGate, WorkerPool};
    use crate::harness::workload::WorkloadSpec;
    use crate::sync::Arc;

    fn bounded(preemption: usize) -> loom::model::Builder {
        let mut b = loom::model::Builder::new();
        b.preemption_bound = Some(preemption);
        b
    }

    fn tiny_pool() -> PoolAllocator {
        let a = PoolAllocator::with_config(PoolConfig {
            class_reserved_size: 64 * 1024,
            block_size: 64 * 1024,
            ..PoolConfig::default()
        });
        a.initialize().unwrap();
        a
    }

    #[test]
    fn loom_counter_concurrent_add_sub() {
        use crate::backend::stats::Counter;

        loom::model(|| {
            let counter = Arc::new(Counter::new());
            let c1 = counter.clone();
            let c2 = counter.clone();

            let t1 = loom::thread::spawn(move || {
                c1.add(10);
                c1.add(5);
            });
            let t2 = loom::thread::spawn(move || {
                c2.sub(3);
                c2.add(8);
            });

            t1.join().unwrap();
            t2.join().unwrap();
            assert_eq!(counter.get(), 20);
        });
    }

    /// Both guards drop on other threads; `wait` must observe zero.
    #[test]
    fn loom_completion_latch() {
        loom::model(|| {
            let latch = Arc::new(CompletionLatch::new(2));
            let g1 = latch.guard();
            let g2 = latch.guard();

            let t1 = loom::thread::spawn(move || drop(g1));
            let t2 = loom::thread::spawn(move || drop(g2));

            latch.wait(Duration::from_millis(1));
            assert_eq!(latch.remaining(), 0);

            t1.join().unwrap();
            t2.join().unwrap();
        });
    }

    /// Two threads allocate from the same size class: the bins must differ
    /// and both frees must land.
    #[test]
    fn loom_pool_same_class_disjoint() {
        bounded(2).check(|| {
            let pool = Arc::new(tiny_pool());
            let p1 = pool.clone();
            let p2 = pool.clone();

            let t1 = loom::thread::spawn(move || {
                let ptr = p1.allocate(1, 48, 0, AllocFlags::empty()).unwrap();
                ptr.as_ptr().expose_provenance()
            });
            let t2 = loom::thread::spawn(move || {
                let ptr = p2.allocate(2, 48, 0, AllocFlags::empty()).unwrap();
                ptr.as_ptr().expose_provenance()
            });

            let a = t1.join().unwrap();
            let b = t2.join().unwrap();
            assert!(a + 48 <= b || b + 48 <= a, "bins overlap: {a:#x} {b:#x}");

            for addr in [a, b] {
                let ptr = std::ptr::NonNull::new(std::ptr::with_exposed_provenance_mut::<u8>(addr)).unwrap();
                // Safety: both bins are live and freed once.
                unsafe { pool.deallocate(ptr) };
            }
            assert_eq!(pool.live_bins(), 0);
        });
    }

    /// Alloc and free racing in one class.
    #[test]
    fn loom_pool_alloc_while_free() {
        bounded(2).check(|| {
            let pool = Arc::new(tiny_pool());
            let first = pool.allocate(0, 16, 0, AllocFlags::empty()).unwrap().as_ptr().expose_provenance();

            let p1 = pool.clone();
            let p2 = pool.clone();
            let t1 = loom::thread::spawn(move || {
                let ptr = std::ptr::NonNull::new(std::ptr::with_exposed_provenance_mut::<u8>(first)).unwrap();
                // Safety: `first` is live and only freed here.
                unsafe { p1.deallocate(ptr) };
            });
            let t2 = loom::thread::spawn(move || {
                let ptr = p2.allocate(0, 16, 0, AllocFlags::empty()).unwrap();
                // Safety: freshly allocated.
                unsafe { p2.deallocate(ptr) };
            });

            t1.join().unwrap();
            t2.join().unwrap();
            assert_eq!(pool.live_bins(), 0);
        });
    }

    /// Smallest possible pool run: start gate, jitter, join.
    #[test]
    fn loom_worker_pool_two_workers() {
        bounded(1).check(|| {
            let backend = SystemAllocator::new();
            backend.initialize().unwrap();
            let backend: Arc<dyn AllocatorHandle> = Arc::new(backend);

            let spec = WorkloadSpec::threaded(1, 2, &[16, 32]);
            let report = WorkerPool::new(backend.clone(), spec, 2)
                .with_seed(Some(1))
                .run()
                .unwrap();
            assert_eq!(report.results.len(), 2);
            assert_eq!(backend.statistics().allocation_count_current, 0);
        });
    }

    /// A cancelled gate releases every waiter, whether it arrived before or
    /// after the cancel.
    #[test]
    fn loom_start_gate_cancel_releases_waiters() {
        bounded(2).check(|| {
            let gate = Arc::new(StartGate::new());
            let g1 = Arc::clone(&gate);
            let t1 = loom::thread::spawn(move || g1.arrive());

            gate.cancel();
            assert!(!t1.join().unwrap());
            assert!(!gate.arrive());
        });
    }

    #[test]
    fn loom_start_gate_opens_after_all_arrive() {
        bounded(2).check(|| {
            let gate = Arc::new(StartGate::new());
            let handles: Vec<_> = (0..2)
                .map(|_| {
                    let g = Arc::clone(&gate);
                    loom::thread::spawn(move || g.arrive())
                })
                .collect();

            gate.wait_for(2);
            assert_eq!(gate.arrived(), 2);
            gate.open();
            for h in handles {
                assert!(h.join().unwrap());
            }
        });
    }
}
