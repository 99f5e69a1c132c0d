//! Fork/join pool of workers sharing one backend.
//!
//! The backend is shared with no locking on the harness side. Workers start
//! behind a gate that opens only once every thread is live, so contention
//! begins with all of them at once; the pool then waits on a completion latch,
//! waking periodically to yield. If a spawn fails the gate is cancelled
//! instead and the workers already running exit without allocating.
//!
//! A failed worker does not cancel its siblings: every worker runs to its
//! natural end so independent defects all surface in one run.

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use crate::backend::AllocatorHandle;
use crate::error::HarnessError;
use crate::harness::worker::{Worker, WorkerResult, panic_message};
use crate::harness::workload::{WorkloadSpec, draw_jitter, jitter_delay, worker_rng};
use crate::sync::{Arc, Condvar, Mutex, lock, thread};

/// Floor on the worker count so there is contention even on tiny machines.
pub const MIN_WORKERS: usize = 3;

/// Hardware parallelism plus one, at least [`MIN_WORKERS`].
#[must_use]
pub fn default_worker_count() -> usize {
    let hw = std::thread::available_parallelism().map_or(1, NonZeroUsize::get);
    (hw + 1).max(MIN_WORKERS)
}

/// Start gate. Workers arrive and wait; the pool opens it once all of them
/// are waiting, or cancels it.
pub(crate) struct StartGate {
    state: Mutex<GateState>,
    changed: Condvar,
}

#[derive(Default)]
struct GateState {
    arrived: usize,
    /// `Some(true)` once opened, `Some(false)` once cancelled.
    outcome: Option<bool>,
}

impl StartGate {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(GateState::default()),
            changed: Condvar::new(),
        }
    }

    /// Register arrival and block until the gate opens (true) or is
    /// cancelled (false).
    pub(crate) fn arrive(&self) -> bool {
        let mut state = lock(&self.state);
        state.arrived += 1;
        self.changed.notify_all();
        loop {
            if let Some(open) = state.outcome {
                return open;
            }
            state = self
                .changed
                .wait(state)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
    }

    /// Block until `count` workers have arrived.
    pub(crate) fn wait_for(&self, count: usize) {
        let mut state = lock(&self.state);
        while state.arrived < count && state.outcome.is_none() {
            state = self
                .changed
                .wait(state)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
    }

    pub(crate) fn arrived(&self) -> usize {
        lock(&self.state).arrived
    }

    pub(crate) fn open(&self) {
        self.settle(true);
    }

    pub(crate) fn cancel(&self) {
        self.settle(false);
    }

    fn settle(&self, open: bool) {
        let mut state = lock(&self.state);
        state.outcome.get_or_insert(open);
        self.changed.notify_all();
    }
}

/// Counts outstanding workers down to zero.
pub(crate) struct CompletionLatch {
    remaining: Mutex<usize>,
    done: Condvar,
}

impl CompletionLatch {
    pub(crate) fn new(count: usize) -> Self {
        Self {
            remaining: Mutex::new(count),
            done: Condvar::new(),
        }
    }

    pub(crate) fn count_down(&self) {
        let mut remaining = lock(&self.remaining);
        *remaining = remaining.saturating_sub(1);
        if *remaining == 0 {
            self.done.notify_all();
        }
    }

    pub(crate) fn remaining(&self) -> usize {
        *lock(&self.remaining)
    }

    /// Block until the count reaches zero, waking every `poll` to yield.
    pub(crate) fn wait(&self, poll: Duration) {
        let mut remaining = lock(&self.remaining);
        while *remaining > 0 {
            #[cfg(not(loom))]
            {
                let (guard, timeout) = self
                    .done
                    .wait_timeout(remaining, poll)
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                remaining = guard;
                if timeout.timed_out() && *remaining > 0 {
                    log::trace!("worker pool: {} worker(s) still running", *remaining);
                    drop(remaining);
                    thread::yield_now();
                    remaining = lock(&self.remaining);
                }
            }
            #[cfg(loom)]
            {
                let _ = poll;
                remaining = self
                    .done
                    .wait(remaining)
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
            }
        }
    }

    /// Guard that counts the latch down when dropped, unwinding included.
    pub(crate) fn guard(self: &Arc<Self>) -> LatchGuard {
        LatchGuard(Arc::clone(self))
    }
}

pub(crate) struct LatchGuard(Arc<CompletionLatch>);

impl Drop for LatchGuard {
    fn drop(&mut self) {
        self.0.count_down();
    }
}

/// Results of a pool run in which every worker passed.
#[derive(Debug)]
pub struct PoolReport {
    /// One per worker, ordered by worker id.
    pub results: Vec<WorkerResult>,
    /// When the start gate opened. No worker allocates before this.
    pub released_at: Instant,
    /// From gate release to the last worker finishing.
    pub elapsed: Duration,
}

impl PoolReport {
    #[must_use]
    pub fn allocations(&self) -> u64 {
        self.results.iter().map(|r| r.allocations).sum()
    }
}

pub struct WorkerPool {
    allocator: Arc<dyn AllocatorHandle>,
    spec: Arc<WorkloadSpec>,
    workers: usize,
    seed: Option<u64>,
    poll_interval: Duration,
    #[cfg(test)]
    fail_spawn_at: Option<usize>,
}

impl WorkerPool {
    #[must_use]
    pub fn new(allocator: Arc<dyn AllocatorHandle>, spec: WorkloadSpec, workers: usize) -> Self {
        Self {
            allocator,
            spec: Arc::new(spec),
            workers,
            seed: None,
            poll_interval: Duration::from_millis(10),
            #[cfg(test)]
            fail_spawn_at: None,
        }
    }

    /// Seed worker jitter for a reproducible run.
    #[must_use]
    pub fn with_seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }

    #[must_use]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    #[must_use]
    pub fn workers(&self) -> usize {
        self.workers
    }

    #[must_use]
    pub fn spec(&self) -> &WorkloadSpec {
        &self.spec
    }

    fn spawn_worker<F>(&self, id: usize, body: F) -> std::io::Result<thread::JoinHandle<Option<WorkerResult>>>
    where
        F: FnOnce() -> Option<WorkerResult> + Send + 'static,
    {
        #[cfg(test)]
        {
            if self.fail_spawn_at == Some(id) {
                return Err(std::io::Error::from(std::io::ErrorKind::WouldBlock));
            }
        }
        thread::Builder::new().name(format!("alloc-worker-{id}")).spawn(body)
    }

    /// Spawn, release and join every worker.
    ///
    /// Returns only after every spawned thread has been joined.
    ///
    /// # Errors
    ///
    /// Configuration errors before anything is spawned; `SpawnFailed` if a
    /// thread could not be started, after the ones already running have been
    /// released and joined; `PoolFailed` if any worker failed, carrying the
    /// lowest-numbered failure.
    pub fn run(&self) -> Result<PoolReport, HarnessError> {
        self.spec.validate()?;
        if self.workers == 0 {
            return Err(HarnessError::InvalidWorkload("worker pool needs at least one worker".to_string()));
        }

        let gate = Arc::new(StartGate::new());
        let latch = Arc::new(CompletionLatch::new(self.workers));

        let mut handles = Vec::with_capacity(self.workers);
        for id in 0..self.workers {
            let jitter = draw_jitter(&mut worker_rng(self.seed, id));
            let allocator = Arc::clone(&self.allocator);
            let spec = Arc::clone(&self.spec);
            let worker_gate = Arc::clone(&gate);
            let done = latch.guard();
            let spawned = self.spawn_worker(id, move || {
                let _done = done;
                if !worker_gate.arrive() {
                    return None;
                }
                thread::sleep(jitter_delay(jitter));
                Some(Worker::new(id, allocator.as_ref(), &spec, jitter).run_catching())
            });
            match spawned {
                Ok(handle) => handles.push((id, jitter, handle)),
                Err(source) => {
                    log::warn!("worker pool: spawning worker {id} failed: {source}");
                    gate.cancel();
                    for (_, _, handle) in handles {
                        let _ = handle.join();
                    }
                    return Err(HarnessError::SpawnFailed { worker: id, source });
                }
            }
        }

        gate.wait_for(self.workers);
        let released_at = Instant::now();
        gate.open();
        log::debug!(
            "worker pool: {} workers running on {} backend",
            self.workers,
            self.allocator.name()
        );

        latch.wait(self.poll_interval);
        let elapsed = released_at.elapsed();

        let mut results: Vec<WorkerResult> = handles
            .into_iter()
            .map(|(id, jitter, handle)| match handle.join() {
                Ok(Some(result)) => result,
                Ok(None) => WorkerResult::panicked(id, jitter, "worker was cancelled before starting".to_string()),
                Err(payload) => WorkerResult::panicked(id, jitter, panic_message(payload.as_ref())),
            })
            .collect();

        let failed = results.iter().filter(|r| !r.passed()).count();
        if failed == 0 {
            return Ok(PoolReport {
                results,
                released_at,
                elapsed,
            });
        }

        let total = results.len();
        let first_idx = results.iter().position(|r| !r.passed()).unwrap_or(0);
        Err(HarnessError::PoolFailed {
            first: Box::new(results.swap_remove(first_idx)),
            failed,
            total,
        })
    }
}
