//! Before/after statistics snapshots around a harness phase.

use std::fmt;

use crate::backend::{AllocatorHandle, Stats};

fn signed_delta(before: usize, after: usize) -> i64 {
    let before = i64::try_from(before).unwrap_or(i64::MAX);
    let after = i64::try_from(after).unwrap_or(i64::MAX);
    after.saturating_sub(before)
}

/// Difference `after - before` of every counter.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StatsDelta {
    pub allocated_current: i64,
    pub allocated_total: i64,
    pub allocation_count_current: i64,
    pub allocation_count_total: i64,
    /// Backend counters by name; a counter missing on one side counts as 0.
    pub backend: Vec<(String, i64)>,
}

impl StatsDelta {
    #[must_use]
    pub fn between(before: &Stats, after: &Stats) -> Self {
        let mut backend: Vec<(String, i64)> = after
            .backend
            .iter()
            .map(|(name, value)| {
                let prev = before.backend_counter(name).unwrap_or(0);
                (name.clone(), signed_delta(prev, *value))
            })
            .collect();
        for (name, value) in &before.backend {
            if after.backend_counter(name).is_none() {
                backend.push((name.clone(), signed_delta(*value, 0)));
            }
        }
        Self {
            allocated_current: signed_delta(before.allocated_current, after.allocated_current),
            allocated_total: signed_delta(before.allocated_total, after.allocated_total),
            allocation_count_current: signed_delta(before.allocation_count_current, after.allocation_count_current),
            allocation_count_total: signed_delta(before.allocation_count_total, after.allocation_count_total),
            backend,
        }
    }
}

/// Residual live allocations after a phase that released everything it
/// allocated. A warning only: a backend may legitimately retain memory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeakSuspected {
    pub phase: String,
    pub backend: &'static str,
    pub residual_count: i64,
    pub residual_bytes: i64,
}

impl fmt::Display for LeakSuspected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "leak suspected after {} on {} backend: {} allocation(s), {} byte(s) still live",
            self.phase, self.backend, self.residual_count, self.residual_bytes
        )
    }
}

/// Statistics of one finished phase.
#[derive(Clone, Debug)]
pub struct PhaseStats {
    pub phase: String,
    pub before: Stats,
    pub after: Stats,
    pub delta: StatsDelta,
    pub leak: Option<LeakSuspected>,
}

/// Wraps a phase: snapshot on `begin`, snapshot and diff on `finish`.
pub struct StatisticsComparator<'a> {
    allocator: &'a dyn AllocatorHandle,
    phase: String,
    before: Stats,
}

impl<'a> StatisticsComparator<'a> {
    #[must_use]
    pub fn begin(allocator: &'a dyn AllocatorHandle, phase: impl Into<String>) -> Self {
        Self {
            allocator,
            phase: phase.into(),
            before: allocator.statistics(),
        }
    }

    /// Snapshot again and compare. `balanced` says every allocation of the
    /// phase was released, so a residual live count is suspicious.
    #[must_use]
    pub fn finish(self, balanced: bool) -> PhaseStats {
        let after = self.allocator.statistics();
        let delta = StatsDelta::between(&self.before, &after);

        let leak = (balanced && (delta.allocation_count_current != 0 || delta.allocated_current != 0)).then(|| {
            LeakSuspected {
                phase: self.phase.clone(),
                backend: self.allocator.name(),
                residual_count: delta.allocation_count_current,
                residual_bytes: delta.allocated_current,
            }
        });
        if let Some(leak) = &leak {
            log::warn!("{leak}");
        }
        log::debug!(
            "{} on {}: {:+} allocations, {:+} bytes requested",
            self.phase,
            self.allocator.name(),
            delta.allocation_count_total,
            delta.allocated_total
        );

        PhaseStats {
            phase: self.phase,
            before: self.before,
            after,
            delta,
            leak,
        }
    }
}

/// Dump a snapshot to the log as a `STATISTICS AFTER <title>` block.
pub fn log_stats(backend: &str, title: &str, stats: &Stats) {
    log::info!("STATISTICS AFTER {title} ({backend})");
    log::info!("  Current size:     {}", stats.allocated_current);
    log::info!("  Total size:       {}", stats.allocated_total);
    log::info!("  Count:            {}", stats.allocation_count_current);
    log::info!("  Total count:      {}", stats.allocation_count_total);
    for (name, value) in &stats.backend {
        log::info!("  {name:<18}{value}");
    }
}
