use anyhow::{Context, bail};
use clap::{Parser, ValueEnum};

use alloc_harness::{
    AdjacencyRule, AllocFlags, BackendKind, BenchmarkMatrix, Harness, HarnessConfig, Phases, SizeSchedule,
    ValidationSuite, default_worker_count,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Phase {
    Validation,
    Benchmark,
    Threaded,
}

impl From<Phase> for Phases {
    fn from(phase: Phase) -> Self {
        match phase {
            Phase::Validation => Phases::VALIDATION,
            Phase::Benchmark => Phases::BENCHMARK,
            Phase::Threaded => Phases::THREADED,
        }
    }
}

/// Correctness and throughput harness for pluggable memory allocators.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Backends to run; the first is the benchmark baseline.
    #[arg(long = "backend", value_enum, value_delimiter = ',', default_values_t = [BackendKind::System, BackendKind::Pool])]
    backends: Vec<BackendKind>,

    /// Phases to run.
    #[arg(long = "phase", value_enum, value_delimiter = ',', default_values_t = [Phase::Validation, Phase::Benchmark, Phase::Threaded])]
    phases: Vec<Phase>,

    /// Use the full-length validation suite and benchmark matrix.
    #[arg(long)]
    original: bool,

    /// Loops per threaded worker.
    #[arg(long, default_value_t = 512)]
    loops: usize,

    /// Passes (live blocks) per threaded loop.
    #[arg(long, default_value_t = 1024)]
    passes: usize,

    /// Size palette of the threaded workload.
    #[arg(long, value_delimiter = ',', default_values_t = [19, 249, 797, 3, 79, 34, 389])]
    palette: Vec<usize>,

    /// Palette entries in use (default: all).
    #[arg(long)]
    num_sizes: Option<usize>,

    /// Size schedule of the threaded workload.
    #[arg(long, value_enum, default_value_t = SizeSchedule::Rotating)]
    schedule: SizeSchedule,

    /// Allocation alignment (0 = backend default).
    #[arg(long, default_value_t = 0)]
    align: usize,

    /// Request zeroed memory and check it.
    #[arg(long)]
    zeroed: bool,

    /// How close live blocks may sit (default: require a gap, unless the
    /// backend packs blocks back to back).
    #[arg(long, value_enum)]
    adjacency: Option<AdjacencyRule>,

    /// Threaded workers (default: hardware threads + 1, at least 3).
    #[arg(long)]
    workers: Option<usize>,

    /// Seed worker jitter for a reproducible run.
    #[arg(long)]
    seed: Option<u64>,

    /// Benchmark matrix rows.
    #[arg(long)]
    matrix_outer: Option<usize>,

    /// Benchmark matrix columns.
    #[arg(long)]
    matrix_inner: Option<usize>,

    /// Untimed benchmark warm-up rounds.
    #[arg(long)]
    matrix_warmup: Option<usize>,

    /// Skip the single-threaded warm-up before the threaded phase.
    #[arg(long)]
    no_warmup: bool,

    /// Trim backends between phases.
    #[arg(long)]
    trim: bool,

    /// Pool backend: address space per size class, in MiB.
    #[arg(long, default_value_t = 256)]
    class_reserved_mib: usize,

    /// Pool backend: block size in bytes (0 = max(64 KiB, page size)).
    #[arg(long, default_value_t = 0)]
    block_size: usize,
}

impl Args {
    fn into_config(self) -> HarnessConfig {
        let mut config = HarnessConfig::default();

        config.backends = self.backends;
        config.phases = self.phases.into_iter().map(Phases::from).collect();

        if self.original {
            config.validation = ValidationSuite::original();
            config.matrix = BenchmarkMatrix::original();
        }
        if let Some(outer) = self.matrix_outer {
            config.matrix.outer = outer;
        }
        if let Some(inner) = self.matrix_inner {
            config.matrix.inner = inner;
        }
        if let Some(warmup) = self.matrix_warmup {
            config.matrix.warmup_loops = warmup;
        }

        let threaded = &mut config.threaded;
        threaded.loop_count = self.loops;
        threaded.pass_count = self.passes;
        threaded.num_sizes_active = self.num_sizes.unwrap_or(self.palette.len());
        threaded.size_palette = self.palette;
        threaded.schedule = self.schedule;
        threaded.align = self.align;
        if self.zeroed {
            threaded.flags |= AllocFlags::ZEROED;
        }

        config.adjacency = self.adjacency;
        config.workers = self.workers.unwrap_or_else(default_worker_count);
        config.seed = self.seed;
        config.threaded_warmup = !self.no_warmup;
        config.trim_between_phases = self.trim;

        config.pool.class_reserved_size = self.class_reserved_mib.saturating_mul(1024 * 1024);
        config.pool.block_size = self.block_size;
        config
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Args::parse().into_config();
    log::info!(
        "backends: {}; threaded: {} workers x {} loops x {} passes",
        config.backends.iter().map(ToString::to_string).collect::<Vec<_>>().join(", "),
        config.workers,
        config.threaded.loop_count,
        config.threaded.pass_count,
    );

    let harness = Harness::new(config).context("invalid harness configuration")?;
    let report = harness.run();

    if !report.passed() {
        let failed: Vec<_> = report
            .backends
            .iter()
            .filter(|b| !b.passed())
            .map(|b| b.backend)
            .collect();
        bail!("allocator defects detected on: {}", failed.join(", "));
    }
    log::info!("all phases passed");
    Ok(())
}
