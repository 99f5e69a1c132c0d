use std::fmt;

use crate::backend::VmError;
use crate::harness::block_table::BlockRange;
use crate::harness::worker::WorkerResult;

/// Everything that can go wrong in a harness run.
///
/// `AllocationFailed`, `MisalignedAllocation`, `OverlapDetected` and
/// `CorruptionDetected` are allocator defects. `CapacityExceeded` and
/// `InvalidWorkload` are harness misconfigurations and are raised before any
/// allocation happens.
#[derive(Debug)]
pub enum HarnessError {
    AllocationFailed {
        size: usize,
        align: usize,
    },
    MisalignedAllocation {
        address: usize,
        align: usize,
    },
    OverlapDetected {
        existing: BlockRange,
        new: BlockRange,
    },
    CorruptionDetected {
        block: BlockRange,
        offset: usize,
        expected: u8,
        found: u8,
    },
    CapacityExceeded {
        requested: usize,
        capacity: usize,
    },
    InvalidWorkload(String),
    WorkerPanicked {
        worker: usize,
        message: String,
    },
    /// The OS refused to start a worker thread. Workers already started were
    /// released without allocating and joined.
    SpawnFailed {
        worker: usize,
        source: std::io::Error,
    },
    /// At least one worker of a pool failed. Carries the failure of the
    /// lowest-numbered failed worker.
    PoolFailed {
        first: Box<WorkerResult>,
        failed: usize,
        total: usize,
    },
    Backend {
        backend: &'static str,
        source: VmError,
    },
}

impl HarnessError {
    /// True for errors caused by the harness configuration rather than by the
    /// allocator under test.
    #[must_use]
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            HarnessError::CapacityExceeded { .. } | HarnessError::InvalidWorkload(_)
        )
    }
}

impl fmt::Display for HarnessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HarnessError::AllocationFailed { size, align } => {
                write!(f, "allocation of {size} bytes (align {align}) failed")
            }
            HarnessError::MisalignedAllocation { address, align } => {
                write!(f, "allocation at {address:#x} is not aligned to {align}")
            }
            HarnessError::OverlapDetected { existing, new } => {
                write!(f, "overlap detected: new block {new} intersects live block {existing}")
            }
            HarnessError::CorruptionDetected {
                block,
                offset,
                expected,
                found,
            } => write!(
                f,
                "corruption detected in block {block} at offset {offset}: expected 0x{expected:02x}, found 0x{found:02x}"
            ),
            HarnessError::CapacityExceeded { requested, capacity } => write!(
                f,
                "harness misconfiguration: {requested} live blocks requested, capacity is {capacity}"
            ),
            HarnessError::InvalidWorkload(msg) => write!(f, "harness misconfiguration: {msg}"),
            HarnessError::WorkerPanicked { worker, message } => {
                write!(f, "worker {worker} panicked: {message}")
            }
            HarnessError::SpawnFailed { worker, source } => {
                write!(f, "could not start worker {worker}: {source}")
            }
            HarnessError::PoolFailed { first, failed, total } => {
                write!(f, "{failed} of {total} workers failed; first: {first}")
            }
            HarnessError::Backend { backend, source } => write!(f, "{backend} backend: {source}"),
        }
    }
}

impl std::error::Error for HarnessError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            HarnessError::Backend { source, .. } => Some(source),
            HarnessError::SpawnFailed { source, .. } => Some(source),
            HarnessError::PoolFailed { first, .. } => first
                .failure
                .as_ref()
                .map(|failure| &failure.error as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}
