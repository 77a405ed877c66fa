//! Error types.
//!
//! Misuse of the scheduling API that the caller can reasonably react to is
//! reported as a typed error. Broken internal invariants still panic.

use crate::fiber::{FiberId, SuspendKey};
use crate::job::JobId;
use thiserror::Error;

/// Misuse of the job scheduler's linking and eligibility operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobError {
    /// The id does not name a live job (never issued, or already done).
    #[error("job {0} is not live")]
    UnknownJob(JobId),

    /// Parent and dependency links are immutable once a job is finalized.
    #[error("job {0} is already finalized")]
    AlreadyFinalized(JobId),

    #[error("job {child} already has parent {parent}")]
    AlreadyHasParent { child: JobId, parent: JobId },

    #[error("job {job} already depends on {dependency}")]
    AlreadyHasDependency { job: JobId, dependency: JobId },

    #[error("job {0} cannot be linked to itself")]
    SelfLink(JobId),
}

/// Misuse of the fiber scheduler.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FiberError {
    /// The id does not name a live fiber (never added, finished or destroyed).
    #[error("fiber {0} is not live")]
    UnknownFiber(FiberId),

    /// A keyed resume did not match the key of the fiber's last keyed suspend.
    #[error("fiber {fiber} was suspended with key {expected:?}, resumed with {actual:?}")]
    SuspendKeyMismatch {
        fiber: FiberId,
        expected: Option<SuspendKey>,
        actual: SuspendKey,
    },

    #[error("failed to allocate a {size} byte fiber stack: {reason}")]
    StackAllocation { size: usize, reason: String },
}

/// Failures of the thread pool and configuration layer.
#[derive(Error, Debug)]
pub enum SystemError {
    #[error("{0} worker thread(s) panicked")]
    WorkerPanicked(usize),

    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Config(#[from] serde_json::Error),
}
