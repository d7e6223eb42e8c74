//! Executor error type.

use strata_memory::PoolError;
use thiserror::Error;

/// Errors reported by [`crate::ThreadPool`] operations.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorError {
    /// An argument was unusable (for example a zero ring capacity).
    #[error("invalid executor argument")]
    Invalid,

    /// The bounded task queue is at capacity.
    #[error("task queue is full")]
    QueueFull,

    /// The executor is shutting down or already stopped.
    #[error("executor is shut down")]
    Shutdown,

    /// A worker thread could not be launched or joined.
    #[error("worker thread failed")]
    ThreadFailure,

    /// The task-record pool could not be set up or serve an allocation.
    #[error("task record allocation failed: {0}")]
    Memory(#[from] PoolError),
}
