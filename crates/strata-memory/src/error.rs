//! Pool error type and the thread-local last-error cell.

use core::fmt;
use std::cell::Cell;

/// Errors reported by pool operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolError {
    /// A required pointer argument was null or empty.
    NullPointer,
    /// A size argument was zero, overflowed, or was otherwise unusable.
    InvalidSize,
    /// No region could satisfy the request, even after extending the chain.
    OutOfMemory,
    /// A block header failed validation (bad magic or impossible size).
    Corruption,
    /// The block was already on a free list.
    DoubleFree,
    /// The pointer does not belong to any region of the pool.
    InvalidPointer,
}

impl PoolError {
    /// Returns a static string describing the error.
    pub const fn as_str(&self) -> &'static str {
        match self {
            PoolError::NullPointer => "null pointer",
            PoolError::InvalidSize => "invalid size",
            PoolError::OutOfMemory => "out of memory",
            PoolError::Corruption => "memory corruption detected",
            PoolError::DoubleFree => "double free detected",
            PoolError::InvalidPointer => "pointer does not belong to the pool",
        }
    }
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::error::Error for PoolError {}

/// Result type for pool operations.
pub type PoolResult<T> = Result<T, PoolError>;

thread_local! {
    static LAST_ERROR: Cell<Option<PoolError>> = const { Cell::new(None) };
}

/// Returns the error recorded by the most recent pool operation on the
/// calling thread, or `None` if that operation succeeded.
pub fn last_error() -> Option<PoolError> {
    LAST_ERROR.with(Cell::get)
}

/// Records the outcome of a public pool operation in the thread-local cell
/// and passes the result through.
pub(crate) fn record<T>(result: PoolResult<T>) -> PoolResult<T> {
    LAST_ERROR.with(|cell| cell.set(result.as_ref().err().copied()));
    result
}
