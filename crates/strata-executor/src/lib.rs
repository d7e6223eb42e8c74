//! # Strata Executor
//!
//! A bounded worker pool for the strata concurrency substrate.
//!
//! A [`ThreadPool`] dispatches opaque tasks across a fixed set of worker
//! threads through one shared ring FIFO. Submission and wake-up happen
//! under a single mutex so no notification is ever lost; shutdown is
//! either graceful (drain every accepted task) or immediate (abandon the
//! queue once in-flight tasks finish). Task records are small fixed-size
//! objects cached in a [`strata_memory::MemoryPool`] size class.

mod error;
mod executor;
mod ring;
mod task;

pub use error::ExecutorError;
pub use executor::{DEFAULT_THREADS, ExecutorConfig, Shutdown, ThreadPool};
pub use ring::{RingError, RingQueue};
