//! Task records: the fixed-size objects the executor queues and caches.

use std::mem::MaybeUninit;
use std::ptr::NonNull;

use strata_memory::MemoryPool;

/// The work a task carries.
pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

/// One queued unit of work. The record itself is fixed-size, which is
/// what lets the pool serve it from a dedicated size class.
pub(crate) struct TaskRecord {
    job: Job,
}

/// A ring handle to a record living in pool (or fallback heap) memory.
pub(crate) struct RecordPtr(pub NonNull<TaskRecord>);

// SAFETY: A record is plain owned data behind a unique pointer; the queue
// hands each handle to exactly one consumer.
unsafe impl Send for RecordPtr {}

/// Materializes a record for `job`, preferring the pool's task-record
/// size class and falling back to the global allocator when the pool
/// cannot serve. Provenance is recovered on release via
/// [`MemoryPool::contains`].
pub(crate) fn allocate_record(pool: &MemoryPool, job: Job) -> RecordPtr {
    match pool.alloc_fixed(size_of::<TaskRecord>()) {
        Ok(payload) => {
            let record = payload.cast::<TaskRecord>();
            // SAFETY: The payload spans a full record and is exclusively
            // ours until enqueued.
            unsafe { record.as_ptr().write(TaskRecord { job }) };
            RecordPtr(record)
        }
        Err(error) => {
            tracing::trace!(%error, "record pool exhausted, using the global allocator");
            let boxed = Box::new(TaskRecord { job });
            // SAFETY: `Box::into_raw` never returns null.
            RecordPtr(unsafe { NonNull::new_unchecked(Box::into_raw(boxed)) })
        }
    }
}

/// Moves the job out of a record, leaving the record memory dead.
///
/// # Safety
/// `record` must hold a live record that has not been taken yet.
pub(crate) unsafe fn take_job(record: NonNull<TaskRecord>) -> Job {
    // SAFETY: Caller guarantees a live, untaken record; the read moves
    // the job out and the memory is released without running drop glue.
    unsafe { record.as_ptr().read().job }
}

/// Returns dead record memory to wherever it came from.
///
/// # Safety
/// The job must already have been taken out of `record`, and `record`
/// must not be used afterwards.
pub(crate) unsafe fn release_record(pool: &MemoryPool, record: NonNull<TaskRecord>) {
    if pool.contains(record.as_ptr().cast::<u8>()) {
        // SAFETY: The record came from this pool. Size-based dispatch
        // matters here: records carved generally while the class LIFO was
        // empty carry no class brand, and `free_fixed` is what homes them
        // onto the LIFO by their geometry.
        if let Err(error) = unsafe { pool.free_fixed(record.cast::<u8>()) } {
            tracing::warn!(%error, "failed to return task record to the pool");
        }
    } else {
        // SAFETY: The record came from `Box::into_raw`; rebuilding it as
        // `MaybeUninit` releases the memory without dropping the moved-out
        // job again.
        drop(unsafe { Box::from_raw(record.as_ptr().cast::<MaybeUninit<TaskRecord>>()) });
    }
}

/// Drops an untaken record: runs the job's drop glue, then releases the
/// memory.
///
/// # Safety
/// `record` must hold a live record that has not been taken.
pub(crate) unsafe fn discard_record(pool: &MemoryPool, record: NonNull<TaskRecord>) {
    // SAFETY: Caller guarantees a live record; taking then dropping the
    // job runs its cleanup exactly once.
    unsafe {
        drop(take_job(record));
        release_record(pool, record);
    }
}
