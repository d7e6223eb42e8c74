//! The worker pool.
//!
//! One mutex guards the queue and lifecycle state; `notify` wakes workers
//! when work arrives or shutdown begins, `empty` wakes a graceful
//! shutdown once the last task finishes. Signalling always happens under
//! the same lock that changed the predicate, so wake-ups cannot be lost.
//!
//! Lock ordering: the executor lock is always taken before the record
//! pool's lock, and no lock is held while a task runs.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};
use strata_memory::{MemoryPool, PoolConfig};

use crate::error::ExecutorError;
use crate::ring::RingQueue;
use crate::task::{self, RecordPtr, TaskRecord};

/// Worker count used when a caller asks for zero threads.
pub const DEFAULT_THREADS: usize = 4;

/// Floor for the ring capacity; an unbounded queue starts here and
/// doubles on demand.
const MIN_RING_CAPACITY: usize = 1024;

/// Bytes in the task-record pool's first region.
const RECORD_POOL_SIZE: usize = 64 * 1024;

/// Records pre-reserved in the task-record size class.
const RECORD_CLASS_COUNT: usize = 128;

/// How a [`ThreadPool`] is brought down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    /// Drain the queue; return after every accepted task has finished.
    Graceful,
    /// Stop dequeuing; abandon queued tasks once in-flight ones finish.
    Immediate,
}

/// Construction parameters for [`ThreadPool`].
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Worker threads to launch; zero selects [`DEFAULT_THREADS`].
    pub threads: usize,
    /// Admission bound for the queue; zero means unbounded.
    pub queue_size: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            threads: DEFAULT_THREADS,
            queue_size: 0,
        }
    }
}

/// Lifecycle of the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Running,
    /// Graceful shutdown: workers keep draining the queue.
    Draining,
    /// Immediate shutdown: workers stop dequeuing.
    Cancelling,
    Stopped,
}

struct State {
    queue: RingQueue<RecordPtr>,
    /// Tasks currently executing on workers.
    active: usize,
    phase: Phase,
}

struct Shared {
    state: Mutex<State>,
    /// Work arrived or shutdown began.
    notify: Condvar,
    /// Queue drained and no task in flight (graceful shutdown).
    empty: Condvar,
    /// Task records live here, served by a dedicated size class.
    records: MemoryPool,
    /// Admission bound; `None` is unbounded.
    bound: Option<usize>,
}

/// A fixed set of worker threads draining one shared FIFO.
///
/// # Examples
/// ```
/// use strata_executor::{Shutdown, ThreadPool};
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicUsize, Ordering};
///
/// let mut pool = ThreadPool::new(2, 16).unwrap();
/// let counter = Arc::new(AtomicUsize::new(0));
/// for _ in 0..8 {
///     let counter = Arc::clone(&counter);
///     pool.submit(move || {
///         counter.fetch_add(1, Ordering::SeqCst);
///     })
///     .unwrap();
/// }
/// pool.shutdown(Shutdown::Graceful).unwrap();
/// assert_eq!(counter.load(Ordering::SeqCst), 8);
/// ```
pub struct ThreadPool {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl ThreadPool {
    /// Launches `threads` workers behind a queue admitting `queue_size`
    /// tasks (zero for unbounded).
    pub fn new(threads: usize, queue_size: usize) -> Result<Self, ExecutorError> {
        Self::with_config(ExecutorConfig {
            threads,
            queue_size,
        })
    }

    /// Launches a pool from an explicit configuration.
    pub fn with_config(config: ExecutorConfig) -> Result<Self, ExecutorError> {
        let threads = if config.threads == 0 {
            DEFAULT_THREADS
        } else {
            config.threads
        };

        let queue = RingQueue::new(config.queue_size.max(MIN_RING_CAPACITY))
            .map_err(|_| ExecutorError::Invalid)?;

        let records = MemoryPool::with_config(PoolConfig {
            pool_size: RECORD_POOL_SIZE,
            thread_safe: true,
            ..PoolConfig::default()
        })?;
        records.add_size_class(size_of::<TaskRecord>(), RECORD_CLASS_COUNT)?;

        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                queue,
                active: 0,
                phase: Phase::Running,
            }),
            notify: Condvar::new(),
            empty: Condvar::new(),
            records,
            bound: (config.queue_size > 0).then_some(config.queue_size),
        });

        let mut workers = Vec::with_capacity(threads);
        for index in 0..threads {
            let shared = Arc::clone(&shared);
            let builder = thread::Builder::new().name(format!("strata-worker-{index}"));
            match builder.spawn(move || worker_loop(&shared)) {
                Ok(handle) => workers.push(handle),
                Err(error) => tracing::warn!(index, %error, "worker launch failed"),
            }
        }

        if workers.is_empty() {
            shared.state.lock().phase = Phase::Stopped;
            return Err(ExecutorError::ThreadFailure);
        }

        tracing::debug!(
            threads = workers.len(),
            bound = ?shared.bound,
            "executor started"
        );
        Ok(Self { shared, workers })
    }

    /// Queues `task` for execution on some worker.
    ///
    /// Fails with [`ExecutorError::Shutdown`] once shutdown has begun and
    /// with [`ExecutorError::QueueFull`] when a bounded queue is at its
    /// admission limit. An unbounded queue grows by doubling instead.
    pub fn submit<F>(&self, task: F) -> Result<(), ExecutorError>
    where
        F: FnOnce() + Send + 'static,
    {
        let shared = &self.shared;
        let mut state = shared.state.lock();

        if state.phase != Phase::Running {
            return Err(ExecutorError::Shutdown);
        }
        if let Some(bound) = shared.bound {
            if state.queue.len() >= bound {
                return Err(ExecutorError::QueueFull);
            }
        } else if state.queue.is_full() {
            let grown = state.queue.capacity() * 2;
            state
                .queue
                .resize(grown)
                .map_err(|_| ExecutorError::QueueFull)?;
            tracing::debug!(capacity = grown, "task queue grown");
        }

        let record = task::allocate_record(&shared.records, Box::new(task));
        if let Err(record) = state.queue.enqueue(record) {
            // Unreachable given the admission checks above, but never
            // leak the record.
            // SAFETY: The record was just created and never shared.
            unsafe { task::discard_record(&shared.records, record.0) };
            return Err(ExecutorError::QueueFull);
        }

        shared.notify.notify_one();
        Ok(())
    }

    /// Brings the pool down and joins every worker.
    ///
    /// Graceful shutdown waits for the queue to drain and all in-flight
    /// tasks to finish; immediate shutdown abandons queued tasks once the
    /// in-flight ones complete. A second call reports
    /// [`ExecutorError::Shutdown`] without touching anything.
    pub fn shutdown(&mut self, mode: Shutdown) -> Result<(), ExecutorError> {
        let shared = Arc::clone(&self.shared);
        {
            let mut state = shared.state.lock();
            if state.phase != Phase::Running {
                return Err(ExecutorError::Shutdown);
            }
            state.phase = match mode {
                Shutdown::Graceful => Phase::Draining,
                Shutdown::Immediate => Phase::Cancelling,
            };
            tracing::debug!(?mode, queued = state.queue.len(), "shutdown requested");
            shared.notify.notify_all();

            if mode == Shutdown::Graceful {
                while !(state.queue.is_empty() && state.active == 0) {
                    shared.empty.wait(&mut state);
                }
            }
        }

        let mut first_error = None;
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                first_error.get_or_insert(ExecutorError::ThreadFailure);
            }
        }

        {
            let mut state = shared.state.lock();
            while let Some(record) = state.queue.dequeue() {
                // SAFETY: Abandoned records still own their jobs; each is
                // discarded exactly once.
                unsafe { task::discard_record(&shared.records, record.0) };
            }
            state.phase = Phase::Stopped;
        }

        tracing::debug!("executor stopped");
        first_error.map_or(Ok(()), Err)
    }

    /// Worker threads currently attached to the pool.
    pub fn thread_count(&self) -> usize {
        self.workers.len()
    }

    /// Tasks waiting in the queue.
    pub fn queued(&self) -> usize {
        self.shared.state.lock().queue.len()
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        // Abandoning a live pool must not leak threads.
        let _ = self.shutdown(Shutdown::Immediate);
    }
}

fn worker_loop(shared: &Shared) {
    loop {
        let mut state = shared.state.lock();
        while state.queue.is_empty() && state.phase == Phase::Running {
            shared.notify.wait(&mut state);
        }

        let leaving = match state.phase {
            Phase::Running => false,
            Phase::Cancelling | Phase::Stopped => true,
            Phase::Draining => state.queue.is_empty(),
        };
        if leaving {
            drop(state);
            break;
        }

        let Some(record) = state.queue.dequeue() else {
            continue;
        };
        state.active += 1;
        drop(state);

        // SAFETY: The queue hands each record to exactly one worker.
        let job = unsafe { task::take_job(record.0) };
        if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
            tracing::warn!("task panicked");
        }
        // SAFETY: The job was taken above; the record memory is dead.
        unsafe { task::release_record(&shared.records, record.0) };

        let mut state = shared.state.lock();
        state.active -= 1;
        if state.phase == Phase::Draining && state.queue.is_empty() && state.active == 0 {
            shared.empty.notify_all();
        }
    }
    tracing::trace!("worker exiting");
}
