//! Executor lifecycle, ordering, and backpressure.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::Duration;

use strata_executor::{ExecutorError, Shutdown, ThreadPool};

#[test]
fn graceful_shutdown_completes_every_accepted_task() {
    let mut pool = ThreadPool::new(4, 10).unwrap();
    let completed: Arc<Vec<AtomicBool>> =
        Arc::new((0..30).map(|_| AtomicBool::new(false)).collect());

    let mut accepted = 0;
    for index in 0..30 {
        let completed = Arc::clone(&completed);
        loop {
            let flags = Arc::clone(&completed);
            match pool.submit(move || {
                thread::sleep(Duration::from_millis(1));
                flags[index].store(true, Ordering::SeqCst);
            }) {
                Ok(()) => {
                    accepted += 1;
                    break;
                }
                // Bounded queue: back off and retry until admitted.
                Err(ExecutorError::QueueFull) => thread::sleep(Duration::from_millis(1)),
                Err(other) => panic!("unexpected submit failure: {other}"),
            }
        }
    }

    pool.shutdown(Shutdown::Graceful).unwrap();
    assert_eq!(accepted, 30);
    for flag in completed.iter() {
        assert!(flag.load(Ordering::SeqCst));
    }
}

#[test]
fn single_worker_preserves_submission_order() {
    let mut pool = ThreadPool::new(1, 0).unwrap();
    let order = Arc::new(Mutex::new(Vec::new()));

    for index in 0..50 {
        let order = Arc::clone(&order);
        pool.submit(move || order.lock().unwrap().push(index)).unwrap();
    }
    pool.shutdown(Shutdown::Graceful).unwrap();

    let seen = order.lock().unwrap();
    assert_eq!(*seen, (0..50).collect::<Vec<_>>());
}

#[test]
fn bounded_queue_rejects_overflow() {
    let mut pool = ThreadPool::new(1, 2).unwrap();
    let (started_tx, started_rx) = mpsc::channel();
    let (gate_tx, gate_rx) = mpsc::channel::<()>();

    pool.submit(move || {
        started_tx.send(()).unwrap();
        gate_rx.recv().unwrap();
    })
    .unwrap();
    // Wait until the only worker holds the blocker, so the next two
    // submissions sit in the queue.
    started_rx.recv().unwrap();

    pool.submit(|| {}).unwrap();
    pool.submit(|| {}).unwrap();
    assert_eq!(pool.submit(|| {}).unwrap_err(), ExecutorError::QueueFull);

    gate_tx.send(()).unwrap();
    pool.shutdown(Shutdown::Graceful).unwrap();
}

#[test]
fn unbounded_queue_grows_past_the_initial_capacity() {
    let mut pool = ThreadPool::new(2, 0).unwrap();
    let counter = Arc::new(AtomicUsize::new(0));

    for _ in 0..3000 {
        let counter = Arc::clone(&counter);
        pool.submit(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    }
    pool.shutdown(Shutdown::Graceful).unwrap();
    assert_eq!(counter.load(Ordering::SeqCst), 3000);
}

#[test]
fn immediate_shutdown_abandons_queued_tasks() {
    let mut pool = ThreadPool::new(1, 0).unwrap();
    let completed = Arc::new(AtomicUsize::new(0));
    let (started_tx, started_rx) = mpsc::channel();
    let (gate_tx, gate_rx) = mpsc::channel::<()>();

    {
        let completed = Arc::clone(&completed);
        pool.submit(move || {
            started_tx.send(()).unwrap();
            gate_rx.recv().unwrap();
            completed.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    }
    started_rx.recv().unwrap();

    for _ in 0..5 {
        let completed = Arc::clone(&completed);
        pool.submit(move || {
            completed.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    }
    assert_eq!(pool.queued(), 5);

    // Release the in-flight task once shutdown is underway.
    let releaser = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        gate_tx.send(()).unwrap();
    });

    pool.shutdown(Shutdown::Immediate).unwrap();
    releaser.join().unwrap();

    // The in-flight task finished naturally; the queued ones were dropped.
    assert_eq!(completed.load(Ordering::SeqCst), 1);
}

#[test]
fn operations_after_shutdown_are_rejected() {
    let mut pool = ThreadPool::new(2, 0).unwrap();
    pool.shutdown(Shutdown::Graceful).unwrap();

    assert_eq!(pool.submit(|| {}).unwrap_err(), ExecutorError::Shutdown);
    assert_eq!(
        pool.shutdown(Shutdown::Graceful).unwrap_err(),
        ExecutorError::Shutdown
    );
}

#[test]
fn zero_threads_selects_the_default() {
    let mut pool = ThreadPool::new(0, 0).unwrap();
    assert_eq!(pool.thread_count(), strata_executor::DEFAULT_THREADS);
    pool.shutdown(Shutdown::Graceful).unwrap();
}

#[test]
fn a_panicking_task_does_not_kill_the_pool() {
    let mut pool = ThreadPool::new(1, 0).unwrap();
    let completed = Arc::new(AtomicUsize::new(0));

    pool.submit(|| panic!("task failure")).unwrap();
    {
        let completed = Arc::clone(&completed);
        pool.submit(move || {
            completed.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    }

    pool.shutdown(Shutdown::Graceful).unwrap();
    assert_eq!(completed.load(Ordering::SeqCst), 1);
}

#[test]
fn dropping_a_running_pool_does_not_hang() {
    let pool = ThreadPool::new(2, 0).unwrap();
    let counter = Arc::new(AtomicUsize::new(0));
    for _ in 0..4 {
        let counter = Arc::clone(&counter);
        pool.submit(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    }
    // Drop performs an immediate shutdown; in-flight tasks finish,
    // anything still queued is released without running.
    drop(pool);
}

#[test]
fn task_records_cycle_through_many_submissions() {
    // Far more tasks than the record class holds, so records are reused
    // and the pool fallback path gets exercised under load.
    let mut pool = ThreadPool::new(4, 0).unwrap();
    let counter = Arc::new(AtomicUsize::new(0));

    for _ in 0..10_000 {
        let counter = Arc::clone(&counter);
        pool.submit(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    }
    pool.shutdown(Shutdown::Graceful).unwrap();
    assert_eq!(counter.load(Ordering::SeqCst), 10_000);
}
