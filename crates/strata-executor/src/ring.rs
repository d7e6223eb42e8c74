//! Fixed-capacity ring FIFO.
//!
//! The executor's queue: strict FIFO over owned elements, resizable by
//! whole-buffer compaction. Dropping the queue (or calling [`clear`])
//! drops any elements still inside; dequeued elements transfer ownership
//! to the caller, so nothing runs on the queue side.
//!
//! [`clear`]: RingQueue::clear

use std::mem::MaybeUninit;

use thiserror::Error;

/// Structural ring-queue failures. Full/empty conditions are conveyed
/// through the operation results instead.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RingError {
    /// Capacity must be at least one.
    #[error("ring capacity must be at least one")]
    InvalidCapacity,

    /// A resize would not hold the elements currently queued.
    #[error("new capacity is smaller than the current length")]
    WouldTruncate,
}

/// Fixed-capacity circular buffer with head→tail FIFO order.
#[derive(Debug)]
pub struct RingQueue<T> {
    buf: Box<[MaybeUninit<T>]>,
    head: usize,
    tail: usize,
    len: usize,
}

impl<T> RingQueue<T> {
    /// Creates a queue holding up to `capacity` elements.
    pub fn new(capacity: usize) -> Result<Self, RingError> {
        if capacity == 0 {
            return Err(RingError::InvalidCapacity);
        }
        Ok(Self {
            buf: Box::new_uninit_slice(capacity),
            head: 0,
            tail: 0,
            len: 0,
        })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.len == self.buf.len()
    }

    /// Writes at the tail. A full queue hands the element back.
    pub fn enqueue(&mut self, elem: T) -> Result<(), T> {
        if self.is_full() {
            return Err(elem);
        }
        self.buf[self.tail].write(elem);
        self.tail = (self.tail + 1) % self.buf.len();
        self.len += 1;
        Ok(())
    }

    /// Removes the head element, transferring ownership out.
    pub fn dequeue(&mut self) -> Option<T> {
        if self.is_empty() {
            return None;
        }
        // SAFETY: `len > 0`, so the slot at `head` was written by a prior
        // `enqueue` and has not been read out since.
        let elem = unsafe { self.buf[self.head].assume_init_read() };
        self.head = (self.head + 1) % self.buf.len();
        self.len -= 1;
        Some(elem)
    }

    /// The head element, without dequeuing it.
    pub fn peek(&self) -> Option<&T> {
        if self.is_empty() {
            return None;
        }
        // SAFETY: As in `dequeue`, the head slot is initialized.
        Some(unsafe { self.buf[self.head].assume_init_ref() })
    }

    /// Reallocates to `new_capacity`, compacting the elements to index 0
    /// in head→tail order. Fails if the queued elements would not fit.
    pub fn resize(&mut self, new_capacity: usize) -> Result<(), RingError> {
        if new_capacity == 0 {
            return Err(RingError::InvalidCapacity);
        }
        if new_capacity < self.len {
            return Err(RingError::WouldTruncate);
        }

        let mut fresh = Box::new_uninit_slice(new_capacity);
        let old_capacity = self.buf.len();
        for slot in 0..self.len {
            // SAFETY: Every index within `len` positions of `head` holds
            // an element; each is moved out exactly once.
            let elem = unsafe { self.buf[(self.head + slot) % old_capacity].assume_init_read() };
            fresh[slot].write(elem);
        }

        self.buf = fresh;
        self.head = 0;
        self.tail = self.len % new_capacity;
        Ok(())
    }

    /// Drops every queued element and resets the indices.
    pub fn clear(&mut self) {
        while self.dequeue().is_some() {}
        self.head = 0;
        self.tail = 0;
    }
}

impl<T> Drop for RingQueue<T> {
    fn drop(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn rejects_zero_capacity() {
        assert_eq!(RingQueue::<u32>::new(0).unwrap_err(), RingError::InvalidCapacity);
    }

    #[test]
    fn fifo_order_with_wraparound() {
        let mut ring = RingQueue::new(3).unwrap();
        assert!(ring.enqueue(1).is_ok());
        assert!(ring.enqueue(2).is_ok());
        assert_eq!(ring.dequeue(), Some(1));
        assert!(ring.enqueue(3).is_ok());
        assert!(ring.enqueue(4).is_ok());
        assert!(ring.is_full());
        assert_eq!(ring.enqueue(5).unwrap_err(), 5);
        assert_eq!(ring.dequeue(), Some(2));
        assert_eq!(ring.dequeue(), Some(3));
        assert_eq!(ring.dequeue(), Some(4));
        assert_eq!(ring.dequeue(), None);
    }

    #[test]
    fn peek_does_not_consume() {
        let mut ring = RingQueue::new(2).unwrap();
        assert_eq!(ring.peek(), None);
        ring.enqueue("a").unwrap();
        assert_eq!(ring.peek(), Some(&"a"));
        assert_eq!(ring.len(), 1);
        assert_eq!(ring.dequeue(), Some("a"));
    }

    #[test]
    fn resize_compacts_wrapped_elements() {
        let mut ring = RingQueue::new(4).unwrap();
        for value in 0..4 {
            ring.enqueue(value).unwrap();
        }
        ring.dequeue();
        ring.dequeue();
        ring.enqueue(4).unwrap();
        ring.enqueue(5).unwrap();
        // Buffer now wraps; compaction must preserve 2, 3, 4, 5.
        ring.resize(8).unwrap();
        assert_eq!(ring.capacity(), 8);
        for expected in 2..6 {
            assert_eq!(ring.dequeue(), Some(expected));
        }

        let mut ring = RingQueue::new(4).unwrap();
        ring.enqueue(1).unwrap();
        ring.enqueue(2).unwrap();
        assert_eq!(ring.resize(1).unwrap_err(), RingError::WouldTruncate);
        assert_eq!(ring.resize(0).unwrap_err(), RingError::InvalidCapacity);
    }

    #[test]
    fn clear_drops_remaining_elements() {
        struct Counted(Arc<AtomicUsize>);
        impl Drop for Counted {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let drops = Arc::new(AtomicUsize::new(0));
        let mut ring = RingQueue::new(4).unwrap();
        for _ in 0..3 {
            assert!(ring.enqueue(Counted(Arc::clone(&drops))).is_ok());
        }
        ring.clear();
        assert_eq!(drops.load(Ordering::SeqCst), 3);
        assert!(ring.is_empty());

        for _ in 0..2 {
            assert!(ring.enqueue(Counted(Arc::clone(&drops))).is_ok());
        }
        drop(ring);
        assert_eq!(drops.load(Ordering::SeqCst), 5);
    }
}
