use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// A bounded multi-producer multi-consumer queue.
///
/// This is the queue behind both [`EventLoop::safe_call`] and
/// [`ThreadPool`]: producers on any thread, consumers on any thread, FIFO
/// order per consumer. Closing the queue refuses new items but never drops
/// the ones already queued; consumers keep draining until empty.
///
/// [`EventLoop::safe_call`]: crate::EventLoop::safe_call
/// [`ThreadPool`]: crate::ThreadPool
pub struct TaskQueue<T> {
    inner: Mutex<Inner<T>>,
    not_empty: Condvar,
    capacity: usize,
}

struct Inner<T> {
    items: VecDeque<T>,
    closed: bool,
}

impl<T> TaskQueue<T> {
    /// An unbounded queue.
    pub fn new() -> TaskQueue<T> {
        TaskQueue::with_capacity(0)
    }

    /// A queue holding at most `capacity` items; 0 means unbounded.
    pub fn with_capacity(capacity: usize) -> TaskQueue<T> {
        TaskQueue {
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                closed: false,
            }),
            not_empty: Condvar::new(),
            capacity,
        }
    }

    /// Append an item, waking one waiter. Returns `false` when the queue is
    /// closed or full.
    pub fn push(&self, item: T) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return false;
        }
        if self.capacity > 0 && inner.items.len() >= self.capacity {
            return false;
        }
        inner.items.push_back(item);
        self.not_empty.notify_one();
        true
    }

    /// Pop the next item, waiting up to `timeout`.
    ///
    /// `None` waits forever; `Some(Duration::ZERO)` never blocks. Returns
    /// `None` promptly once the queue is closed and drained, whatever the
    /// timeout.
    pub fn pop_wait(&self, timeout: Option<Duration>) -> Option<T> {
        let mut inner = self.inner.lock().unwrap();
        match timeout {
            None => loop {
                if let Some(item) = inner.items.pop_front() {
                    return Some(item);
                }
                if inner.closed {
                    return None;
                }
                inner = self.not_empty.wait(inner).unwrap();
            },
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                loop {
                    if let Some(item) = inner.items.pop_front() {
                        return Some(item);
                    }
                    if inner.closed {
                        return None;
                    }
                    let now = Instant::now();
                    if now >= deadline {
                        return None;
                    }
                    let (guard, _) = self.not_empty.wait_timeout(inner, deadline - now).unwrap();
                    inner = guard;
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop accepting new items and wake every waiter. Idempotent.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.closed = true;
        drop(inner);
        self.not_empty.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }
}

impl<T> Default for TaskQueue<T> {
    fn default() -> TaskQueue<T> {
        TaskQueue::new()
    }
}
