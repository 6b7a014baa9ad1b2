use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::{cmp, mem, thread};

use log::error;

use crate::queue::TaskQueue;

type PoolTask = Box<dyn FnOnce() + Send>;

/// Fixed-size worker pool draining a shared [`TaskQueue`].
///
/// Workers run queued tasks to completion; a panicking task is logged and
/// swallowed, never taking its worker down. [`close`] refuses new work while
/// letting queued tasks drain; call [`join`] afterwards to wait for the
/// workers to finish.
///
/// [`close`]: ThreadPool::close
/// [`join`]: ThreadPool::join
pub struct ThreadPool {
    queue: Arc<TaskQueue<PoolTask>>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl ThreadPool {
    /// Spawn a pool of `workers` threads (at least one).
    pub fn new(workers: usize) -> io::Result<ThreadPool> {
        let queue = Arc::new(TaskQueue::new());
        let mut handles = Vec::new();
        for i in 0..cmp::max(workers, 1) {
            let queue = Arc::clone(&queue);
            let handle = thread::Builder::new()
                .name(format!("deft-worker-{}", i))
                .spawn(move || worker(&queue))?;
            handles.push(handle);
        }
        Ok(ThreadPool {
            queue,
            workers: Mutex::new(handles),
        })
    }

    /// Submit a task. Returns `false` once the pool is closed.
    pub fn push(&self, task: impl FnOnce() + Send + 'static) -> bool {
        self.queue.push(Box::new(task))
    }

    /// Refuse new tasks; queued ones still run. Idempotent.
    pub fn close(&self) {
        self.queue.close();
    }

    /// Wait for every worker to finish. Only sensible after [`close`].
    ///
    /// [`close`]: ThreadPool::close
    pub fn join(&self) {
        let handles = mem::take(&mut *self.workers.lock().unwrap());
        for handle in handles {
            let _ = handle.join();
        }
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        // Unblock any still-parked workers; they drain and exit on their
        // own. Joining belongs to `join`, not to drop.
        self.queue.close();
    }
}

fn worker(queue: &TaskQueue<PoolTask>) {
    while let Some(task) = queue.pop_wait(None) {
        // A panicking task must not unwind the worker.
        if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
            error!("worker task panicked");
        }
    }
}
