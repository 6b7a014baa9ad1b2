use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use deft::TaskQueue;

mod util;

use util::init;

#[test]
fn pop_zero_timeout_returns_immediately() {
    init();

    let queue: TaskQueue<u32> = TaskQueue::new();
    let start = Instant::now();
    assert_eq!(queue.pop_wait(Some(Duration::ZERO)), None);
    assert!(start.elapsed() < Duration::from_millis(100));
}

#[test]
fn fifo_order() {
    init();

    let queue = TaskQueue::new();
    for i in 0..8 {
        assert!(queue.push(i));
    }
    assert_eq!(queue.len(), 8);
    for i in 0..8 {
        assert_eq!(queue.pop_wait(Some(Duration::ZERO)), Some(i));
    }
}

#[test]
fn capacity_refuses_excess() {
    init();

    let queue = TaskQueue::with_capacity(2);
    assert!(queue.push(1));
    assert!(queue.push(2));
    assert!(!queue.push(3));
    assert_eq!(queue.pop_wait(Some(Duration::ZERO)), Some(1));
    assert!(queue.push(3));
}

#[test]
fn bounded_wait_times_out() {
    init();

    let queue: TaskQueue<u32> = TaskQueue::new();
    let start = Instant::now();
    assert_eq!(queue.pop_wait(Some(Duration::from_millis(50))), None);
    assert!(start.elapsed() >= Duration::from_millis(50));
}

#[test]
fn infinite_wait_unblocked_by_push() {
    init();

    let queue = Arc::new(TaskQueue::new());
    let consumer = {
        let queue = Arc::clone(&queue);
        thread::spawn(move || queue.pop_wait(None))
    };
    thread::sleep(Duration::from_millis(50));
    assert!(queue.push(7u32));
    assert_eq!(consumer.join().unwrap(), Some(7));
}

#[test]
fn infinite_wait_unblocked_by_close() {
    init();

    let queue: Arc<TaskQueue<u32>> = Arc::new(TaskQueue::new());
    let consumer = {
        let queue = Arc::clone(&queue);
        thread::spawn(move || queue.pop_wait(None))
    };
    thread::sleep(Duration::from_millis(50));
    queue.close();
    assert_eq!(consumer.join().unwrap(), None);
}

// Closing refuses new items but never drops queued ones.
#[test]
fn close_drains_but_refuses() {
    init();

    let queue = TaskQueue::new();
    assert!(queue.push(1));
    assert!(queue.push(2));
    queue.close();
    queue.close(); // idempotent
    assert!(!queue.push(3));
    assert_eq!(queue.pop_wait(None), Some(1));
    assert_eq!(queue.pop_wait(None), Some(2));
    assert_eq!(queue.pop_wait(None), None);
}
