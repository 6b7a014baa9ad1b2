use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use deft::ThreadPool;

mod util;

use util::{init, wait_for};

// Every submitted task runs exactly once.
#[test]
fn tasks_run_exactly_once() {
    init();

    let pool = ThreadPool::new(4).unwrap();
    let counter = Arc::new(AtomicUsize::new(0));
    for _ in 0..100 {
        let counter = Arc::clone(&counter);
        assert!(pool.push(move || {
            counter.fetch_add(1, Ordering::Relaxed);
        }));
    }
    pool.close();
    pool.join();
    assert_eq!(counter.load(Ordering::Relaxed), 100);
}

#[test]
fn panicking_task_does_not_kill_worker() {
    init();

    let pool = ThreadPool::new(1).unwrap();
    let counter = Arc::new(AtomicUsize::new(0));

    assert!(pool.push(|| panic!("deliberate")));
    let counter2 = Arc::clone(&counter);
    assert!(pool.push(move || {
        counter2.fetch_add(1, Ordering::Relaxed);
    }));

    assert!(wait_for(Duration::from_secs(2), || {
        counter.load(Ordering::Relaxed) == 1
    }));
    pool.close();
    pool.join();
}

#[test]
fn close_refuses_new_tasks() {
    init();

    let pool = ThreadPool::new(2).unwrap();
    pool.close();
    assert!(!pool.push(|| {}));
    pool.join();
}
