use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use deft::{EventLoop, EventLoopBuilder, LoopGroup};

mod util;

use util::{init, wait_for, LoopRunner};

// Tasks injected from other threads all run, exactly once, on the loop.
#[test]
fn safe_call_from_many_threads() {
    let runner = LoopRunner::spawn();
    let counter = Arc::new(AtomicUsize::new(0));

    let mut producers = Vec::new();
    for _ in 0..4 {
        let event_loop = Arc::clone(runner.event_loop());
        let counter = Arc::clone(&counter);
        producers.push(thread::spawn(move || {
            for _ in 0..250 {
                let counter = Arc::clone(&counter);
                event_loop.safe_call(move || {
                    counter.fetch_add(1, Ordering::Relaxed);
                });
            }
        }));
    }
    for producer in producers {
        producer.join().unwrap();
    }

    assert!(wait_for(Duration::from_secs(5), || {
        counter.load(Ordering::Relaxed) == 1_000
    }));
}

#[test]
fn safe_call_order_is_preserved() {
    let runner = LoopRunner::spawn();
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));

    for i in 0..64u32 {
        let seen = Arc::clone(&seen);
        runner.event_loop().safe_call(move || {
            seen.lock().unwrap().push(i);
        });
    }

    assert!(wait_for(Duration::from_secs(2), || {
        seen.lock().unwrap().len() == 64
    }));
    assert_eq!(*seen.lock().unwrap(), (0..64).collect::<Vec<_>>());
}

// Tasks injected before `run` are drained once the loop starts.
#[test]
fn tasks_queued_before_run() {
    init();

    let event_loop = EventLoop::new().unwrap();
    let counter = Arc::new(AtomicUsize::new(0));
    for _ in 0..10 {
        let counter = Arc::clone(&counter);
        event_loop.safe_call(move || {
            counter.fetch_add(1, Ordering::Relaxed);
        });
    }

    let runner = LoopRunner::from_loop(event_loop);
    assert!(wait_for(Duration::from_secs(2), || {
        counter.load(Ordering::Relaxed) == 10
    }));
    drop(runner);
}

#[test]
fn exit_is_idempotent() {
    init();

    let event_loop = EventLoop::new().unwrap();
    let inner = Arc::clone(&event_loop);
    let handle = thread::spawn(move || inner.run());

    event_loop.exit();
    event_loop.exit();
    handle.join().unwrap();
    assert!(event_loop.exiting());
}

#[test]
fn run_once_without_work() {
    init();

    let event_loop = EventLoopBuilder::new()
        .event_capacity(64)
        .build()
        .unwrap();
    event_loop.run_once(10).unwrap();
}

#[test]
fn group_round_robin_covers_all_loops() {
    init();

    let group = LoopGroup::new(3).unwrap();
    let a = Arc::as_ptr(group.alloc());
    let b = Arc::as_ptr(group.alloc());
    let c = Arc::as_ptr(group.alloc());
    let a2 = Arc::as_ptr(group.alloc());
    assert_ne!(a, b);
    assert_ne!(b, c);
    assert_ne!(a, c);
    assert_eq!(a, a2);
}

#[test]
fn group_runs_and_exits() {
    init();

    let group = LoopGroup::new(2).unwrap();
    let counter = Arc::new(AtomicUsize::new(0));
    for event_loop in group.loops() {
        let counter = Arc::clone(&counter);
        event_loop.safe_call(move || {
            counter.fetch_add(1, Ordering::Relaxed);
        });
    }

    let inner = Arc::clone(&group);
    let handle = thread::spawn(move || inner.run());
    assert!(wait_for(Duration::from_secs(2), || {
        counter.load(Ordering::Relaxed) == 2
    }));
    group.exit();
    handle.join().unwrap();
}
