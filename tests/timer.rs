use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use deft::EventLoop;

mod util;

use util::{init, wait_for, LoopRunner};

#[test]
fn one_shot_fires() {
    let runner = LoopRunner::spawn();
    let fired = Arc::new(AtomicBool::new(false));

    let fired2 = Arc::clone(&fired);
    runner.event_loop().run_after(
        50,
        move || {
            fired2.store(true, Ordering::Relaxed);
        },
        0,
    );
    assert!(wait_for(Duration::from_secs(2), || {
        fired.load(Ordering::Relaxed)
    }));
}

// A cancelled timer never runs.
#[test]
fn cancel_before_fire() {
    let runner = LoopRunner::spawn();
    let fired = Arc::new(AtomicBool::new(false));

    let fired2 = Arc::clone(&fired);
    let id = runner.event_loop().run_after(
        200,
        move || {
            fired2.store(true, Ordering::Relaxed);
        },
        0,
    );
    assert!(runner.event_loop().cancel(id));
    // Idempotent: the entry is already gone.
    assert!(!runner.event_loop().cancel(id));

    thread::sleep(Duration::from_millis(400));
    assert!(!fired.load(Ordering::Relaxed));
}

#[test]
fn repeating_fires_on_schedule() {
    let runner = LoopRunner::spawn();
    let ticks = Arc::new(AtomicUsize::new(0));

    let ticks2 = Arc::clone(&ticks);
    let id = runner.event_loop().run_after(
        100,
        move || {
            ticks2.fetch_add(1, Ordering::Relaxed);
        },
        100,
    );

    // Roughly 100, 200, 300, 400 ms; leave slack for scheduling jitter.
    thread::sleep(Duration::from_millis(560));
    let seen = ticks.load(Ordering::Relaxed);
    assert!((3..=7).contains(&seen), "saw {} ticks", seen);

    assert!(runner.event_loop().cancel(id));
    let after_cancel = ticks.load(Ordering::Relaxed);
    thread::sleep(Duration::from_millis(300));
    assert_eq!(ticks.load(Ordering::Relaxed), after_cancel);
}

#[test]
fn timers_fire_in_deadline_order() {
    init();

    let event_loop = EventLoop::new().unwrap();
    let order = Arc::new(std::sync::Mutex::new(Vec::new()));

    for (delay, tag) in [(90, 'c'), (30, 'a'), (60, 'b')] {
        let order = Arc::clone(&order);
        event_loop.run_after(
            delay,
            move || {
                order.lock().unwrap().push(tag);
            },
            0,
        );
    }

    let runner = LoopRunner::from_loop(event_loop);
    assert!(wait_for(Duration::from_secs(2), || {
        order.lock().unwrap().len() == 3
    }));
    assert_eq!(*order.lock().unwrap(), vec!['a', 'b', 'c']);
    drop(runner);
}

#[test]
fn panicking_timer_task_is_swallowed() {
    let runner = LoopRunner::spawn();
    let fired = Arc::new(AtomicBool::new(false));

    runner.event_loop().run_after(20, || panic!("deliberate"), 0);
    let fired2 = Arc::clone(&fired);
    runner.event_loop().run_after(
        60,
        move || {
            fired2.store(true, Ordering::Relaxed);
        },
        0,
    );

    assert!(wait_for(Duration::from_secs(2), || {
        fired.load(Ordering::Relaxed)
    }));
}
