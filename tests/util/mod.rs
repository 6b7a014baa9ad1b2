// Not all helpers are used by every test binary.
#![allow(dead_code)]

use std::net::TcpListener;
use std::sync::{Arc, Once};
use std::thread;
use std::time::{Duration, Instant};

use deft::{EventLoop, LoopGroup};

pub fn init() {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

/// An [`EventLoop`] running on a background thread; exits and joins on drop.
pub struct LoopRunner {
    event_loop: Arc<EventLoop>,
    handle: Option<thread::JoinHandle<()>>,
}

impl LoopRunner {
    pub fn spawn() -> LoopRunner {
        init();
        let event_loop = EventLoop::new().expect("unable to create event loop");
        LoopRunner::from_loop(event_loop)
    }

    /// Start running an already configured loop.
    pub fn from_loop(event_loop: Arc<EventLoop>) -> LoopRunner {
        init();
        let inner = Arc::clone(&event_loop);
        let handle = thread::spawn(move || inner.run());
        LoopRunner {
            event_loop,
            handle: Some(handle),
        }
    }

    pub fn event_loop(&self) -> &Arc<EventLoop> {
        &self.event_loop
    }
}

impl Drop for LoopRunner {
    fn drop(&mut self) {
        self.event_loop.exit();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// A [`LoopGroup`] running on a background thread; exits and joins on drop.
pub struct GroupRunner {
    group: Arc<LoopGroup>,
    handle: Option<thread::JoinHandle<()>>,
}

impl GroupRunner {
    pub fn spawn(loops: usize) -> GroupRunner {
        init();
        let group = LoopGroup::new(loops).expect("unable to create loop group");
        let inner = Arc::clone(&group);
        let handle = thread::spawn(move || inner.run());
        GroupRunner {
            group,
            handle: Some(handle),
        }
    }

    pub fn group(&self) -> &Arc<LoopGroup> {
        &self.group
    }
}

impl Drop for GroupRunner {
    fn drop(&mut self) {
        self.group.exit();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Poll `cond` until it holds or `timeout` passes.
pub fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    cond()
}

/// A port that was free a moment ago.
pub fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .and_then(|listener| listener.local_addr())
        .map(|addr| addr.port())
        .expect("unable to find a free port")
}
