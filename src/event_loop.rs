use std::collections::HashMap;
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::{Duration, Instant};
use std::{cmp, thread};

use log::{error, trace, warn};

use crate::channel::Channel;
use crate::idle::{IdleCallback, IdleId, IdleStore};
use crate::poller::{Events, Poller};
use crate::queue::TaskQueue;
use crate::tcp::TcpConn;
use crate::timer::{Firing, TimerId, TimerStore};
use crate::{sys, Interest};

// Token reserved for the loop's wakeup pipe.
const WAKER: u64 = u64::MAX;

/// Milliseconds since a process-wide monotonic anchor.
pub(crate) fn now_ms() -> i64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START.get_or_init(Instant::now).elapsed().as_millis() as i64
}

pub(crate) fn now_s() -> u64 {
    (now_ms() / 1_000) as u64
}

type Task = Box<dyn FnOnce() + Send>;

/// Configures an [`EventLoop`] before it is built.
#[derive(Clone, Debug)]
pub struct EventLoopBuilder {
    event_capacity: usize,
    task_capacity: usize,
}

impl EventLoopBuilder {
    pub fn new() -> EventLoopBuilder {
        EventLoopBuilder {
            event_capacity: 2_048,
            task_capacity: 0,
        }
    }

    /// Maximum number of readiness events a single poll can report.
    ///
    /// The default value for this is 2048.
    pub fn event_capacity(&mut self, capacity: usize) -> &mut Self {
        self.event_capacity = cmp::max(capacity, 1);
        self
    }

    /// Maximum number of tasks that can be queued through
    /// [`EventLoop::safe_call`] before a push fails; 0 means unbounded.
    pub fn task_capacity(&mut self, capacity: usize) -> &mut Self {
        self.task_capacity = capacity;
        self
    }

    /// Construct the loop. The loop is not running yet; see
    /// [`EventLoop::run`].
    pub fn build(&self) -> io::Result<Arc<EventLoop>> {
        let poller = Poller::new()?;
        let waker = sys::Waker::new()?;
        poller.add(waker.as_raw_fd(), WAKER, Interest::READABLE)?;
        let events = Events::with_capacity(self.event_capacity);
        let task_capacity = self.task_capacity;
        Ok(Arc::new_cyclic(|weak| EventLoop {
            weak: weak.clone(),
            poller,
            events: Mutex::new(events),
            channels: Mutex::new(HashMap::new()),
            timers: Mutex::new(TimerStore::new()),
            idle: Mutex::new(IdleStore::new()),
            idle_sweeper: Mutex::new(None),
            tasks: TaskQueue::with_capacity(task_capacity),
            waker,
            exiting: AtomicBool::new(false),
            next_channel_id: AtomicU64::new(1),
            timer_seq: AtomicI64::new(0),
            reconnects: Mutex::new(HashMap::new()),
        }))
    }
}

impl Default for EventLoopBuilder {
    fn default() -> EventLoopBuilder {
        EventLoopBuilder::new()
    }
}

/// A single-threaded reactor.
///
/// An `EventLoop` owns one [`Poller`], a timer store, an idle tracker and a
/// task-injection pipe. [`run`] drives all of them from one thread; every
/// handler and timer task runs on that thread, to completion, and must not
/// block. The only public operations safe to call from other threads are the
/// ones documented as such — most importantly [`safe_call`], [`run_at`],
/// [`cancel`] and [`exit`].
///
/// [`run`]: EventLoop::run
/// [`safe_call`]: EventLoop::safe_call
/// [`run_at`]: EventLoop::run_at
/// [`cancel`]: EventLoop::cancel
/// [`exit`]: EventLoop::exit
pub struct EventLoop {
    weak: Weak<EventLoop>,
    poller: Poller,
    events: Mutex<Events>,
    channels: Mutex<HashMap<u64, Arc<Channel>>>,
    timers: Mutex<TimerStore>,
    idle: Mutex<IdleStore>,
    idle_sweeper: Mutex<Option<TimerId>>,
    tasks: TaskQueue<Task>,
    waker: sys::Waker,
    exiting: AtomicBool,
    next_channel_id: AtomicU64,
    timer_seq: AtomicI64,
    // Keeps reconnecting connections alive between attempts.
    reconnects: Mutex<HashMap<u64, Arc<TcpConn>>>,
}

impl EventLoop {
    /// An `EventLoop` with default configuration.
    pub fn new() -> io::Result<Arc<EventLoop>> {
        EventLoopBuilder::new().build()
    }

    /// Run the reactor until [`exit`] is observed.
    ///
    /// After the exit flag is seen one extra zero-timeout pass runs, so
    /// tasks injected alongside the exit request are still drained.
    ///
    /// [`exit`]: EventLoop::exit
    pub fn run(&self) {
        while !self.exiting.load(Ordering::Acquire) {
            if let Err(err) = self.run_once(10_000) {
                error!("poll failed: {}", err);
            }
        }
        let _ = self.run_once(0);
    }

    /// One reactor cycle: poll for at most `max_wait_ms` (clamped by the
    /// next timer deadline), dispatch ready channels, then fire due timers.
    pub fn run_once(&self, max_wait_ms: i64) -> io::Result<()> {
        let wait = cmp::min(max_wait_ms, self.next_timer_delay_ms());
        {
            let mut events = self.events.lock().unwrap();
            self.poller.wait(&mut events, wait)?;
            // Dispatch in reverse arrival order. A handler may close other
            // channels in the same batch, so every channel is looked up
            // afresh; a stale token simply no longer resolves.
            for event in events.iter().rev() {
                if event.token() == WAKER {
                    self.drain_wakes();
                    continue;
                }
                let channel = self.channels.lock().unwrap().get(&event.token()).cloned();
                let Some(channel) = channel else { continue };
                if event.is_readable() {
                    channel.invoke_read();
                } else if event.is_writable() {
                    channel.invoke_write();
                } else {
                    // The selector only reports what was asked for; anything
                    // else is an implementation bug.
                    error!("event for channel {} is neither read nor write", event.token());
                    debug_assert!(false, "unexpected poll event");
                }
            }
        }
        self.fire_timers();
        Ok(())
    }

    /// Schedule `task` for `at_ms` (loop time, as in [`now_ms`]); an
    /// `interval_ms > 0` makes it repeat. Safe from any thread.
    ///
    /// [`now_ms`]: Self::now_ms
    pub fn run_at(
        &self,
        at_ms: i64,
        task: impl FnMut() + Send + 'static,
        interval_ms: i64,
    ) -> TimerId {
        let seq = self.timer_seq.fetch_add(1, Ordering::Relaxed);
        let id;
        {
            let mut timers = self.timers.lock().unwrap();
            if interval_ms > 0 {
                // The public id flips the deadline's sign; it needs a
                // non-zero deadline to stay distinguishable.
                let at_ms = cmp::max(at_ms, 1);
                let first = (at_ms, self.timer_seq.fetch_add(1, Ordering::Relaxed));
                timers.schedule_repeating((-at_ms, seq), interval_ms, first, Box::new(task));
                id = TimerId::new(-at_ms, seq);
            } else {
                timers.schedule_once((at_ms, seq), Box::new(task));
                id = TimerId::new(at_ms, seq);
            }
        }
        // The poll may be sleeping past the new deadline.
        self.wakeup();
        id
    }

    /// Schedule `task` to run `delay_ms` from now. Safe from any thread.
    pub fn run_after(
        &self,
        delay_ms: i64,
        task: impl FnMut() + Send + 'static,
        interval_ms: i64,
    ) -> TimerId {
        self.run_at(now_ms() + cmp::max(delay_ms, 0), task, interval_ms)
    }

    /// Cancel a timer. Idempotent; `true` only when a live entry was
    /// removed. A task already executing cannot be cancelled.
    pub fn cancel(&self, id: TimerId) -> bool {
        self.timers.lock().unwrap().cancel(id)
    }

    /// Current loop time in milliseconds.
    pub fn now_ms(&self) -> i64 {
        now_ms()
    }

    /// Enqueue `task` to run on the loop thread, exactly once, in push
    /// order. Safe from any thread.
    pub fn safe_call(&self, task: impl FnOnce() + Send + 'static) {
        if !self.tasks.push(Box::new(task)) {
            warn!("task queue closed or full; dropping injected task");
            return;
        }
        self.wakeup();
    }

    /// Break an in-progress poll. Safe from any thread.
    pub fn wakeup(&self) {
        if let Err(err) = self.waker.wake() {
            error!("wakeup failed: {}", err);
        }
    }

    /// Ask the loop to stop. Idempotent, safe from any thread.
    pub fn exit(&self) {
        if !self.exiting.swap(true, Ordering::AcqRel) {
            trace!("loop exit requested");
            // Reconnecting connections hold this loop; letting them go here
            // breaks the cycle so an exited loop can actually be dropped.
            self.reconnects.lock().unwrap().clear();
            self.wakeup();
        }
    }

    pub fn exiting(&self) -> bool {
        self.exiting.load(Ordering::Acquire)
    }

    fn drain_wakes(&self) {
        self.waker.drain();
        while let Some(task) = self.tasks.pop_wait(Some(Duration::ZERO)) {
            task();
        }
    }

    fn next_timer_delay_ms(&self) -> i64 {
        self.timers.lock().unwrap().next_delay_ms(now_ms())
    }

    fn fire_timers(&self) {
        let now = now_ms();
        let due = {
            let mut timers = self.timers.lock().unwrap();
            timers.take_due(now, || self.timer_seq.fetch_add(1, Ordering::Relaxed))
        };
        for firing in due {
            let result = match firing {
                Firing::Once(mut task) => panic::catch_unwind(AssertUnwindSafe(move || task())),
                Firing::Tick(cell) => {
                    // A previous panic must not wedge later ticks.
                    let mut task = match cell.lock() {
                        Ok(guard) => guard,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                    panic::catch_unwind(AssertUnwindSafe(|| (*task)()))
                }
            };
            if result.is_err() {
                error!("timer task panicked");
            }
        }
    }

    pub(crate) fn poller(&self) -> &Poller {
        &self.poller
    }

    pub(crate) fn next_channel_id(&self) -> u64 {
        self.next_channel_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn add_channel(&self, channel: &Arc<Channel>) -> io::Result<()> {
        self.poller
            .add(channel.fd(), channel.id(), channel.interest())?;
        self.channels
            .lock()
            .unwrap()
            .insert(channel.id(), Arc::clone(channel));
        Ok(())
    }

    pub(crate) fn remove_channel(&self, id: u64, fd: RawFd) {
        self.channels.lock().unwrap().remove(&id);
        // The kernel drops registrations of closed fds on its own; a failure
        // here is expected in that case.
        let _ = self.poller.remove(fd);
    }

    pub(crate) fn register_idle(
        &self,
        timeout_s: u64,
        conn: &Arc<TcpConn>,
        callback: IdleCallback,
    ) -> IdleId {
        let id = self
            .idle
            .lock()
            .unwrap()
            .register(cmp::max(timeout_s, 1), conn, callback, now_s());
        self.ensure_idle_sweeper();
        id
    }

    pub(crate) fn update_idle(&self, id: IdleId) {
        self.idle.lock().unwrap().update(id, now_s());
    }

    pub(crate) fn unregister_idle(&self, id: IdleId) {
        self.idle.lock().unwrap().unregister(id);
    }

    // The sweep timer is armed lazily with the first registration and then
    // ticks once a second for the life of the loop.
    fn ensure_idle_sweeper(&self) {
        let mut sweeper = self.idle_sweeper.lock().unwrap();
        if sweeper.is_some() {
            return;
        }
        let weak = self.weak.clone();
        let id = self.run_after(
            1_000,
            move || {
                if let Some(event_loop) = weak.upgrade() {
                    event_loop.sweep_idle();
                }
            },
            1_000,
        );
        *sweeper = Some(id);
    }

    fn sweep_idle(&self) {
        let fired = self.idle.lock().unwrap().sweep(now_s());
        for (conn, callback) in fired {
            if let Some(conn) = conn.upgrade() {
                callback(&conn);
            }
        }
    }

    pub(crate) fn reconnect_keep(&self, conn: Arc<TcpConn>) {
        self.reconnects.lock().unwrap().insert(conn.id(), conn);
    }

    pub(crate) fn reconnect_release(&self, id: u64) {
        self.reconnects.lock().unwrap().remove(&id);
    }
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("channels", &self.channels.lock().unwrap().len())
            .field("exiting", &self.exiting())
            .finish()
    }
}

/// A round-robin pool of [`EventLoop`]s.
///
/// [`run`] drives the first loop on the calling thread and each remaining
/// loop on its own thread. [`alloc`] is the sole placement policy for new
/// connections.
///
/// [`run`]: LoopGroup::run
/// [`alloc`]: LoopGroup::alloc
pub struct LoopGroup {
    loops: Vec<Arc<EventLoop>>,
    next: AtomicUsize,
}

impl LoopGroup {
    /// A group of `loops` event loops (at least one).
    pub fn new(loops: usize) -> io::Result<Arc<LoopGroup>> {
        let loops = (0..cmp::max(loops, 1))
            .map(|_| EventLoop::new())
            .collect::<io::Result<Vec<_>>>()?;
        Ok(Arc::new(LoopGroup {
            loops,
            next: AtomicUsize::new(0),
        }))
    }

    /// Pick a loop by atomic round-robin.
    pub fn alloc(&self) -> &Arc<EventLoop> {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.loops.len();
        &self.loops[index]
    }

    pub fn loops(&self) -> &[Arc<EventLoop>] {
        &self.loops
    }

    /// Run every loop; the caller drives the first one, the rest get a
    /// thread each. Returns once all loops have exited.
    pub fn run(&self) {
        let mut handles = Vec::new();
        for (i, event_loop) in self.loops.iter().enumerate().skip(1) {
            let event_loop = Arc::clone(event_loop);
            match thread::Builder::new()
                .name(format!("deft-loop-{}", i))
                .spawn(move || event_loop.run())
            {
                Ok(handle) => handles.push(handle),
                Err(err) => error!("failed to spawn loop thread: {}", err),
            }
        }
        self.loops[0].run();
        for handle in handles {
            let _ = handle.join();
        }
    }

    /// Ask every loop to stop. Safe from any thread.
    pub fn exit(&self) {
        for event_loop in &self.loops {
            event_loop.exit();
        }
    }
}

impl std::fmt::Debug for LoopGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopGroup")
            .field("loops", &self.loops.len())
            .finish()
    }
}
