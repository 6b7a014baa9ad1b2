use std::io;
use std::os::fd::RawFd;

use crate::{sys, Interest};

/// Polls for readiness events on all registered file descriptors.
///
/// `Poller` is backed by the selector provided by the operating system:
/// epoll on Linux and Android, kqueue on the BSDs and macOS. Registration is
/// level triggered; callers that stop caring about write readiness must say
/// so with [`modify`].
///
/// All operations except [`wait`] may be called from any thread; the events
/// buffer passed to `wait` belongs to the polling thread.
///
/// [`modify`]: Poller::modify
/// [`wait`]: Poller::wait
#[derive(Debug)]
pub struct Poller {
    selector: sys::Selector,
}

impl Poller {
    /// Create a new `Poller`.
    ///
    /// This makes a syscall to create the system selector; failure here is
    /// fatal for the loop that wanted it.
    pub fn new() -> io::Result<Poller> {
        sys::Selector::new().map(|selector| Poller { selector })
    }

    /// Start monitoring `fd` with the given interest, reported as `token`.
    pub fn add(&self, fd: RawFd, token: u64, interest: Interest) -> io::Result<()> {
        self.selector.register(fd, token, interest)
    }

    /// Change the interest set of an already registered `fd`.
    pub fn modify(&self, fd: RawFd, token: u64, interest: Interest) -> io::Result<()> {
        self.selector.reregister(fd, token, interest)
    }

    /// Stop monitoring `fd`.
    ///
    /// An fd closed by its owner is removed by the kernel on its own; calling
    /// this for such an fd reports an error that callers may ignore.
    pub fn remove(&self, fd: RawFd) -> io::Result<()> {
        self.selector.deregister(fd)
    }

    /// Wait for readiness, filling `events`.
    ///
    /// A negative `timeout_ms` waits forever. An interrupted wait (`EINTR`)
    /// is reported as an empty event set, never as an error.
    pub fn wait(&self, events: &mut Events, timeout_ms: i64) -> io::Result<()> {
        self.selector.select(&mut events.inner, timeout_ms)
    }
}

/// A collection of readiness events filled by [`Poller::wait`].
///
/// Usually one `Events` instance is created alongside a loop and reused for
/// every wait; its capacity caps how many events a single wait can report.
pub struct Events {
    inner: sys::Events,
}

/// One readiness event.
#[derive(Copy, Clone, Debug)]
pub struct Event {
    token: u64,
    readable: bool,
    writable: bool,
}

impl Events {
    /// Create a buffer able to hold `capacity` events per wait.
    pub fn with_capacity(capacity: usize) -> Events {
        Events {
            inner: Vec::with_capacity(capacity),
        }
    }

    /// Number of events received in the last wait.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Iterate over the last wait's events.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = Event> + '_ {
        self.inner.iter().map(|event| Event {
            token: sys::event::token(event),
            readable: sys::event::is_readable(event),
            writable: sys::event::is_writable(event),
        })
    }
}

impl std::fmt::Debug for Events {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Events").field("len", &self.len()).finish()
    }
}

impl Event {
    /// The token the fd was registered with.
    pub fn token(&self) -> u64 {
        self.token
    }

    /// True for read readiness and for error or hang-up conditions, which
    /// surface through the read path.
    pub fn is_readable(&self) -> bool {
        self.readable
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }
}
