use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use log::trace;

use crate::event_loop::EventLoop;
use crate::{sys, Interest};

pub(crate) type Handler = Arc<dyn Fn() + Send + Sync>;

/// Binds one file descriptor to one [`EventLoop`].
///
/// The channel owns its fd: it is closed exactly once, when the channel is
/// closed or dropped, and the poller registration is removed with it. A
/// channel belongs to the loop it was created on for its entire life.
///
/// Handlers run on the loop thread only.
pub struct Channel {
    event_loop: Weak<EventLoop>,
    fd: RawFd,
    id: u64,
    interest: Mutex<Interest>,
    read_handler: Mutex<Option<Handler>>,
    write_handler: Mutex<Option<Handler>>,
    closed: AtomicBool,
}

impl Channel {
    /// Register `fd` with the loop's poller. On failure the fd is closed;
    /// the caller handed over ownership either way.
    pub(crate) fn new(
        event_loop: &Arc<EventLoop>,
        fd: RawFd,
        interest: Interest,
    ) -> io::Result<Arc<Channel>> {
        let id = event_loop.next_channel_id();
        let channel = Arc::new(Channel {
            event_loop: Arc::downgrade(event_loop),
            fd,
            id,
            interest: Mutex::new(interest),
            read_handler: Mutex::new(None),
            write_handler: Mutex::new(None),
            closed: AtomicBool::new(false),
        });
        match event_loop.add_channel(&channel) {
            Ok(()) => {
                trace!("channel {} registered fd {} ({:?})", id, fd, interest);
                Ok(channel)
            }
            Err(err) => {
                channel.closed.store(true, Ordering::Release);
                sys::net::close(fd);
                Err(err)
            }
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub fn interest(&self) -> Interest {
        *self.interest.lock().unwrap()
    }

    pub(crate) fn on_read(&self, handler: impl Fn() + Send + Sync + 'static) {
        *self.read_handler.lock().unwrap() = Some(Arc::new(handler));
    }

    pub(crate) fn on_write(&self, handler: impl Fn() + Send + Sync + 'static) {
        *self.write_handler.lock().unwrap() = Some(Arc::new(handler));
    }

    /// Replace the interest set.
    pub fn set_interest(&self, interest: Interest) -> io::Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        *self.interest.lock().unwrap() = interest;
        match self.event_loop.upgrade() {
            Some(event_loop) => event_loop.poller().modify(self.fd, self.id, interest),
            None => Ok(()),
        }
    }

    /// Arm or disarm write interest, leaving read interest untouched.
    pub fn enable_write(&self, enable: bool) -> io::Result<()> {
        let current = self.interest();
        let next = if enable {
            current | Interest::WRITABLE
        } else {
            match current.remove(Interest::WRITABLE) {
                Some(interest) => interest,
                None => return Ok(()),
            }
        };
        if next == current {
            return Ok(());
        }
        self.set_interest(next)
    }

    pub fn has_write_interest(&self) -> bool {
        self.interest().is_writable()
    }

    // Handlers are cloned out before the call, so a handler may replace or
    // clear itself without deadlocking.
    pub(crate) fn invoke_read(&self) {
        let handler = self.read_handler.lock().unwrap().clone();
        if let Some(handler) = handler {
            handler();
        }
    }

    pub(crate) fn invoke_write(&self) {
        let handler = self.write_handler.lock().unwrap().clone();
        if let Some(handler) = handler {
            handler();
        }
    }

    /// Deregister and close the fd. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        trace!("channel {} closed fd {}", self.id, self.fd);
        self.read_handler.lock().unwrap().take();
        self.write_handler.lock().unwrap().take();
        if let Some(event_loop) = self.event_loop.upgrade() {
            event_loop.remove_channel(self.id, self.fd);
        }
        sys::net::close(self.fd);
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            if let Some(event_loop) = self.event_loop.upgrade() {
                let _ = event_loop.poller().remove(self.fd);
            }
            sys::net::close(self.fd);
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("fd", &self.fd)
            .field("interest", &self.interest())
            .finish()
    }
}
