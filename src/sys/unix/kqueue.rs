use std::mem::MaybeUninit;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::{cmp, io, ptr, slice};

use crate::Interest;

// Type of the `nchanges` and `nevents` parameters in the `kevent` function.
#[cfg(not(target_os = "netbsd"))]
type Count = libc::c_int;
#[cfg(target_os = "netbsd")]
type Count = libc::size_t;

// Type of the `filter` field in the `kevent` structure.
#[cfg(any(
    target_os = "dragonfly",
    target_os = "freebsd",
    target_os = "openbsd"
))]
type Filter = libc::c_short;
#[cfg(any(target_os = "ios", target_os = "macos"))]
type Filter = i16;
#[cfg(target_os = "netbsd")]
type Filter = u32;

// Type of the `data` field in the `kevent` structure.
#[cfg(any(
    target_os = "dragonfly",
    target_os = "freebsd",
    target_os = "ios",
    target_os = "macos"
))]
type Data = libc::intptr_t;
#[cfg(any(target_os = "netbsd", target_os = "openbsd"))]
type Data = i64;

// Type of the `udata` field in the `kevent` structure.
#[cfg(not(target_os = "netbsd"))]
type UData = *mut libc::c_void;
#[cfg(target_os = "netbsd")]
type UData = libc::intptr_t;

macro_rules! kevent {
    ($id: expr, $filter: expr, $flags: expr, $data: expr) => {
        libc::kevent {
            ident: $id as libc::uintptr_t,
            filter: $filter as Filter,
            flags: $flags,
            fflags: 0,
            data: 0,
            udata: $data as usize as UData,
        }
    };
}

#[derive(Debug)]
pub(crate) struct Selector {
    kq: OwnedFd,
}

impl Selector {
    pub fn new() -> io::Result<Selector> {
        let kq = syscall!(kqueue())?;
        match syscall!(fcntl(kq, libc::F_SETFD, libc::FD_CLOEXEC)) {
            // SAFETY: `kqueue(2)` ensures the fd is valid.
            Ok(_) => Ok(Selector {
                kq: unsafe { OwnedFd::from_raw_fd(kq) },
            }),
            Err(err) => {
                let _ = syscall!(close(kq));
                Err(err)
            }
        }
    }

    pub fn select(&self, events: &mut Events, timeout_ms: i64) -> io::Result<()> {
        let timeout = if timeout_ms < 0 {
            None
        } else {
            Some(libc::timespec {
                tv_sec: cmp::min(timeout_ms / 1_000, libc::time_t::MAX as i64) as libc::time_t,
                tv_nsec: ((timeout_ms % 1_000) * 1_000_000) as libc::c_long,
            })
        };
        let timeout = timeout.as_ref().map(|s| s as *const _).unwrap_or(ptr::null());

        events.clear();
        match syscall!(kevent(
            self.kq.as_raw_fd(),
            ptr::null(),
            0,
            events.as_mut_ptr(),
            events.capacity() as Count,
            timeout,
        )) {
            Ok(n_events) => {
                // SAFETY: `kevent` ensures that `n_events` are assigned.
                unsafe { events.set_len(n_events as usize) };
                Ok(())
            }
            // An interrupted wait counts as an empty one.
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => Ok(()),
            Err(err) => Err(err),
        }
    }

    pub fn register(&self, fd: RawFd, token: u64, interests: Interest) -> io::Result<()> {
        // Level triggered, like the epoll side: no `EV_CLEAR`.
        let flags = libc::EV_ADD | libc::EV_ENABLE | libc::EV_RECEIPT;
        // At most we need two changes, but maybe we only need 1.
        let mut changes: [MaybeUninit<libc::kevent>; 2] =
            [MaybeUninit::uninit(), MaybeUninit::uninit()];
        let mut n_changes = 0;

        if interests.is_writable() {
            let kevent = kevent!(fd, libc::EVFILT_WRITE, flags, token);
            changes[n_changes] = MaybeUninit::new(kevent);
            n_changes += 1;
        }

        if interests.is_readable() {
            let kevent = kevent!(fd, libc::EVFILT_READ, flags, token);
            changes[n_changes] = MaybeUninit::new(kevent);
            n_changes += 1;
        }

        // Older versions of macOS can return EPIPE when registering a pipe
        // file descriptor where the other end has already disappeared, while
        // still reporting events for it, so `EPIPE` is ignored here.
        let changes = unsafe {
            // This is safe because we ensure that at least `n_changes` are in
            // the array.
            slice::from_raw_parts_mut(changes[0].as_mut_ptr(), n_changes)
        };
        kevent_register(self.kq.as_raw_fd(), changes, &[libc::EPIPE as Data])
    }

    pub fn reregister(&self, fd: RawFd, token: u64, interests: Interest) -> io::Result<()> {
        let flags = libc::EV_RECEIPT;
        let write_flags = if interests.is_writable() {
            flags | libc::EV_ADD | libc::EV_ENABLE
        } else {
            flags | libc::EV_DELETE
        };
        let read_flags = if interests.is_readable() {
            flags | libc::EV_ADD | libc::EV_ENABLE
        } else {
            flags | libc::EV_DELETE
        };

        let mut changes: [libc::kevent; 2] = [
            kevent!(fd, libc::EVFILT_WRITE, write_flags, token),
            kevent!(fd, libc::EVFILT_READ, read_flags, token),
        ];

        // kqueue can't tell us with which interests the fd was registered, so
        // both filters are modified: added when wanted, deleted otherwise.
        // `ENOENT` means a deleted filter wasn't there in the first place,
        // which is fine. For the explanation of `EPIPE` see `register`.
        kevent_register(
            self.kq.as_raw_fd(),
            &mut changes,
            &[libc::ENOENT as Data, libc::EPIPE as Data],
        )
    }

    pub fn deregister(&self, fd: RawFd) -> io::Result<()> {
        let flags = libc::EV_DELETE | libc::EV_RECEIPT;
        let mut changes: [libc::kevent; 2] = [
            kevent!(fd, libc::EVFILT_WRITE, flags, 0),
            kevent!(fd, libc::EVFILT_READ, flags, 0),
        ];

        // `ENOENT` is fine for the same reason as in `reregister`.
        kevent_register(self.kq.as_raw_fd(), &mut changes, &[libc::ENOENT as Data])
    }
}

fn kevent_register(
    kq: RawFd,
    changes: &mut [libc::kevent],
    ignored_errors: &[Data],
) -> io::Result<()> {
    syscall!(kevent(
        kq,
        changes.as_ptr(),
        changes.len() as Count,
        changes.as_mut_ptr(),
        changes.len() as Count,
        ptr::null(),
    ))
    .map(|_| ())
    .and_then(|()| check_errors(changes, ignored_errors))
}

fn check_errors(events: &[libc::kevent], ignored_errors: &[Data]) -> io::Result<()> {
    for event in events {
        // We can't use references to packed structures (in checking the ignored
        // errors), so we need copies of the data.
        let data = event.data as Data;
        if (event.flags & libc::EV_ERROR != 0) && data != 0 && !ignored_errors.contains(&data) {
            return Err(io::Error::from_raw_os_error(data as i32));
        }
    }
    Ok(())
}

impl AsRawFd for Selector {
    fn as_raw_fd(&self) -> RawFd {
        self.kq.as_raw_fd()
    }
}

pub(crate) type Event = libc::kevent;
pub(crate) type Events = Vec<Event>;

pub(crate) mod event {
    use super::UData;
    use crate::sys::Event;

    pub fn token(event: &Event) -> u64 {
        (event.udata as UData) as usize as u64
    }

    pub fn is_readable(event: &Event) -> bool {
        // EOF is promoted to a read event so the read path can observe it.
        event.filter == libc::EVFILT_READ || (event.flags & libc::EV_EOF) != 0
    }

    pub fn is_writable(event: &Event) -> bool {
        event.filter == libc::EVFILT_WRITE && (event.flags & libc::EV_EOF) == 0
    }
}
