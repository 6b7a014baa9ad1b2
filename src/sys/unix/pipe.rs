use std::io;
use std::os::fd::RawFd;

/// Create a `[receiver, sender]` pipe pair, non-blocking and close-on-exec.
pub(crate) fn new_raw() -> io::Result<[RawFd; 2]> {
    let mut fds: [RawFd; 2] = [-1, -1];

    #[cfg(any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "linux",
        target_os = "netbsd",
        target_os = "openbsd"
    ))]
    syscall!(pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC))?;

    // Darwin doesn't have `pipe2(2)`; if a `fcntl` fails after the pipe has
    // been created, `close` ensures the fds do not leak.
    #[cfg(any(target_os = "ios", target_os = "macos"))]
    {
        syscall!(pipe(fds.as_mut_ptr()))?;
        for fd in &fds {
            syscall!(fcntl(*fd, libc::F_SETFL, libc::O_NONBLOCK))
                .and_then(|_| syscall!(fcntl(*fd, libc::F_SETFD, libc::FD_CLOEXEC)))
                .map_err(|err| {
                    let _ = syscall!(close(fds[0]));
                    let _ = syscall!(close(fds[1]));
                    err
                })?;
        }
    }

    Ok(fds)
}
