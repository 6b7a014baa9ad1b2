use std::io;
use std::mem;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::fd::RawFd;

/// Create a non-blocking, close-on-exec `AF_INET` socket.
pub(crate) fn new_socket(socket_type: libc::c_int) -> io::Result<RawFd> {
    #[cfg(any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "linux",
        target_os = "netbsd",
        target_os = "openbsd"
    ))]
    let socket_type = socket_type | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC;

    let socket = syscall!(socket(libc::AF_INET, socket_type, 0))?;

    // Darwin does not have SOCK_NONBLOCK or SOCK_CLOEXEC.
    //
    // If a `fcntl` fails after the socket has been created, `close` ensures
    // the socket does not leak.
    #[cfg(any(target_os = "ios", target_os = "macos"))]
    syscall!(fcntl(socket, libc::F_SETFL, libc::O_NONBLOCK))
        .and_then(|_| syscall!(fcntl(socket, libc::F_SETFD, libc::FD_CLOEXEC)))
        .map_err(|err| {
            let _ = syscall!(close(socket));
            err
        })?;

    Ok(socket)
}

pub(crate) fn new_tcp_socket() -> io::Result<RawFd> {
    new_socket(libc::SOCK_STREAM)
}

pub(crate) fn new_udp_socket() -> io::Result<RawFd> {
    new_socket(libc::SOCK_DGRAM)
}

fn sockaddr_in(addr: SocketAddrV4) -> libc::sockaddr_in {
    // `sockaddr_in` layout differs between platforms (the BSDs carry a
    // `sin_len` field), so start zeroed and fill the common fields.
    let mut sin: libc::sockaddr_in = unsafe { mem::zeroed() };
    sin.sin_family = libc::AF_INET as libc::sa_family_t;
    sin.sin_port = addr.port().to_be();
    sin.sin_addr = libc::in_addr {
        s_addr: u32::from(*addr.ip()).to_be(),
    };
    sin
}

fn to_socket_addr(storage: &libc::sockaddr_in) -> SocketAddrV4 {
    SocketAddrV4::new(
        Ipv4Addr::from(u32::from_be(storage.sin_addr.s_addr)),
        u16::from_be(storage.sin_port),
    )
}

const ADDR_LEN: libc::socklen_t = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;

pub(crate) fn bind(fd: RawFd, addr: SocketAddrV4) -> io::Result<()> {
    let sin = sockaddr_in(addr);
    syscall!(bind(fd, &sin as *const _ as *const libc::sockaddr, ADDR_LEN)).map(|_| ())
}

pub(crate) fn listen(fd: RawFd, backlog: libc::c_int) -> io::Result<()> {
    syscall!(listen(fd, backlog)).map(|_| ())
}

pub(crate) fn connect(fd: RawFd, addr: SocketAddrV4) -> io::Result<()> {
    let sin = sockaddr_in(addr);
    match syscall!(connect(fd, &sin as *const _ as *const libc::sockaddr, ADDR_LEN)) {
        Ok(_) => Ok(()),
        // Connect hasn't finished, but that is fine.
        Err(ref err) if err.raw_os_error() == Some(libc::EINPROGRESS) => Ok(()),
        Err(err) => Err(err),
    }
}

/// Accept one pending connection, returning a non-blocking close-on-exec fd.
pub(crate) fn accept(fd: RawFd) -> io::Result<(RawFd, SocketAddrV4)> {
    let mut storage: libc::sockaddr_in = unsafe { mem::zeroed() };
    let mut len = ADDR_LEN;

    #[cfg(any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "linux",
        target_os = "netbsd",
        target_os = "openbsd"
    ))]
    let stream = syscall!(accept4(
        fd,
        &mut storage as *mut _ as *mut libc::sockaddr,
        &mut len,
        libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
    ))?;

    // `accept4(2)` is not available on Darwin.
    #[cfg(any(target_os = "ios", target_os = "macos"))]
    let stream = {
        let stream = syscall!(accept(
            fd,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
        ))?;
        syscall!(fcntl(stream, libc::F_SETFL, libc::O_NONBLOCK))
            .and_then(|_| syscall!(fcntl(stream, libc::F_SETFD, libc::FD_CLOEXEC)))
            .map_err(|err| {
                let _ = syscall!(close(stream));
                err
            })?;
        stream
    };

    Ok((stream, to_socket_addr(&storage)))
}

pub(crate) fn local_addr(fd: RawFd) -> io::Result<SocketAddrV4> {
    let mut storage: libc::sockaddr_in = unsafe { mem::zeroed() };
    let mut len = ADDR_LEN;
    syscall!(getsockname(
        fd,
        &mut storage as *mut _ as *mut libc::sockaddr,
        &mut len,
    ))?;
    Ok(to_socket_addr(&storage))
}

pub(crate) fn peer_addr(fd: RawFd) -> io::Result<SocketAddrV4> {
    let mut storage: libc::sockaddr_in = unsafe { mem::zeroed() };
    let mut len = ADDR_LEN;
    syscall!(getpeername(
        fd,
        &mut storage as *mut _ as *mut libc::sockaddr,
        &mut len,
    ))?;
    Ok(to_socket_addr(&storage))
}

fn set_opt(fd: RawFd, level: libc::c_int, opt: libc::c_int, value: libc::c_int) -> io::Result<()> {
    syscall!(setsockopt(
        fd,
        level,
        opt,
        &value as *const _ as *const libc::c_void,
        mem::size_of::<libc::c_int>() as libc::socklen_t,
    ))
    .map(|_| ())
}

pub(crate) fn set_reuseaddr(fd: RawFd) -> io::Result<()> {
    set_opt(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, 1)
}

pub(crate) fn set_reuseport(fd: RawFd) -> io::Result<()> {
    set_opt(fd, libc::SOL_SOCKET, libc::SO_REUSEPORT, 1)
}

pub(crate) fn set_nodelay(fd: RawFd, enable: bool) -> io::Result<()> {
    set_opt(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, enable as libc::c_int)
}

/// Poll `fd` once for write readiness; `Ok(true)` only when the descriptor
/// reports `POLLOUT` and nothing else.
pub(crate) fn poll_out(fd: RawFd) -> io::Result<bool> {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLOUT | libc::POLLERR,
        revents: 0,
    };
    syscall!(poll(&mut pfd, 1, 0))?;
    Ok(pfd.revents == libc::POLLOUT)
}

pub(crate) fn read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    syscall!(read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())).map(|n| n as usize)
}

pub(crate) fn write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    syscall!(write(fd, buf.as_ptr() as *const libc::c_void, buf.len())).map(|n| n as usize)
}

pub(crate) fn recv_from(fd: RawFd, buf: &mut [u8]) -> io::Result<(usize, SocketAddrV4)> {
    let mut storage: libc::sockaddr_in = unsafe { mem::zeroed() };
    let mut len = ADDR_LEN;
    let n = syscall!(recvfrom(
        fd,
        buf.as_mut_ptr() as *mut libc::c_void,
        buf.len(),
        0,
        &mut storage as *mut _ as *mut libc::sockaddr,
        &mut len,
    ))?;
    Ok((n as usize, to_socket_addr(&storage)))
}

pub(crate) fn send_to(fd: RawFd, buf: &[u8], addr: SocketAddrV4) -> io::Result<usize> {
    let sin = sockaddr_in(addr);
    syscall!(sendto(
        fd,
        buf.as_ptr() as *const libc::c_void,
        buf.len(),
        0,
        &sin as *const _ as *const libc::sockaddr,
        ADDR_LEN,
    ))
    .map(|n| n as usize)
}

/// Close `fd`, ignoring the result; there is no meaningful recovery.
pub(crate) fn close(fd: RawFd) {
    let _ = syscall!(close(fd));
}
