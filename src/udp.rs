use std::io;
use std::sync::{Arc, Mutex, Weak};

use log::{trace, warn};

use crate::addr::Addr;
use crate::buffer::Buffer;
use crate::channel::Channel;
use crate::event_loop::{EventLoop, LoopGroup};
use crate::{sys, Interest};

/// Default receive buffer for one datagram.
pub const DEFAULT_DATAGRAM_SIZE: usize = 4096;

/// Callback fired once per received datagram.
pub type UdpServerCallback = dyn Fn(&Arc<UdpServer>, Buffer, Addr) + Send + Sync;
/// Callback fired once per datagram on a connected socket.
pub type UdpConnCallback = dyn Fn(&Arc<UdpConn>, Buffer) + Send + Sync;

/// A bound, non-blocking UDP socket.
///
/// Datagrams are read until the socket drains; each one is handed to the
/// [`on_msg`] callback as its own buffer, so there is no framing layer —
/// a datagram is a frame.
///
/// [`on_msg`]: UdpServer::on_msg
pub struct UdpServer {
    event_loop: Arc<EventLoop>,
    channel: Mutex<Option<Arc<Channel>>>,
    addr: Addr,
    msg_cb: Mutex<Option<Arc<UdpServerCallback>>>,
    datagram_size: Mutex<usize>,
}

impl UdpServer {
    /// Bind `host:port` with the same reuse options as the TCP side.
    pub fn bind(
        group: &Arc<LoopGroup>,
        host: &str,
        port: u16,
        reuse_port: bool,
    ) -> io::Result<Arc<UdpServer>> {
        let addr = Addr::new(host, port);
        let sock_addr = addr.to_std().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("cannot resolve {}", host),
            )
        })?;

        let fd = sys::net::new_udp_socket()?;
        let bound = sys::net::set_reuseaddr(fd)
            .and_then(|()| {
                if reuse_port {
                    sys::net::set_reuseport(fd)
                } else {
                    Ok(())
                }
            })
            .and_then(|()| sys::net::bind(fd, sock_addr));
        if let Err(err) = bound {
            sys::net::close(fd);
            return Err(err);
        }
        let local = sys::net::local_addr(fd).map(Addr::from_std).unwrap_or(addr);

        let event_loop = Arc::clone(group.alloc());
        let server = Arc::new(UdpServer {
            event_loop: Arc::clone(&event_loop),
            channel: Mutex::new(None),
            addr: local,
            msg_cb: Mutex::new(None),
            datagram_size: Mutex::new(DEFAULT_DATAGRAM_SIZE),
        });

        let channel = Channel::new(&event_loop, fd, Interest::READABLE)?;
        let weak: Weak<UdpServer> = Arc::downgrade(&server);
        channel.on_read(move || {
            if let Some(server) = weak.upgrade() {
                server.handle_read(&server);
            }
        });
        *server.channel.lock().unwrap() = Some(channel);
        trace!("udp server bound to {}", local);
        Ok(server)
    }

    pub fn local_addr(&self) -> Addr {
        self.addr
    }

    pub fn event_loop(&self) -> &Arc<EventLoop> {
        &self.event_loop
    }

    /// Per-datagram callback.
    pub fn on_msg(&self, callback: impl Fn(&Arc<UdpServer>, Buffer, Addr) + Send + Sync + 'static) {
        *self.msg_cb.lock().unwrap() = Some(Arc::new(callback));
    }

    /// Cap the size of a received datagram; larger ones are truncated by the
    /// kernel. Defaults to [`DEFAULT_DATAGRAM_SIZE`].
    pub fn set_datagram_size(&self, size: usize) {
        *self.datagram_size.lock().unwrap() = size.max(1);
    }

    /// Send one datagram to `peer`.
    pub fn send_to(&self, bytes: &[u8], peer: Addr) -> io::Result<usize> {
        let channel = self.channel.lock().unwrap().clone();
        let channel = channel
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "server closed"))?;
        let peer = peer
            .to_std()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "invalid peer address"))?;
        sys::net::send_to(channel.fd(), bytes, peer)
    }

    pub fn close(&self) {
        if let Some(channel) = self.channel.lock().unwrap().take() {
            channel.close();
        }
    }

    fn handle_read(&self, me: &Arc<UdpServer>) {
        let Some(callback) = self.msg_cb.lock().unwrap().clone() else {
            return;
        };
        let Some(channel) = self.channel.lock().unwrap().clone() else {
            return;
        };
        loop {
            let size = *self.datagram_size.lock().unwrap();
            let mut buf = Buffer::with_grow_hint(size);
            let room = buf.reserve(size);
            match sys::net::recv_from(channel.fd(), room) {
                Ok((n, peer)) => {
                    buf.commit(n);
                    callback(me, buf, Addr::from_std(peer));
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    warn!("recvfrom on {} failed: {}", self.addr, err);
                    return;
                }
            }
        }
    }
}

impl Drop for UdpServer {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for UdpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpServer").field("addr", &self.addr).finish()
    }
}

/// A `connect(2)`-bound UDP socket.
///
/// Stateless apart from the kernel association: datagrams go out with
/// [`send`] and come in through [`on_msg`], one buffer per datagram.
///
/// [`send`]: UdpConn::send
/// [`on_msg`]: UdpConn::on_msg
pub struct UdpConn {
    event_loop: Arc<EventLoop>,
    channel: Mutex<Option<Arc<Channel>>>,
    local: Addr,
    peer: Addr,
    msg_cb: Mutex<Option<Arc<UdpConnCallback>>>,
    datagram_size: Mutex<usize>,
}

impl UdpConn {
    /// Create a datagram socket associated with `host:port`.
    pub fn connect(event_loop: &Arc<EventLoop>, host: &str, port: u16) -> io::Result<Arc<UdpConn>> {
        let peer = Addr::new(host, port);
        let peer_std = peer.to_std().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("cannot resolve {}", host),
            )
        })?;

        let fd = sys::net::new_udp_socket()?;
        if let Err(err) = sys::net::connect(fd, peer_std) {
            sys::net::close(fd);
            return Err(err);
        }
        let local = sys::net::local_addr(fd)
            .map(Addr::from_std)
            .unwrap_or_else(|_| Addr::any(0));

        let conn = Arc::new(UdpConn {
            event_loop: Arc::clone(event_loop),
            channel: Mutex::new(None),
            local,
            peer,
            msg_cb: Mutex::new(None),
            datagram_size: Mutex::new(DEFAULT_DATAGRAM_SIZE),
        });

        let channel = Channel::new(event_loop, fd, Interest::READABLE)?;
        let weak: Weak<UdpConn> = Arc::downgrade(&conn);
        channel.on_read(move || {
            if let Some(conn) = weak.upgrade() {
                conn.handle_read(&conn);
            }
        });
        *conn.channel.lock().unwrap() = Some(channel);
        trace!("udp connection {} -> {}", local, peer);
        Ok(conn)
    }

    pub fn local_addr(&self) -> Addr {
        self.local
    }

    pub fn peer_addr(&self) -> Addr {
        self.peer
    }

    pub fn event_loop(&self) -> &Arc<EventLoop> {
        &self.event_loop
    }

    /// Per-datagram callback.
    pub fn on_msg(&self, callback: impl Fn(&Arc<UdpConn>, Buffer) + Send + Sync + 'static) {
        *self.msg_cb.lock().unwrap() = Some(Arc::new(callback));
    }

    pub fn set_datagram_size(&self, size: usize) {
        *self.datagram_size.lock().unwrap() = size.max(1);
    }

    /// Send one datagram to the associated peer.
    pub fn send(&self, bytes: &[u8]) -> io::Result<usize> {
        let channel = self.channel.lock().unwrap().clone();
        let channel = channel
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "connection closed"))?;
        sys::net::write(channel.fd(), bytes)
    }

    pub fn close(&self) {
        if let Some(channel) = self.channel.lock().unwrap().take() {
            channel.close();
        }
    }

    fn handle_read(&self, me: &Arc<UdpConn>) {
        let Some(callback) = self.msg_cb.lock().unwrap().clone() else {
            return;
        };
        let Some(channel) = self.channel.lock().unwrap().clone() else {
            return;
        };
        loop {
            let size = *self.datagram_size.lock().unwrap();
            let mut buf = Buffer::with_grow_hint(size);
            let room = buf.reserve(size);
            match sys::net::read(channel.fd(), room) {
                Ok(n) => {
                    buf.commit(n);
                    callback(me, buf);
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    warn!("read on udp {} failed: {}", self.local, err);
                    return;
                }
            }
        }
    }
}

impl Drop for UdpConn {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for UdpConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpConn")
            .field("local", &self.local)
            .field("peer", &self.peer)
            .finish()
    }
}
