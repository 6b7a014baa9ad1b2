use std::io;
use std::sync::{Arc, Mutex, Weak};

use log::{trace, warn};

use crate::addr::Addr;
use crate::channel::Channel;
use crate::codec::Codec;
use crate::event_loop::{EventLoop, LoopGroup};
use crate::tcp::{MsgCallback, ReadCallback, StateCallback, TcpConn};
use crate::{sys, Interest};

/// Listen backlog used by [`TcpServer::bind`].
pub const LISTEN_BACKLOG: i32 = 20;

type ConnFactory = Arc<dyn Fn() -> Arc<TcpConn> + Send + Sync>;

/// A listening TCP socket dispatching accepted connections over a
/// [`LoopGroup`].
///
/// The listener itself lives on one loop of the group; each accepted
/// connection is attached to a loop picked round-robin and receives clones
/// of the callbacks (and an independent clone of the codec) installed on the
/// server. Install callbacks before traffic is expected.
pub struct TcpServer {
    group: Arc<LoopGroup>,
    accept_loop: Arc<EventLoop>,
    channel: Mutex<Option<Arc<Channel>>>,
    addr: Addr,
    state_cb: Mutex<Option<Arc<StateCallback>>>,
    read_cb: Mutex<Option<Arc<ReadCallback>>>,
    msg_cb: Mutex<Option<Arc<MsgCallback>>>,
    codec: Mutex<Option<Box<dyn Codec>>>,
    factory: Mutex<ConnFactory>,
}

impl TcpServer {
    /// Bind `host:port` and start accepting.
    ///
    /// `SO_REUSEADDR` is always set; `reuse_port` additionally sets
    /// `SO_REUSEPORT` so several instances can share the port. Port 0 binds
    /// a kernel-assigned port, reported by [`local_addr`].
    ///
    /// [`local_addr`]: TcpServer::local_addr
    pub fn bind(
        group: &Arc<LoopGroup>,
        host: &str,
        port: u16,
        reuse_port: bool,
    ) -> io::Result<Arc<TcpServer>> {
        let addr = Addr::new(host, port);
        let sock_addr = addr.to_std().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("cannot resolve {}", host),
            )
        })?;

        let fd = sys::net::new_tcp_socket()?;
        let bound = sys::net::set_reuseaddr(fd)
            .and_then(|()| {
                if reuse_port {
                    sys::net::set_reuseport(fd)
                } else {
                    Ok(())
                }
            })
            .and_then(|()| sys::net::bind(fd, sock_addr))
            .and_then(|()| sys::net::listen(fd, LISTEN_BACKLOG));
        if let Err(err) = bound {
            sys::net::close(fd);
            return Err(err);
        }
        let local = sys::net::local_addr(fd).map(Addr::from_std).unwrap_or(addr);

        let accept_loop = Arc::clone(group.alloc());
        let default_factory: ConnFactory = Arc::new(TcpConn::new);
        let server = Arc::new(TcpServer {
            group: Arc::clone(group),
            accept_loop: Arc::clone(&accept_loop),
            channel: Mutex::new(None),
            addr: local,
            state_cb: Mutex::new(None),
            read_cb: Mutex::new(None),
            msg_cb: Mutex::new(None),
            codec: Mutex::new(None),
            factory: Mutex::new(default_factory),
        });

        let channel = Channel::new(&accept_loop, fd, Interest::READABLE)?;
        let weak: Weak<TcpServer> = Arc::downgrade(&server);
        channel.on_read(move || {
            if let Some(server) = weak.upgrade() {
                server.handle_accept();
            }
        });
        *server.channel.lock().unwrap() = Some(channel);
        trace!("tcp server listening on {}", local);
        Ok(server)
    }

    /// The bound address.
    pub fn local_addr(&self) -> Addr {
        self.addr
    }

    /// State callback installed on every accepted connection.
    pub fn on_conn_state(&self, callback: impl Fn(&Arc<TcpConn>) + Send + Sync + 'static) {
        *self.state_cb.lock().unwrap() = Some(Arc::new(callback));
    }

    /// Raw-read callback installed on every accepted connection. Unused
    /// once a codec is installed with [`on_conn_msg`].
    ///
    /// [`on_conn_msg`]: TcpServer::on_conn_msg
    pub fn on_conn_read(
        &self,
        callback: impl Fn(&Arc<TcpConn>, &mut crate::Buffer) + Send + Sync + 'static,
    ) {
        *self.read_cb.lock().unwrap() = Some(Arc::new(callback));
    }

    /// Codec plus per-frame callback installed on every accepted
    /// connection. Each connection gets its own codec clone.
    pub fn on_conn_msg(
        &self,
        codec: impl Codec + 'static,
        callback: impl Fn(&Arc<TcpConn>, &[u8]) + Send + Sync + 'static,
    ) {
        *self.codec.lock().unwrap() = Some(Box::new(codec));
        *self.msg_cb.lock().unwrap() = Some(Arc::new(callback));
    }

    /// Override how connection objects are created, e.g. to pre-seed
    /// context. The factory must return unattached connections.
    pub fn set_factory(&self, factory: impl Fn() -> Arc<TcpConn> + Send + Sync + 'static) {
        *self.factory.lock().unwrap() = Arc::new(factory);
    }

    /// Stop accepting. Established connections are unaffected.
    pub fn close(&self) {
        if let Some(channel) = self.channel.lock().unwrap().take() {
            channel.close();
        }
    }

    fn handle_accept(&self) {
        let Some(channel) = self.channel.lock().unwrap().clone() else {
            return;
        };
        loop {
            match sys::net::accept(channel.fd()) {
                Ok((fd, peer)) => {
                    let local = sys::net::local_addr(fd)
                        .map(Addr::from_std)
                        .unwrap_or(self.addr);
                    let peer = Addr::from_std(peer);
                    trace!("accepted {} on {}", peer, self.addr);

                    let worker = Arc::clone(self.group.alloc());
                    let factory = self.factory.lock().unwrap().clone();
                    let state_cb = self.state_cb.lock().unwrap().clone();
                    let read_cb = self.read_cb.lock().unwrap().clone();
                    let msg_cb = self.msg_cb.lock().unwrap().clone();
                    let codec = self.codec.lock().unwrap().as_ref().map(|c| c.clone_boxed());

                    // The connection is built inside its owning loop, so its
                    // first events cannot race callback installation.
                    let worker2 = Arc::clone(&worker);
                    worker.safe_call(move || {
                        let conn = factory();
                        if let Err(err) = conn.attach(&worker2, fd, local, peer) {
                            warn!("failed to attach accepted connection: {}", err);
                            return;
                        }
                        if let Some(callback) = state_cb {
                            conn.install_state_cb(callback);
                        }
                        if let Some(callback) = read_cb {
                            conn.install_read_cb(callback);
                        }
                        if let (Some(codec), Some(callback)) = (codec, msg_cb) {
                            conn.install_msg(codec, callback);
                        }
                    });
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    warn!("accept on {} failed: {}", self.addr, err);
                    return;
                }
            }
        }
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for TcpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpServer").field("addr", &self.addr).finish()
    }
}
