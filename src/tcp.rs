use std::any::Any;
use std::fmt;
use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::cmp;

use log::{debug, trace, warn};

use crate::addr::Addr;
use crate::buffer::Buffer;
use crate::channel::Channel;
use crate::codec::Codec;
use crate::event_loop::{now_ms, EventLoop};
use crate::idle::IdleId;
use crate::sys;
use crate::timer::TimerId;
use crate::Interest;

// How much room the read path reserves per read(2) call.
const READ_CHUNK: usize = 16 * 1024;

/// Lifecycle of a [`TcpConn`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ConnState {
    /// Fresh connection, no socket yet.
    Invalid,
    /// Non-blocking connect issued, not yet writable.
    Handshaking,
    Connected,
    /// Terminal for a connection that was connected.
    Closed,
    /// Terminal for a connection whose handshake did not complete.
    Failed,
}

/// Callback fired on state transitions and when the output buffer drains.
pub type StateCallback = dyn Fn(&Arc<TcpConn>) + Send + Sync;
/// Callback fired when the input buffer has bytes and no codec is installed.
pub type ReadCallback = dyn Fn(&Arc<TcpConn>, &mut Buffer) + Send + Sync;
/// Callback fired once per decoded frame.
pub type MsgCallback = dyn Fn(&Arc<TcpConn>, &[u8]) + Send + Sync;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Clone)]
struct Target {
    host: String,
    port: u16,
    timeout_ms: i64,
    local_ip: String,
}

/// A non-blocking TCP connection driven by an [`EventLoop`].
///
/// Server-side connections are created by [`TcpServer`] and handed to the
/// callbacks installed there; client-side connections come from
/// [`connect`]. All public methods are callable from any thread; I/O itself
/// always happens on the owning loop's thread.
///
/// A connection with a non-negative reconnect interval re-dials its original
/// target after every terminal transition, keeping its callbacks.
///
/// [`TcpServer`]: crate::TcpServer
/// [`connect`]: TcpConn::connect
pub struct TcpConn {
    weak: Weak<TcpConn>,
    id: u64,
    event_loop: Mutex<Option<Arc<EventLoop>>>,
    channel: Mutex<Option<Arc<Channel>>>,
    state: Mutex<ConnState>,
    input: Mutex<Buffer>,
    output: Mutex<Buffer>,
    local: Mutex<Addr>,
    peer: Mutex<Addr>,
    state_cb: Mutex<Option<Arc<StateCallback>>>,
    read_cb: Mutex<Option<Arc<ReadCallback>>>,
    write_cb: Mutex<Option<Arc<StateCallback>>>,
    msg_cb: Mutex<Option<Arc<MsgCallback>>>,
    codec: Mutex<Option<Box<dyn Codec>>>,
    idle_ids: Mutex<Vec<IdleId>>,
    timeout_timer: Mutex<Option<TimerId>>,
    // Negative means never reconnect.
    reconnect_ms: Mutex<i64>,
    connected_at_ms: AtomicI64,
    target: Mutex<Option<Target>>,
    context: Mutex<Option<Box<dyn Any + Send>>>,
}

impl TcpConn {
    /// A blank, unattached connection. Used directly by server-side
    /// connection factories; clients normally go through [`connect`].
    ///
    /// [`connect`]: TcpConn::connect
    pub fn new() -> Arc<TcpConn> {
        Arc::new_cyclic(|weak| TcpConn {
            weak: weak.clone(),
            id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
            event_loop: Mutex::new(None),
            channel: Mutex::new(None),
            state: Mutex::new(ConnState::Invalid),
            input: Mutex::new(Buffer::new()),
            output: Mutex::new(Buffer::new()),
            local: Mutex::new(Addr::any(0)),
            peer: Mutex::new(Addr::any(0)),
            state_cb: Mutex::new(None),
            read_cb: Mutex::new(None),
            write_cb: Mutex::new(None),
            msg_cb: Mutex::new(None),
            codec: Mutex::new(None),
            idle_ids: Mutex::new(Vec::new()),
            timeout_timer: Mutex::new(None),
            reconnect_ms: Mutex::new(-1),
            connected_at_ms: AtomicI64::new(0),
            target: Mutex::new(None),
            context: Mutex::new(None),
        })
    }

    /// Start a non-blocking connect to `host:port`.
    ///
    /// `timeout_ms > 0` forces the handshake to fail if it has not completed
    /// in time. A non-empty `local_ip` binds the socket before connecting.
    /// The returned connection is handshaking; watch [`on_state`] for the
    /// outcome.
    ///
    /// [`on_state`]: TcpConn::on_state
    pub fn connect(
        event_loop: &Arc<EventLoop>,
        host: &str,
        port: u16,
        timeout_ms: i64,
        local_ip: &str,
    ) -> io::Result<Arc<TcpConn>> {
        let conn = TcpConn::new();
        *conn.target.lock().unwrap() = Some(Target {
            host: host.to_owned(),
            port,
            timeout_ms,
            local_ip: local_ip.to_owned(),
        });
        conn.do_connect(event_loop)?;
        Ok(conn)
    }

    fn do_connect(self: &Arc<Self>, event_loop: &Arc<EventLoop>) -> io::Result<()> {
        let target = self
            .target
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no connect target"))?;
        let peer = Addr::new(&target.host, target.port);
        let peer_std = peer.to_std().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("cannot resolve {}", target.host),
            )
        })?;

        let fd = sys::net::new_tcp_socket()?;
        if !target.local_ip.is_empty() {
            let local = Addr::new(&target.local_ip, 0);
            let bound = local
                .to_std()
                .ok_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::AddrNotAvailable,
                        format!("cannot resolve local ip {}", target.local_ip),
                    )
                })
                .and_then(|addr| sys::net::bind(fd, addr));
            if let Err(err) = bound {
                sys::net::close(fd);
                return Err(err);
            }
        }

        // Stamped at attempt start so the reconnect delay measures the gap
        // between attempts, not between successes.
        self.connected_at_ms.store(now_ms(), Ordering::Relaxed);
        *self.state.lock().unwrap() = ConnState::Handshaking;

        if let Err(err) = sys::net::connect(fd, peer_std) {
            // Keep going: the handshake observes the failure and drives the
            // state machine (and any reconnect) from there.
            debug!("connect to {} failed early: {}", peer, err);
        }
        let local = sys::net::local_addr(fd)
            .map(Addr::from_std)
            .unwrap_or_else(|_| Addr::any(0));
        self.attach(event_loop, fd, local, peer)?;

        if target.timeout_ms > 0 {
            let weak = self.weak.clone();
            let id = event_loop.run_after(
                target.timeout_ms,
                move || {
                    if let Some(conn) = weak.upgrade() {
                        if conn.state() == ConnState::Handshaking {
                            debug!("connect to {} timed out", conn.peer_addr());
                            conn.cleanup();
                        }
                    }
                },
                0,
            );
            *self.timeout_timer.lock().unwrap() = Some(id);
        }
        Ok(())
    }

    /// Take over `fd` and start driving it on `event_loop`.
    ///
    /// Server-accepted sockets attach from `Invalid`; client sockets with a
    /// connect in flight attach from `Handshaking`. Ownership of `fd` moves
    /// to the connection's channel.
    pub fn attach(
        self: &Arc<Self>,
        event_loop: &Arc<EventLoop>,
        fd: RawFd,
        local: Addr,
        peer: Addr,
    ) -> io::Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            debug_assert!(
                matches!(*state, ConnState::Invalid | ConnState::Handshaking),
                "attach on a live connection"
            );
            *state = ConnState::Handshaking;
        }
        *self.event_loop.lock().unwrap() = Some(Arc::clone(event_loop));
        *self.local.lock().unwrap() = local;
        *self.peer.lock().unwrap() = peer;

        let channel = Channel::new(event_loop, fd, Interest::READABLE | Interest::WRITABLE)?;
        let weak = self.weak.clone();
        channel.on_read(move || {
            if let Some(conn) = weak.upgrade() {
                conn.handle_read();
            }
        });
        let weak = self.weak.clone();
        channel.on_write(move || {
            if let Some(conn) = weak.upgrade() {
                conn.handle_write();
            }
        });
        *self.channel.lock().unwrap() = Some(channel);
        trace!("connection {} attached {} -> {}", self.id, local, peer);
        Ok(())
    }

    pub fn state(&self) -> ConnState {
        *self.state.lock().unwrap()
    }

    pub fn local_addr(&self) -> Addr {
        *self.local.lock().unwrap()
    }

    pub fn peer_addr(&self) -> Addr {
        *self.peer.lock().unwrap()
    }

    /// The loop driving this connection, once attached.
    pub fn event_loop(&self) -> Option<Arc<EventLoop>> {
        self.event_loop.lock().unwrap().clone()
    }

    /// Loop time of the last completed handshake.
    pub fn connected_at_ms(&self) -> i64 {
        self.connected_at_ms.load(Ordering::Relaxed)
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Callback for state transitions: connected, closed, failed.
    pub fn on_state(&self, callback: impl Fn(&Arc<TcpConn>) + Send + Sync + 'static) {
        *self.state_cb.lock().unwrap() = Some(Arc::new(callback));
    }

    /// Callback for raw readable data. Not called once a codec is installed
    /// via [`on_msg`].
    ///
    /// [`on_msg`]: TcpConn::on_msg
    pub fn on_read(&self, callback: impl Fn(&Arc<TcpConn>, &mut Buffer) + Send + Sync + 'static) {
        *self.read_cb.lock().unwrap() = Some(Arc::new(callback));
    }

    /// Callback fired when the output buffer drains to empty.
    pub fn on_writable(&self, callback: impl Fn(&Arc<TcpConn>) + Send + Sync + 'static) {
        *self.write_cb.lock().unwrap() = Some(Arc::new(callback));
    }

    /// Install a codec and a per-frame callback. A decode error closes the
    /// connection.
    pub fn on_msg(
        &self,
        codec: impl Codec + 'static,
        callback: impl Fn(&Arc<TcpConn>, &[u8]) + Send + Sync + 'static,
    ) {
        self.install_msg(Box::new(codec), Arc::new(callback));
    }

    pub(crate) fn install_state_cb(&self, callback: Arc<StateCallback>) {
        *self.state_cb.lock().unwrap() = Some(callback);
    }

    pub(crate) fn install_read_cb(&self, callback: Arc<ReadCallback>) {
        *self.read_cb.lock().unwrap() = Some(callback);
    }

    pub(crate) fn install_msg(&self, codec: Box<dyn Codec>, callback: Arc<MsgCallback>) {
        *self.codec.lock().unwrap() = Some(codec);
        *self.msg_cb.lock().unwrap() = Some(callback);
    }

    /// How long to wait after a terminal transition before re-dialing the
    /// original target. Negative (the default) disables reconnecting; zero
    /// retries immediately.
    pub fn set_reconnect_interval(&self, interval_ms: i64) {
        *self.reconnect_ms.lock().unwrap() = interval_ms;
    }

    /// Fire `callback` whenever the connection has been quiet for
    /// `timeout_s` seconds, and every `timeout_s` after that while it stays
    /// quiet.
    pub fn add_idle(&self, timeout_s: u64, callback: impl Fn(&Arc<TcpConn>) + Send + Sync + 'static) {
        let Some(event_loop) = self.event_loop() else {
            warn!("add_idle on unattached connection {}", self.id);
            return;
        };
        let conn = self.arc();
        let id = event_loop.register_idle(timeout_s, &conn, Arc::new(callback));
        self.idle_ids.lock().unwrap().push(id);
    }

    /// Set `TCP_NODELAY`.
    pub fn set_nodelay(&self, enable: bool) -> io::Result<()> {
        match self.channel.lock().unwrap().as_ref() {
            Some(channel) => sys::net::set_nodelay(channel.fd(), enable),
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "no socket to configure",
            )),
        }
    }

    /// Store an arbitrary per-connection value.
    pub fn set_context<T: Any + Send>(&self, value: T) {
        *self.context.lock().unwrap() = Some(Box::new(value));
    }

    /// Borrow the per-connection value, if it has the asked-for type.
    pub fn with_context<T: Any + Send, R>(&self, f: impl FnOnce(Option<&mut T>) -> R) -> R {
        let mut guard = self.context.lock().unwrap();
        f(guard.as_mut().and_then(|value| value.downcast_mut::<T>()))
    }

    /// Queue `bytes` for delivery.
    ///
    /// When nothing is pending the bytes are written in-line; whatever the
    /// socket does not take is buffered and write interest is armed. Without
    /// a channel the bytes are dropped with a warning.
    pub fn send(&self, bytes: &[u8]) {
        let channel = self.channel.lock().unwrap().clone();
        let Some(channel) = channel else {
            warn!(
                "send on connection {} without a socket; {} bytes dropped",
                self.id,
                bytes.len()
            );
            return;
        };
        let mut output = self.output.lock().unwrap();
        if output.is_empty() && self.state() == ConnState::Connected {
            match write_some(channel.fd(), bytes) {
                Ok(written) if written < bytes.len() => {
                    output.append(&bytes[written..]);
                    let _ = channel.enable_write(true);
                }
                Ok(_) => {}
                Err(err) => {
                    warn!("write to {} failed: {}", self.peer_addr(), err);
                    drop(output);
                    self.close();
                }
            }
        } else {
            // Delivered by the write path once the socket is ready (or the
            // handshake completes).
            output.append(bytes);
            let _ = channel.enable_write(true);
        }
    }

    /// Move `buf`'s bytes into the output path without copying when
    /// possible, leaving `buf` empty.
    pub fn send_buffer(&self, buf: &mut Buffer) {
        {
            let mut output = self.output.lock().unwrap();
            output.absorb(buf);
        }
        let channel = self.channel.lock().unwrap().clone();
        match channel {
            Some(channel) => {
                if self.state() == ConnState::Connected {
                    self.drain_output(&channel);
                } else {
                    let _ = channel.enable_write(true);
                }
            }
            None => warn!("send on connection {} without a socket", self.id),
        }
    }

    /// Encode one frame with the installed codec and queue it.
    pub fn send_msg(&self, payload: &[u8]) -> io::Result<()> {
        let mut encoded = Buffer::new();
        {
            let mut codec = self.codec.lock().unwrap();
            let codec = codec
                .as_mut()
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no codec installed"))?;
            codec.encode(payload, &mut encoded)?;
        }
        self.send_buffer(&mut encoded);
        Ok(())
    }

    /// Close the connection. The teardown runs on the owning loop; this is
    /// safe from any thread and never synchronous.
    pub fn close(&self) {
        let Some(event_loop) = self.event_loop() else {
            return;
        };
        let weak = self.weak.clone();
        event_loop.safe_call(move || {
            if let Some(conn) = weak.upgrade() {
                conn.cleanup();
            }
        });
    }

    fn arc(&self) -> Arc<TcpConn> {
        self.weak.upgrade().expect("called through an Arc")
    }

    fn channel(&self) -> Option<Arc<Channel>> {
        self.channel.lock().unwrap().clone()
    }

    fn handle_read(&self) {
        if self.state() == ConnState::Handshaking && !self.handle_handshake() {
            return;
        }
        while self.state() == ConnState::Connected {
            let Some(channel) = self.channel() else { return };
            let mut input = self.input.lock().unwrap();
            let room = input.reserve(READ_CHUNK);
            match sys::net::read(channel.fd(), room) {
                Ok(0) => {
                    // Peer sent EOF.
                    drop(input);
                    self.cleanup();
                    return;
                }
                Ok(n) => input.commit(n),
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                    drop(input);
                    // The socket drained without closing: the connection is
                    // alive, so stamp its idle entries, then deliver.
                    self.touch_idle();
                    self.deliver();
                    return;
                }
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    debug!("read from {} failed: {}", self.peer_addr(), err);
                    drop(input);
                    self.cleanup();
                    return;
                }
            }
        }
    }

    fn handle_write(&self) {
        match self.state() {
            ConnState::Handshaking => {
                self.handle_handshake();
            }
            ConnState::Connected => {
                let Some(channel) = self.channel() else { return };
                self.drain_output(&channel);
            }
            state => trace!("write event on {:?} connection {}", state, self.id),
        }
    }

    fn drain_output(&self, channel: &Arc<Channel>) {
        let mut output = self.output.lock().unwrap();
        if !output.is_empty() {
            match write_some(channel.fd(), output.data()) {
                Ok(written) => {
                    output.consume(written);
                }
                Err(err) => {
                    warn!("write to {} failed: {}", self.peer_addr(), err);
                    drop(output);
                    self.close();
                    return;
                }
            }
        }
        let drained = output.is_empty();
        drop(output);
        if drained {
            if channel.has_write_interest() {
                let _ = channel.enable_write(false);
                let callback = self.write_cb.lock().unwrap().clone();
                if let Some(callback) = callback {
                    callback(&self.arc());
                }
            }
        } else if !channel.has_write_interest() {
            let _ = channel.enable_write(true);
        }
    }

    // One poll(2) decides the handshake: POLLOUT alone means established,
    // anything else tears the attempt down. Returns true when connected.
    fn handle_handshake(&self) -> bool {
        let Some(channel) = self.channel() else {
            return false;
        };
        match sys::net::poll_out(channel.fd()) {
            Ok(true) => {
                {
                    let mut state = self.state.lock().unwrap();
                    if *state != ConnState::Handshaking {
                        return *state == ConnState::Connected;
                    }
                    *state = ConnState::Connected;
                }
                self.connected_at_ms.store(now_ms(), Ordering::Relaxed);
                // Write interest stays off until something queues output.
                let armed = !self.output.lock().unwrap().is_empty();
                let _ = channel.enable_write(armed);
                trace!(
                    "connection {} established {} -> {}",
                    self.id,
                    self.local_addr(),
                    self.peer_addr()
                );
                self.fire_state();
                true
            }
            _ => {
                self.cleanup();
                false
            }
        }
    }

    fn touch_idle(&self) {
        let Some(event_loop) = self.event_loop() else {
            return;
        };
        for id in self.idle_ids.lock().unwrap().iter() {
            event_loop.update_idle(*id);
        }
    }

    // Hand buffered input to the application: the decode loop when a codec
    // is installed, the raw read callback otherwise.
    fn deliver(&self) {
        if self.codec.lock().unwrap().is_some() {
            self.decode_frames();
        } else {
            let callback = self.read_cb.lock().unwrap().clone();
            if let Some(callback) = callback {
                let conn = self.arc();
                let mut input = self.input.lock().unwrap();
                if !input.is_empty() {
                    callback(&conn, &mut input);
                }
            }
        }
    }

    fn decode_frames(&self) {
        let conn = self.arc();
        loop {
            let Some(callback) = self.msg_cb.lock().unwrap().clone() else {
                return;
            };
            let mut input = self.input.lock().unwrap();
            if input.is_empty() {
                return;
            }
            let decoded = {
                let mut codec = self.codec.lock().unwrap();
                match codec.as_mut() {
                    Some(codec) => codec.try_decode(input.data()),
                    None => return,
                }
            };
            match decoded {
                Ok(Some(frame)) => {
                    debug_assert!(frame.consumed > 0, "codec consumed nothing");
                    callback(&conn, &input.data()[frame.payload.clone()]);
                    input.consume(frame.consumed);
                }
                Ok(None) => return,
                Err(err) => {
                    warn!("protocol error from {}: {}", self.peer_addr(), err);
                    drop(input);
                    self.cleanup();
                    return;
                }
            }
        }
    }

    fn fire_state(&self) {
        let callback = self.state_cb.lock().unwrap().clone();
        if let Some(callback) = callback {
            callback(&self.arc());
        }
    }

    // Terminal transition. Runs on the loop thread.
    fn cleanup(&self) {
        {
            let mut state = self.state.lock().unwrap();
            match *state {
                ConnState::Handshaking => *state = ConnState::Failed,
                ConnState::Connected => *state = ConnState::Closed,
                // Already torn down (or never attached).
                _ => return,
            }
        }
        trace!("connection {} -> {:?}", self.id, self.state());

        // Leftover input is delivered one last time before anyone learns
        // the connection died.
        self.deliver();

        let timeout_timer = self.timeout_timer.lock().unwrap().take();
        let event_loop = self.event_loop();
        if let (Some(id), Some(event_loop)) = (timeout_timer, &event_loop) {
            event_loop.cancel(id);
        }

        self.fire_state();

        let interval_ms = *self.reconnect_ms.lock().unwrap();
        if interval_ms >= 0 && self.target.lock().unwrap().is_some() {
            if let Some(event_loop) = &event_loop {
                if !event_loop.exiting() {
                    // The dead channel goes now; callbacks and idle entries
                    // survive for the next attempt.
                    if let Some(channel) = self.channel.lock().unwrap().take() {
                        channel.close();
                    }
                    self.schedule_reconnect(event_loop, interval_ms);
                    return;
                }
            }
        }

        if let Some(event_loop) = &event_loop {
            let ids: Vec<IdleId> = self.idle_ids.lock().unwrap().drain(..).collect();
            for id in ids {
                event_loop.unregister_idle(id);
            }
        }
        self.state_cb.lock().unwrap().take();
        self.read_cb.lock().unwrap().take();
        self.write_cb.lock().unwrap().take();
        self.msg_cb.lock().unwrap().take();
        if let Some(channel) = self.channel.lock().unwrap().take() {
            channel.close();
        }
    }

    fn schedule_reconnect(&self, event_loop: &Arc<EventLoop>, interval_ms: i64) {
        // The reconnect set owns the connection until the attempt fires.
        event_loop.reconnect_keep(self.arc());
        let since_attempt = now_ms() - self.connected_at_ms.load(Ordering::Relaxed);
        let delay = cmp::max(0, interval_ms - since_attempt);
        trace!("connection {} reconnecting in {} ms", self.id, delay);

        let weak = self.weak.clone();
        let conn_id = self.id;
        let event_loop2 = Arc::clone(event_loop);
        event_loop.run_after(
            delay,
            move || {
                event_loop2.reconnect_release(conn_id);
                if event_loop2.exiting() {
                    return;
                }
                let Some(conn) = weak.upgrade() else { return };
                if !matches!(conn.state(), ConnState::Failed | ConnState::Closed) {
                    return;
                }
                if let Err(err) = conn.do_connect(&event_loop2) {
                    warn!("reconnect failed: {}", err);
                    *conn.state.lock().unwrap() = ConnState::Failed;
                    let interval_ms = *conn.reconnect_ms.lock().unwrap();
                    if interval_ms >= 0 {
                        conn.schedule_reconnect(&event_loop2, interval_ms);
                    }
                }
            },
            0,
        );
    }
}

fn write_some(fd: RawFd, bytes: &[u8]) -> io::Result<usize> {
    let mut sent = 0;
    while sent < bytes.len() {
        match sys::net::write(fd, &bytes[sent..]) {
            Ok(0) => break,
            Ok(n) => sent += n,
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(sent)
}

impl Drop for TcpConn {
    fn drop(&mut self) {
        // A connection dropped without a clean close still releases its fd
        // and poller registration.
        if let Ok(slot) = self.channel.get_mut() {
            if let Some(channel) = slot.take() {
                channel.close();
            }
        }
    }
}

impl fmt::Debug for TcpConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpConn")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("peer", &self.peer_addr())
            .finish()
    }
}
