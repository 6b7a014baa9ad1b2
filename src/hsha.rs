use std::io;
use std::sync::Arc;

use log::warn;

use crate::addr::Addr;
use crate::codec::Codec;
use crate::event_loop::LoopGroup;
use crate::pool::ThreadPool;
use crate::server::TcpServer;
use crate::tcp::{ConnState, TcpConn};
use crate::udp::UdpServer;

/// Half-sync/half-async TCP server.
///
/// Framing and dispatch run on the loop threads; the user handler runs on a
/// worker pool and its return value, when non-empty, is encoded and sent
/// back — but only if the connection is still connected by the time the
/// response is ready.
pub struct HshaServer {
    server: Arc<TcpServer>,
    pool: Arc<ThreadPool>,
}

impl HshaServer {
    /// Bind and start serving with `workers` handler threads.
    pub fn bind(
        group: &Arc<LoopGroup>,
        host: &str,
        port: u16,
        reuse_port: bool,
        workers: usize,
        codec: impl Codec + 'static,
        handler: impl Fn(&Arc<TcpConn>, &[u8]) -> Vec<u8> + Send + Sync + 'static,
    ) -> io::Result<Arc<HshaServer>> {
        let server = TcpServer::bind(group, host, port, reuse_port)?;
        let pool = Arc::new(ThreadPool::new(workers)?);
        let handler = Arc::new(handler);

        let pool2 = Arc::clone(&pool);
        server.on_conn_msg(codec, move |conn, frame| {
            // Own the bytes before they leave the loop thread; the frame
            // borrows the connection's input buffer.
            let frame = frame.to_vec();
            let conn = Arc::clone(conn);
            let handler = Arc::clone(&handler);
            let accepted = pool2.push(move || {
                let response = handler(&conn, &frame);
                if response.is_empty() {
                    return;
                }
                let Some(event_loop) = conn.event_loop() else {
                    return;
                };
                event_loop.safe_call(move || {
                    if conn.state() != ConnState::Connected {
                        return;
                    }
                    if let Err(err) = conn.send_msg(&response) {
                        warn!("failed to send response: {}", err);
                    }
                });
            });
            if !accepted {
                warn!("worker pool unavailable; dropping frame");
            }
        });

        Ok(Arc::new(HshaServer { server, pool }))
    }

    pub fn server(&self) -> &Arc<TcpServer> {
        &self.server
    }

    pub fn local_addr(&self) -> Addr {
        self.server.local_addr()
    }

    /// Stop accepting, then drain and join the worker pool.
    pub fn close(&self) {
        self.server.close();
        self.pool.close();
        self.pool.join();
    }
}

/// Half-sync/half-async UDP server: one datagram in, the handler's reply
/// (when non-empty) out, via the owning loop.
pub struct UdpHshaServer {
    server: Arc<UdpServer>,
    pool: Arc<ThreadPool>,
}

impl UdpHshaServer {
    pub fn bind(
        group: &Arc<LoopGroup>,
        host: &str,
        port: u16,
        reuse_port: bool,
        workers: usize,
        handler: impl Fn(&Arc<UdpServer>, &[u8], Addr) -> Vec<u8> + Send + Sync + 'static,
    ) -> io::Result<Arc<UdpHshaServer>> {
        let server = UdpServer::bind(group, host, port, reuse_port)?;
        let pool = Arc::new(ThreadPool::new(workers)?);
        let handler = Arc::new(handler);

        let pool2 = Arc::clone(&pool);
        server.on_msg(move |server, buf, peer| {
            let server = Arc::clone(server);
            let handler = Arc::clone(&handler);
            let accepted = pool2.push(move || {
                let response = handler(&server, buf.data(), peer);
                if response.is_empty() {
                    return;
                }
                let server2 = Arc::clone(&server);
                server.event_loop().safe_call(move || {
                    if let Err(err) = server2.send_to(&response, peer) {
                        warn!("failed to send response to {}: {}", peer, err);
                    }
                });
            });
            if !accepted {
                warn!("worker pool unavailable; dropping datagram");
            }
        });

        Ok(Arc::new(UdpHshaServer { server, pool }))
    }

    pub fn server(&self) -> &Arc<UdpServer> {
        &self.server
    }

    pub fn local_addr(&self) -> Addr {
        self.server.local_addr()
    }

    pub fn close(&self) {
        self.server.close();
        self.pool.close();
        self.pool.join();
    }
}
