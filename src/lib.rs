//! Reactor-style non-blocking networking.
//!
//! `deft` drives TCP and UDP sockets from one or more single-threaded event
//! loops. Each [`EventLoop`] owns a platform [`Poller`] (epoll on Linux,
//! kqueue on the BSDs and macOS), a timer store, an idle-connection tracker
//! and a task-injection pipe; a [`LoopGroup`] spreads connections over
//! several loops round-robin. On top of that sit [`TcpServer`], [`TcpConn`]
//! with automatic reconnect, the [`UdpServer`]/[`UdpConn`] datagram layer, a
//! pluggable framing [`Codec`], and [`HshaServer`], which parses frames on
//! the loop and runs user handlers on a [`ThreadPool`].
//!
//! Handlers run to completion on their loop's thread and must not block; all
//! I/O is non-blocking. Anything documented as safe from any thread — most
//! importantly [`EventLoop::safe_call`] — crosses threads through the loop's
//! wakeup pipe.
//!
//! # Examples
//!
//! An echo server speaking `\n`-terminated frames:
//!
//! ```no_run
//! # fn main() -> std::io::Result<()> {
//! use deft::{LineCodec, LoopGroup, TcpServer};
//!
//! let group = LoopGroup::new(2)?;
//! let server = TcpServer::bind(&group, "127.0.0.1", 9099, false)?;
//! server.on_conn_msg(LineCodec, |conn, frame| {
//!     let _ = conn.send_msg(frame);
//! });
//! group.run();
//! # Ok(())
//! # }
//! ```

mod addr;
mod buffer;
mod channel;
mod codec;
mod event_loop;
mod hsha;
mod idle;
mod interest;
mod poller;
mod pool;
mod queue;
mod server;
mod sys;
mod tcp;
mod timer;
mod udp;

pub use addr::Addr;
pub use buffer::Buffer;
pub use channel::Channel;
pub use codec::{Codec, Frame, LengthCodec, LineCodec, DEFAULT_MAX_FRAME, EOT, LENGTH_MAGIC};
pub use event_loop::{EventLoop, EventLoopBuilder, LoopGroup};
pub use hsha::{HshaServer, UdpHshaServer};
pub use idle::IdleId;
pub use interest::Interest;
pub use poller::{Event, Events, Poller};
pub use pool::ThreadPool;
pub use queue::TaskQueue;
pub use server::{TcpServer, LISTEN_BACKLOG};
pub use tcp::{ConnState, MsgCallback, ReadCallback, StateCallback, TcpConn};
pub use timer::TimerId;
pub use udp::{UdpConn, UdpServer, DEFAULT_DATAGRAM_SIZE};
