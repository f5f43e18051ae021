//! The listening endpoint.
//!
//! A server owns the negotiated-side caps and the shared overflow
//! buffer pool. Sessions created by `accept` borrow the pool by
//! reference count, so the pool survives until the server and every
//! session dropped their handles.

use std::io;
use std::net::{TcpListener, ToSocketAddrs};

use tracing::debug;

use crate::handshake::{Acceptor, BindOptions};
use crate::pool::BufferPool;
use crate::session::{FRAME_HEADROOM, SessionTransport};
use crate::transport::{TcpTransport, Transport};
use crate::tunnel::TunnelTransport;

pub struct Server {
    opts: BindOptions,
    shared_pool: BufferPool,
    listener: Option<TcpListener>,
    next_session_id: u32,
}

impl Server {
    /// A server without a socket; connections are fed through
    /// [`Server::accept_transport`].
    pub fn new(opts: BindOptions) -> Server {
        let slab_size = opts.max_fragment_size as usize + FRAME_HEADROOM;
        let shared_pool = BufferPool::new(slab_size, opts.shared_pool_size);
        Server {
            opts,
            shared_pool,
            listener: None,
            next_session_id: 1,
        }
    }

    /// Binds a listening TCP socket.
    pub fn bind<A: ToSocketAddrs>(addr: A, opts: BindOptions) -> io::Result<Server> {
        let listener = TcpListener::bind(addr)?;
        debug!(addr = ?listener.local_addr(), "server bound");
        let mut server = Server::new(opts);
        server.listener = Some(listener);
        Ok(server)
    }

    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    pub fn options(&self) -> &BindOptions {
        &self.opts
    }

    /// The shared overflow pool handed to accepted sessions.
    pub fn shared_pool(&self) -> BufferPool {
        self.shared_pool.clone()
    }

    /// Accepts one TCP connection and starts its handshake.
    pub fn accept(&mut self) -> io::Result<Acceptor> {
        let listener = self
            .listener
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "server has no socket"))?;
        let (stream, peer) = listener.accept()?;
        debug!(?peer, "connection accepted");
        Ok(self.accept_transport(Box::new(TcpTransport::new(stream))))
    }

    /// Starts the handshake on an externally established connection.
    pub fn accept_transport(&mut self, transport: Box<dyn Transport>) -> Acceptor {
        Acceptor::new(
            SessionTransport::Plain(transport),
            self.opts.clone(),
            self.shared_pool.clone(),
        )
    }

    /// Starts the handshake on an established HTTP tunnel.
    pub fn accept_tunnel(&mut self, tunnel: TunnelTransport) -> Acceptor {
        Acceptor::new(
            SessionTransport::Tunnel(tunnel),
            self.opts.clone(),
            self.shared_pool.clone(),
        )
    }

    /// Allocates a tunnel session id for a freshly arrived streaming
    /// connection.
    pub fn next_tunnel_session_id(&mut self) -> u32 {
        let id = self.next_session_id;
        self.next_session_id = self.next_session_id.wrapping_add(1).max(1);
        id
    }
}
