//! # RIPC Transport
//!
//! The connection-oriented framing, session-negotiation,
//! fragmentation/reassembly, compression, and buffer-management engine
//! of a real-time market-data transport. It sits directly on a reliable
//! byte stream (optionally tunneled through HTTP or framed as
//! WebSocket) and exposes a record-oriented API with backpressure-aware
//! writes and in-order delivery.
//!
//! The crate is organized leaves-first: buffer pools and codecs at the
//! bottom, the session object and its read/write paths on top, and the
//! handshake machines that produce sessions at the edge. Wire formats
//! live in the sibling `ripc-proto` crate.

pub mod buffer;
pub mod compress;
pub mod error;
pub mod handshake;
pub mod pool;
pub mod reassembly;
pub mod scheduler;
pub mod server;
pub mod session;
pub mod testing;
pub mod transport;
pub mod tunnel;

pub(crate) mod ws;

pub use buffer::PoolBuffer;
pub use error::{Result, TransportError};
pub use handshake::{
    Acceptor, BindOptions, ConnectOptions, Connector, Progress, WsConnectOptions,
    connect_with_downgrade,
};
pub use pool::{BufferPool, PoolStats};
pub use scheduler::Priority;
pub use server::Server;
pub use session::{
    IoctlCmd, Negotiated, ReadEvent, ReadStatus, Role, Session, SessionLimits, SessionState,
    SessionStats, SessionTransport, WriteArgs,
};
pub use transport::{TcpTransport, Transport};
pub use tunnel::{TunnelDialer, TunnelRole, TunnelTransport, accept_tunnel};
