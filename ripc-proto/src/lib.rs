//! # RIPC Proto
//!
//! Wire formats for the RIPC streaming transport: the framed record
//! protocol itself, the session-negotiation messages, the WebSocket
//! alternative framing (RFC 6455 subset), and the HTTP chunked framing
//! used by the tunneled variant.
//!
//! This crate performs no I/O and holds no connection state. Every codec
//! is an explicit encode/parse pair over byte slices; parsers return
//! `Ok(None)` when more bytes are needed so callers can drive them from
//! a partially filled input buffer.

pub mod chunk;
pub mod constants;
pub mod frame;
pub mod handshake;
pub mod keyx;
pub mod ws;

use thiserror::Error;

/// Errors produced while encoding or decoding wire data.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtoError {
    #[error("frame length {length} exceeds maximum {max}")]
    FrameTooLarge { length: usize, max: usize },
    #[error("frame length {0} below minimum header size")]
    FrameTooShort(usize),
    #[error("truncated {0}")]
    Truncated(&'static str),
    #[error("unsupported connection version 0x{0:08x}")]
    UnsupportedVersion(u32),
    #[error("malformed handshake: {0}")]
    BadHandshake(String),
    #[error("connection refused: {0}")]
    Refused(String),
    #[error("malformed websocket frame: {0}")]
    BadWsFrame(&'static str),
    #[error("websocket handshake rejected: {status} {reason}")]
    WsRejected { status: u16, reason: String },
    #[error("malformed http: {0}")]
    BadHttp(String),
    #[error("malformed chunk framing: {0}")]
    BadChunk(&'static str),
}

pub use constants::{CompressionType, ProtocolType, RipcVersion};
pub use frame::{FragmentInfo, FrameHeader};
pub use handshake::{ClientKey, ConnectAck, ConnectNak, ConnectRequest};
pub use keyx::KeyExchange;
