//! WebSocket framing (RFC 6455 subset) used when the peer speaks one of
//! the configured subprotocols instead of raw RIPC.

pub mod frame;
pub mod handshake;

pub use frame::{WsFrameHeader, WsOpcode, apply_mask};
pub use handshake::{accept_key, DeflateParams, UpgradeRequest, UpgradeResponse};

/// Subprotocols the transport understands, in default offer order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubProtocol {
    /// RIPC frames carried in binary WebSocket messages.
    Rwf,
    /// JSON message payloads, current naming.
    Json2,
    /// JSON message payloads, legacy naming.
    TrJson2,
}

impl SubProtocol {
    pub const DEFAULT_LIST: [SubProtocol; 3] =
        [SubProtocol::Json2, SubProtocol::Rwf, SubProtocol::TrJson2];

    pub fn as_str(self) -> &'static str {
        match self {
            SubProtocol::Rwf => "rssl.rwf",
            SubProtocol::Json2 => "rssl.json.v2",
            SubProtocol::TrJson2 => "tr_json2",
        }
    }

    pub fn from_str_token(token: &str) -> Option<SubProtocol> {
        match token.trim() {
            "rssl.rwf" => Some(SubProtocol::Rwf),
            "rssl.json.v2" => Some(SubProtocol::Json2),
            "tr_json2" => Some(SubProtocol::TrJson2),
            _ => None,
        }
    }

    /// Whether payloads are JSON (text frames, array packing).
    pub fn is_json(self) -> bool {
        matches!(self, SubProtocol::Json2 | SubProtocol::TrJson2)
    }
}

/// Close status codes from RFC 6455 §7.4.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum CloseCode {
    Normal = 1000,
    GoingAway = 1001,
    ProtocolError = 1002,
    UnsupportedData = 1003,
    InvalidPayload = 1007,
    PolicyViolation = 1008,
    TooBig = 1009,
    InternalError = 1011,
}

impl CloseCode {
    pub fn from_u16(raw: u16) -> Option<CloseCode> {
        match raw {
            1000 => Some(CloseCode::Normal),
            1001 => Some(CloseCode::GoingAway),
            1002 => Some(CloseCode::ProtocolError),
            1003 => Some(CloseCode::UnsupportedData),
            1007 => Some(CloseCode::InvalidPayload),
            1008 => Some(CloseCode::PolicyViolation),
            1009 => Some(CloseCode::TooBig),
            1011 => Some(CloseCode::InternalError),
            _ => None,
        }
    }
}

/// Heartbeat message bodies for the JSON subprotocols.
pub const JSON_PING: &[u8] = b"[{\"Type\":\"Ping\"}]";
pub const JSON_PONG: &[u8] = b"[{\"Type\":\"Pong\"}]";

/// Largest payload a control frame may carry.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// Trailer appended to a permessage-deflate stream before inflation and
/// stripped after deflation.
pub const DEFLATE_TRAILER: [u8; 4] = [0x00, 0x00, 0xff, 0xff];
