//! HTTP chunked-transfer framing and the tunnel header codec used by the
//! HTTP/HTTPS tunneled transport.

use crate::ProtoError;

/// The terminal zero chunk signalling end-of-stream before an FD swap.
pub const ZERO_CHUNK: &[u8] = b"0\r\n\r\n";

/// Opaque per-connection identity sent at the head of every tunnel POST.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TunnelHeader {
    pub session_id: u32,
    pub pid: u16,
    pub ip_address: u32,
}

/// Encoded size of a [`TunnelHeader`].
pub const TUNNEL_HEADER_LEN: usize = 10;

impl TunnelHeader {
    pub fn encode(&self) -> [u8; TUNNEL_HEADER_LEN] {
        let mut out = [0u8; TUNNEL_HEADER_LEN];
        out[0..4].copy_from_slice(&self.session_id.to_be_bytes());
        out[4..6].copy_from_slice(&self.pid.to_be_bytes());
        out[6..10].copy_from_slice(&self.ip_address.to_be_bytes());
        out
    }

    pub fn parse(buf: &[u8]) -> Result<TunnelHeader, ProtoError> {
        if buf.len() < TUNNEL_HEADER_LEN {
            return Err(ProtoError::Truncated("tunnel header"));
        }
        Ok(TunnelHeader {
            session_id: u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]),
            pid: u16::from_be_bytes([buf[4], buf[5]]),
            ip_address: u32::from_be_bytes([buf[6], buf[7], buf[8], buf[9]]),
        })
    }
}

/// Tunnel control opcodes carried on the control channel.
pub mod tunnel_ops {
    /// Client announces a replacement streaming connection.
    pub const RECONNECT: u8 = 0x02;
    /// Single-byte chunk acknowledging the new streaming channel.
    pub const SWITCH_ACK: u8 = 0x03;
}

/// First chunk of the streaming response: acknowledges the tunnel and
/// assigns the session id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TunnelConnAck {
    pub session_id: u32,
}

/// Encoded size of a [`TunnelConnAck`].
pub const TUNNEL_CONNACK_LEN: usize = 7;

impl TunnelConnAck {
    pub fn encode(&self) -> [u8; TUNNEL_CONNACK_LEN] {
        let mut out = [0u8; TUNNEL_CONNACK_LEN];
        out[0..2].copy_from_slice(&(TUNNEL_CONNACK_LEN as u16).to_be_bytes());
        out[2] = 0x01;
        out[3..7].copy_from_slice(&self.session_id.to_be_bytes());
        out
    }

    pub fn parse(buf: &[u8]) -> Result<TunnelConnAck, ProtoError> {
        if buf.len() < TUNNEL_CONNACK_LEN {
            return Err(ProtoError::Truncated("tunnel connack"));
        }
        let len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
        if len != TUNNEL_CONNACK_LEN || buf[2] != 0x01 {
            return Err(ProtoError::BadHandshake("malformed tunnel connack".into()));
        }
        Ok(TunnelConnAck {
            session_id: u32::from_be_bytes([buf[3], buf[4], buf[5], buf[6]]),
        })
    }
}

/// The 3-byte reconnection notice sent on a new control channel.
pub fn encode_reconnect_notice() -> [u8; 3] {
    [0x00, 0x03, tunnel_ops::RECONNECT]
}

/// Appends one chunk (hex length, CRLF, payload, CRLF) to `out`.
pub fn encode_chunk(payload: &[u8], out: &mut Vec<u8>) {
    out.extend_from_slice(format!("{:x}\r\n", payload.len()).as_bytes());
    out.extend_from_slice(payload);
    out.extend_from_slice(b"\r\n");
}

/// A chunk parsed out of a streaming response body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk {
    Data { payload: std::ops::Range<usize> },
    /// The `0\r\n\r\n` end-of-stream marker.
    End,
}

/// Parses one chunk from the front of `buf`.
///
/// Returns the chunk and total bytes consumed, or `Ok(None)` while
/// incomplete. Data payload is returned as a range into `buf`.
pub fn parse_chunk(buf: &[u8]) -> Result<Option<(Chunk, usize)>, ProtoError> {
    let Some(line_end) = buf.windows(2).position(|w| w == b"\r\n") else {
        if buf.len() > 18 {
            return Err(ProtoError::BadChunk("unterminated chunk size line"));
        }
        return Ok(None);
    };
    let size_line = &buf[..line_end];
    let mut size: usize = 0;
    if size_line.is_empty() {
        return Err(ProtoError::BadChunk("empty chunk size line"));
    }
    for &byte in size_line {
        // Chunk extensions are not produced by any peer we speak to.
        let digit = match byte {
            b'0'..=b'9' => byte - b'0',
            b'a'..=b'f' => byte - b'a' + 10,
            b'A'..=b'F' => byte - b'A' + 10,
            _ => return Err(ProtoError::BadChunk("non-hex chunk size")),
        };
        size = size
            .checked_mul(16)
            .and_then(|s| s.checked_add(digit as usize))
            .ok_or(ProtoError::BadChunk("chunk size overflow"))?;
    }

    let payload_start = line_end + 2;
    if size == 0 {
        // End marker is the size line plus one trailing CRLF.
        if buf.len() < payload_start + 2 {
            return Ok(None);
        }
        if &buf[payload_start..payload_start + 2] != b"\r\n" {
            return Err(ProtoError::BadChunk("malformed zero chunk"));
        }
        return Ok(Some((Chunk::End, payload_start + 2)));
    }
    let payload_end = payload_start + size;
    if buf.len() < payload_end + 2 {
        return Ok(None);
    }
    if &buf[payload_end..payload_end + 2] != b"\r\n" {
        return Err(ProtoError::BadChunk("missing chunk terminator"));
    }
    Ok(Some((
        Chunk::Data {
            payload: payload_start..payload_end,
        },
        payload_end + 2,
    )))
}

/// Builds the control-channel POST that opens or re-opens a tunnel.
pub fn tunnel_request(url: &str, body_len: usize) -> Vec<u8> {
    let target = if url.is_empty() { "/" } else { url };
    format!(
        "POST {target} HTTP/1.0\r\n\
         Pragma: no-cache\r\n\
         Accept-Encoding: gzip\r\n\
         Content-Length: {body_len}\r\n\
         Proxy-Connection: Keep-Alive\r\n\r\n"
    )
    .into_bytes()
}

/// Response headers that open the streaming chunked channel.
pub fn streaming_response_header() -> Vec<u8> {
    b"HTTP/1.1 200 OK\r\n\
      Transfer-Encoding: chunked\r\n\
      Content-Type: application/octet-stream\r\n\r\n"
        .to_vec()
}

/// Locates the end of an HTTP header block, if present.
pub fn http_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}
