//! Session-negotiation message codecs.
//!
//! The handshake is client initiated: a connect request, a connect
//! ack (or nak with refusal text), and for version 14 with key exchange
//! a third client-key message. Handshake messages ride the same
//! length-prefixed frame channel as data; the flag byte distinguishes
//! them (`0x00` request, `CONN_ACK`, `CONN_NAK`, `CLIENT_KEY`).

use crate::ProtoError;
use crate::constants::{
    BASE_HEADER_LEN, CompressionType, ProtocolType, RipcVersion, flags, session_flags,
};

/// Client connect request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub version: RipcVersion,
    /// Request key exchange (only meaningful on v14).
    pub key_exchange: bool,
    /// Bitmap of compression algorithms the client accepts.
    pub compression_bitmap: u8,
    pub ping_timeout: u8,
    /// Ping-direction bits.
    pub session_flags: u8,
    pub protocol_type: ProtocolType,
    pub major_version: u8,
    pub minor_version: u8,
    pub hostname: String,
    pub ip_address: String,
    /// Component version advertised from v13 on.
    pub component_version: String,
}

impl ConnectRequest {
    pub fn encode(&self) -> Result<Vec<u8>, ProtoError> {
        let mut out = vec![0u8, 0u8, 0x00];
        out.extend_from_slice(&self.version.connection_version().to_be_bytes());
        let mut req_flags = 0u8;
        if self.key_exchange && self.version.has_key_exchange() {
            req_flags |= session_flags::KEY_EXCHANGE;
        }
        out.push(req_flags);
        // Header-length byte: fixed-length prefix of this message, so a
        // parser can skip fields it does not understand.
        let header_len_pos = out.len();
        out.push(0);
        out.push(1); // compression bitmap length
        out.push(self.compression_bitmap);
        out.push(self.ping_timeout);
        out.push(self.session_flags);
        if self.version.has_protocol_type() {
            out.push(self.protocol_type as u8);
        }
        out.push(self.major_version);
        out.push(self.minor_version);
        out[header_len_pos] = (out.len() - BASE_HEADER_LEN) as u8;
        push_short_string(&mut out, &self.hostname, "hostname")?;
        push_short_string(&mut out, &self.ip_address, "ip address")?;
        if self.version.has_component_version() {
            let comp = self.component_version.as_bytes();
            if comp.len() > u8::MAX as usize - 1 {
                return Err(ProtoError::BadHandshake(
                    "component version too long".into(),
                ));
            }
            out.push(comp.len() as u8 + 1);
            out.push(comp.len() as u8);
            out.extend_from_slice(comp);
        }
        finish_frame(out)
    }

    /// Parses a complete connect-request frame (header already length
    /// checked by the caller's frame loop).
    pub fn parse(frame: &[u8]) -> Result<ConnectRequest, ProtoError> {
        let mut r = Reader::new(frame, "connect request");
        r.skip(2)?; // frame length
        let flag_byte = r.u8()?;
        if flag_byte != 0x00 {
            return Err(ProtoError::BadHandshake(format!(
                "unexpected flag byte 0x{flag_byte:02x} on connect request"
            )));
        }
        let raw_version = r.u32()?;
        let version = RipcVersion::from_connection_version(raw_version)
            .ok_or(ProtoError::UnsupportedVersion(raw_version))?;
        let req_flags = r.u8()?;
        let _header_len = r.u8()?;
        let bitmap_len = r.u8()? as usize;
        if bitmap_len != 1 {
            return Err(ProtoError::BadHandshake(format!(
                "unsupported compression bitmap length {bitmap_len}"
            )));
        }
        let compression_bitmap = r.u8()?;
        let ping_timeout = r.u8()?;
        let sess_flags = r.u8()?;
        let protocol_type = if version.has_protocol_type() {
            let raw = r.u8()?;
            ProtocolType::from_u8(raw).ok_or_else(|| {
                ProtoError::BadHandshake(format!("unknown protocol type {raw}"))
            })?
        } else {
            ProtocolType::Rwf
        };
        let major_version = r.u8()?;
        let minor_version = r.u8()?;
        let hostname = r.short_string()?;
        let ip_address = r.short_string()?;
        let component_version = if version.has_component_version() {
            let _container = r.u8()?;
            r.short_string()?
        } else {
            String::new()
        };

        Ok(ConnectRequest {
            version,
            key_exchange: req_flags & session_flags::KEY_EXCHANGE != 0,
            compression_bitmap,
            ping_timeout,
            session_flags: sess_flags,
            protocol_type,
            major_version,
            minor_version,
            hostname,
            ip_address,
            component_version,
        })
    }
}

/// Server key-exchange block inside a connect ack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyExchangeBlock {
    pub key_type: u8,
    pub p: u64,
    pub g: u64,
    pub server_public: u64,
}

/// Server connect acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectAck {
    pub version: RipcVersion,
    pub max_msg_size: u16,
    pub session_flags: u8,
    pub ping_timeout: u8,
    pub major_version: u8,
    pub minor_version: u8,
    pub compression: CompressionType,
    pub compression_level: u8,
    pub key_exchange: Option<KeyExchangeBlock>,
    pub component_version: String,
}

const KEYX_BLOCK_LEN: u8 = 24;

impl ConnectAck {
    pub fn encode(&self) -> Result<Vec<u8>, ProtoError> {
        let mut out = vec![0u8, 0u8, flags::CONN_ACK];
        out.extend_from_slice(&self.version.connection_version().to_be_bytes());
        out.extend_from_slice(&self.max_msg_size.to_be_bytes());
        out.push(self.session_flags);
        out.push(self.ping_timeout);
        out.push(self.major_version);
        out.push(self.minor_version);
        out.push(self.compression as u8);
        out.push(self.compression_level);
        if self.version.has_key_exchange() {
            match self.key_exchange {
                Some(block) => {
                    out.push(block.key_type);
                    out.push(KEYX_BLOCK_LEN);
                    out.extend_from_slice(&block.p.to_be_bytes());
                    out.extend_from_slice(&block.g.to_be_bytes());
                    out.extend_from_slice(&block.server_public.to_be_bytes());
                }
                None => {
                    out.push(0);
                    out.push(0);
                }
            }
        }
        if self.version.has_component_version() {
            let comp = self.component_version.as_bytes();
            if comp.len() > u8::MAX as usize - 1 {
                return Err(ProtoError::BadHandshake(
                    "component version too long".into(),
                ));
            }
            out.push(comp.len() as u8 + 1);
            out.push(comp.len() as u8);
            out.extend_from_slice(comp);
        }
        finish_frame(out)
    }

    pub fn parse(frame: &[u8]) -> Result<ConnectAck, ProtoError> {
        let mut r = Reader::new(frame, "connect ack");
        r.skip(2)?;
        let flag_byte = r.u8()?;
        if flag_byte & flags::CONN_NAK != 0 {
            let nak = ConnectNak::parse(frame)?;
            return Err(ProtoError::Refused(nak.text));
        }
        if flag_byte & flags::CONN_ACK == 0 {
            return Err(ProtoError::BadHandshake(format!(
                "unexpected flag byte 0x{flag_byte:02x} on connect ack"
            )));
        }
        let raw_version = r.u32()?;
        let version = RipcVersion::from_connection_version(raw_version)
            .ok_or(ProtoError::UnsupportedVersion(raw_version))?;
        let max_msg_size = r.u16()?;
        let sess_flags = r.u8()?;
        let ping_timeout = r.u8()?;
        let major_version = r.u8()?;
        let minor_version = r.u8()?;
        let comp_raw = r.u8()?;
        let compression = CompressionType::from_u8(comp_raw).ok_or_else(|| {
            ProtoError::BadHandshake(format!("unknown compression type {comp_raw}"))
        })?;
        let compression_level = r.u8()?;
        let key_exchange = if version.has_key_exchange() {
            let key_type = r.u8()?;
            let key_len = r.u8()?;
            if key_len == 0 {
                None
            } else if key_len == KEYX_BLOCK_LEN {
                Some(KeyExchangeBlock {
                    key_type,
                    p: r.u64()?,
                    g: r.u64()?,
                    server_public: r.u64()?,
                })
            } else {
                return Err(ProtoError::BadHandshake(format!(
                    "bad key-exchange block length {key_len}"
                )));
            }
        } else {
            None
        };
        let component_version = if version.has_component_version() {
            let _container = r.u8()?;
            r.short_string()?
        } else {
            String::new()
        };

        Ok(ConnectAck {
            version,
            max_msg_size,
            session_flags: sess_flags,
            ping_timeout,
            major_version,
            minor_version,
            compression,
            compression_level,
            key_exchange,
            component_version,
        })
    }
}

/// Server refusal carrying human-readable text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectNak {
    pub text: String,
}

impl ConnectNak {
    pub fn encode(&self) -> Result<Vec<u8>, ProtoError> {
        let mut out = vec![0u8, 0u8, flags::CONN_NAK, 0x00];
        let text = self.text.as_bytes();
        if text.len() > u16::MAX as usize {
            return Err(ProtoError::BadHandshake("nak text too long".into()));
        }
        out.extend_from_slice(&(text.len() as u16).to_be_bytes());
        out.extend_from_slice(text);
        finish_frame(out)
    }

    pub fn parse(frame: &[u8]) -> Result<ConnectNak, ProtoError> {
        let mut r = Reader::new(frame, "connect nak");
        r.skip(2)?;
        let flag_byte = r.u8()?;
        if flag_byte & flags::CONN_NAK == 0 {
            return Err(ProtoError::BadHandshake(format!(
                "unexpected flag byte 0x{flag_byte:02x} on connect nak"
            )));
        }
        r.skip(1)?;
        let len = r.u16()? as usize;
        let text = r.bytes(len)?;
        Ok(ConnectNak {
            text: String::from_utf8_lossy(text).into_owned(),
        })
    }
}

/// Third handshake leg: the client's public key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientKey {
    pub key_type: u8,
    pub client_public: u64,
}

impl ClientKey {
    pub fn encode(&self) -> Result<Vec<u8>, ProtoError> {
        let mut out = vec![0u8, 0u8, flags::CLIENT_KEY];
        out.push(self.key_type);
        out.push(8);
        out.extend_from_slice(&self.client_public.to_be_bytes());
        finish_frame(out)
    }

    pub fn parse(frame: &[u8]) -> Result<ClientKey, ProtoError> {
        let mut r = Reader::new(frame, "client key");
        r.skip(2)?;
        let flag_byte = r.u8()?;
        if flag_byte & flags::CLIENT_KEY == 0 {
            return Err(ProtoError::BadHandshake(format!(
                "unexpected flag byte 0x{flag_byte:02x} on client key"
            )));
        }
        let key_type = r.u8()?;
        let key_len = r.u8()?;
        if key_len != 8 {
            return Err(ProtoError::BadHandshake(format!(
                "bad client key length {key_len}"
            )));
        }
        Ok(ClientKey {
            key_type,
            client_public: r.u64()?,
        })
    }
}

/// Reads one length-prefixed handshake frame from the front of `buf`.
///
/// Returns the frame slice and bytes consumed, or `None` when incomplete.
pub fn next_handshake_frame(buf: &[u8]) -> Result<Option<(&[u8], usize)>, ProtoError> {
    if buf.len() < BASE_HEADER_LEN {
        return Ok(None);
    }
    let length = u16::from_be_bytes([buf[0], buf[1]]) as usize;
    if length < BASE_HEADER_LEN {
        return Err(ProtoError::FrameTooShort(length));
    }
    if buf.len() < length {
        return Ok(None);
    }
    Ok(Some((&buf[..length], length)))
}

fn finish_frame(mut out: Vec<u8>) -> Result<Vec<u8>, ProtoError> {
    let total = out.len();
    if total > u16::MAX as usize {
        return Err(ProtoError::FrameTooLarge {
            length: total,
            max: u16::MAX as usize,
        });
    }
    out[..2].copy_from_slice(&(total as u16).to_be_bytes());
    Ok(out)
}

fn push_short_string(out: &mut Vec<u8>, value: &str, what: &str) -> Result<(), ProtoError> {
    let bytes = value.as_bytes();
    if bytes.len() > u8::MAX as usize {
        return Err(ProtoError::BadHandshake(format!("{what} too long")));
    }
    out.push(bytes.len() as u8);
    out.extend_from_slice(bytes);
    Ok(())
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
    what: &'static str,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8], what: &'static str) -> Reader<'a> {
        Reader { buf, pos: 0, what }
    }

    fn need(&self, n: usize) -> Result<(), ProtoError> {
        if self.pos + n > self.buf.len() {
            Err(ProtoError::Truncated(self.what))
        } else {
            Ok(())
        }
    }

    fn skip(&mut self, n: usize) -> Result<(), ProtoError> {
        self.need(n)?;
        self.pos += n;
        Ok(())
    }

    fn u8(&mut self) -> Result<u8, ProtoError> {
        self.need(1)?;
        let v = self.buf[self.pos];
        self.pos += 1;
        Ok(v)
    }

    fn u16(&mut self) -> Result<u16, ProtoError> {
        self.need(2)?;
        let v = u16::from_be_bytes([self.buf[self.pos], self.buf[self.pos + 1]]);
        self.pos += 2;
        Ok(v)
    }

    fn u32(&mut self) -> Result<u32, ProtoError> {
        self.need(4)?;
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&self.buf[self.pos..self.pos + 4]);
        self.pos += 4;
        Ok(u32::from_be_bytes(raw))
    }

    fn u64(&mut self) -> Result<u64, ProtoError> {
        self.need(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&self.buf[self.pos..self.pos + 8]);
        self.pos += 8;
        Ok(u64::from_be_bytes(raw))
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8], ProtoError> {
        self.need(n)?;
        let v = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(v)
    }

    fn short_string(&mut self) -> Result<String, ProtoError> {
        let len = self.u8()? as usize;
        let raw = self.bytes(len)?;
        Ok(String::from_utf8_lossy(raw).into_owned())
    }
}
