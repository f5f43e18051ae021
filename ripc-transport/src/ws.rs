//! WebSocket session framing.
//!
//! When the peer negotiated a WebSocket subprotocol, frames on the wire
//! are RFC 6455 frames. The `rssl.rwf` subprotocol carries complete RIPC
//! frames inside binary messages, so the RIPC codec keeps doing the
//! packing, fragmentation and compression work; the JSON subprotocols
//! carry JSON texts packed into arrays, with permessage-deflate as the
//! compression layer and `[{"Type":"Ping"}]` heartbeats.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use tracing::{debug, trace};

use ripc_proto::frame::FrameHeader;
use ripc_proto::ws::frame as ws_frame;
use ripc_proto::ws::frame::{WsFrameHeader, WsOpcode};
use ripc_proto::ws::handshake::DeflateParams;
use ripc_proto::ws::{DEFLATE_TRAILER, JSON_PING, JSON_PONG, SubProtocol};

use crate::buffer::{PoolBuffer, Storage};
use crate::compress::{CompressionType, Compressor, Decompressor};
use crate::error::{Result, TransportError};
use crate::scheduler::{Priority, QueuedRange};
use crate::session::read::{ReadEvent, ReadStatus, Step};
use crate::session::write::WriteArgs;
use crate::session::{Role, Session, SessionState};

/// An in-flight fragmented WebSocket message.
pub(crate) struct WsAssembly {
    opcode: WsOpcode,
    rsv1: bool,
    data: Vec<u8>,
}

/// Per-session WebSocket state.
pub(crate) struct WsState {
    pub(crate) protocol: SubProtocol,
    pub(crate) deflate_out: Option<Compressor>,
    pub(crate) deflate_in: Option<Decompressor>,
    pub(crate) deflate_params: Option<DeflateParams>,
    pub(crate) continuation: Option<WsAssembly>,
    /// Unwrapped RIPC byte stream (`rssl.rwf` only).
    pub(crate) inner: Vec<u8>,
    pub(crate) inner_pos: usize,
    pub(crate) close_sent: bool,
    rng: StdRng,
}

impl WsState {
    pub(crate) fn new(
        protocol: SubProtocol,
        deflate: Option<DeflateParams>,
        compression_level: u8,
    ) -> WsState {
        let (deflate_out, deflate_in) = match deflate {
            Some(_) => (
                Compressor::new(CompressionType::Zlib, compression_level, false),
                Decompressor::new(CompressionType::Zlib, false),
            ),
            None => (None, None),
        };
        WsState {
            protocol,
            deflate_out,
            deflate_in,
            deflate_params: deflate,
            continuation: None,
            inner: Vec::new(),
            inner_pos: 0,
            close_sent: false,
            rng: StdRng::from_entropy(),
        }
    }

    /// Client frames are always masked with a fresh nonzero key; server
    /// frames never are.
    pub(crate) fn mask_key(&mut self, role: Role) -> Option<[u8; 4]> {
        match role {
            Role::Client => loop {
                let key = self.rng.next_u32();
                if key != 0 {
                    return Some(key.to_be_bytes());
                }
            },
            Role::Server => None,
        }
    }
}

/// Guard on assembled message size: a few frames of slack over the
/// negotiated maximum.
fn assembly_limit(session: &Session) -> usize {
    session.negotiated.max_msg_size as usize * 4
}

/// One step of the WebSocket read loop.
pub(crate) fn ws_read_step(session: &mut Session) -> Result<Step> {
    if let Some(step) = next_inner_frame(session)? {
        return Ok(step);
    }

    let (header, header_len) =
        match WsFrameHeader::parse(&session.input[session.input_pos..])? {
            Some(parsed) => parsed,
            None => return Ok(Step::NeedData),
        };
    if header.payload_len > assembly_limit(session) as u64 {
        return Err(TransportError::ProtocolError(format!(
            "websocket frame of {} bytes exceeds the session maximum",
            header.payload_len
        )));
    }
    let total = header_len + header.payload_len as usize;
    if session.input.len() - session.input_pos < total {
        return Ok(Step::NeedData);
    }
    let start = session.input_pos + header_len;
    let mut payload = session.input[start..session.input_pos + total].to_vec();
    session.input_pos += total;

    match (session.role, header.mask_key) {
        (Role::Server, None) => {
            return Err(TransportError::ProtocolError(
                "client frame arrived unmasked".into(),
            ));
        }
        (Role::Client, Some(_)) => {
            return Err(TransportError::ProtocolError(
                "server frame arrived masked".into(),
            ));
        }
        (_, Some(key)) => ws_frame::apply_mask(&mut payload, key, 0),
        (_, None) => {}
    }

    match header.opcode {
        WsOpcode::Ping => {
            trace!(len = payload.len(), "websocket ping");
            session.stats.pings_received += 1;
            queue_control(session, WsOpcode::Pong, &payload)?;
            let _ = session.flush()?;
            let more = session.has_buffered();
            Ok(Step::Event(ReadEvent {
                buffer: None,
                status: ReadStatus::Ping,
                more_data: more,
            }))
        }
        WsOpcode::Pong => {
            let more = session.has_buffered();
            Ok(Step::Event(ReadEvent {
                buffer: None,
                status: ReadStatus::Ping,
                more_data: more,
            }))
        }
        WsOpcode::Close => {
            let code = ws_frame::parse_close_code(&payload)
                .unwrap_or(ripc_proto::ws::CloseCode::Normal as u16);
            debug!(code, "websocket close received");
            let ws = session.ws.as_mut().expect("websocket session");
            if !ws.close_sent {
                ws.close_sent = true;
                let reply_payload = ws_frame::encode_close_payload(code, b"");
                let reply_header = WsFrameHeader {
                    fin: true,
                    rsv1: false,
                    opcode: WsOpcode::Close,
                    payload_len: reply_payload.len() as u64,
                    mask_key: ws.mask_key(session.role),
                };
                let mut reply = Vec::with_capacity(reply_payload.len() + 8);
                ws_frame::encode_frame(&reply_header, &reply_payload, &mut reply);
                let _ = session.transport.as_transport().write(&reply);
            }
            session.state = SessionState::Closing;
            Err(TransportError::ChannelClosed(format!(
                "websocket close received (status {code})"
            )))
        }
        WsOpcode::Continuation => {
            let limit = assembly_limit(session);
            let ws = session.ws.as_mut().expect("websocket session");
            let Some(assembly) = &mut ws.continuation else {
                return Err(TransportError::ProtocolError(
                    "continuation frame without a message in progress".into(),
                ));
            };
            if assembly.data.len() + payload.len() > limit {
                return Err(TransportError::ProtocolError(
                    "fragmented websocket message too large".into(),
                ));
            }
            assembly.data.extend_from_slice(&payload);
            if !header.fin {
                return Ok(Step::Continue);
            }
            let assembly = ws.continuation.take().expect("assembly in progress");
            finish_message(session, assembly)
        }
        WsOpcode::Text | WsOpcode::Binary => {
            let ws = session.ws.as_mut().expect("websocket session");
            if ws.continuation.is_some() {
                return Err(TransportError::ProtocolError(
                    "data frame interleaved with a fragmented message".into(),
                ));
            }
            let assembly = WsAssembly {
                opcode: header.opcode,
                rsv1: header.rsv1,
                data: payload,
            };
            if header.fin {
                finish_message(session, assembly)
            } else {
                ws.continuation = Some(assembly);
                Ok(Step::Continue)
            }
        }
    }
}

fn finish_message(session: &mut Session, assembly: WsAssembly) -> Result<Step> {
    let mut data = assembly.data;
    if assembly.rsv1 {
        data = inflate_message(session, &data)?;
    }
    let protocol = session.ws.as_ref().expect("websocket session").protocol;

    if protocol.is_json() {
        if data == JSON_PING {
            session.stats.pings_received += 1;
            queue_json_pong(session)?;
            let _ = session.flush()?;
            let more = session.has_buffered();
            return Ok(Step::Event(ReadEvent {
                buffer: None,
                status: ReadStatus::Ping,
                more_data: more,
            }));
        }
        if data == JSON_PONG {
            let more = session.has_buffered();
            return Ok(Step::Event(ReadEvent {
                buffer: None,
                status: ReadStatus::Ping,
                more_data: more,
            }));
        }
        session.stats.messages_read += 1;
        let more = session.has_buffered();
        return Ok(Step::Event(ReadEvent {
            buffer: Some(data),
            status: ReadStatus::Success,
            more_data: more,
        }));
    }

    if assembly.opcode != WsOpcode::Binary {
        return Err(TransportError::ProtocolError(
            "rwf payload must ride binary frames".into(),
        ));
    }
    let ws = session.ws.as_mut().expect("websocket session");
    ws.inner.extend_from_slice(&data);
    Ok(Step::Continue)
}

/// Parses one RIPC frame out of the unwrapped binary stream.
fn next_inner_frame(session: &mut Session) -> Result<Option<Step>> {
    let version = session.negotiated.version;
    let max = session.negotiated.max_msg_size as usize;
    let (header, payload) = {
        let ws = session.ws.as_mut().expect("websocket session");
        if ws.protocol.is_json() {
            return Ok(None);
        }
        if ws.inner_pos > 0 {
            ws.inner.drain(..ws.inner_pos);
            ws.inner_pos = 0;
        }
        let Some((header, header_len)) = FrameHeader::parse(&ws.inner, version)? else {
            return Ok(None);
        };
        let frame_len = header.length as usize;
        if frame_len > max {
            return Err(TransportError::ProtocolError(format!(
                "frame of {frame_len} bytes exceeds negotiated maximum {max}"
            )));
        }
        if ws.inner.len() < frame_len {
            return Ok(None);
        }
        let payload = ws.inner[header_len..frame_len].to_vec();
        ws.inner.drain(..frame_len);
        (header, payload)
    };
    session.process_frame(header, payload).map(Some)
}

/// permessage-deflate inflate: restore the stripped trailer, inflate,
/// and reset the context when no-context-takeover applies inbound.
fn inflate_message(session: &mut Session, data: &[u8]) -> Result<Vec<u8>> {
    let limit = assembly_limit(session);
    let role = session.role;
    let ws = session.ws.as_mut().expect("websocket session");
    let Some(inflater) = ws.deflate_in.as_mut() else {
        return Err(TransportError::ProtocolError(
            "compressed frame but permessage-deflate was not negotiated".into(),
        ));
    };
    let mut input = Vec::with_capacity(data.len() + DEFLATE_TRAILER.len());
    input.extend_from_slice(data);
    input.extend_from_slice(&DEFLATE_TRAILER);
    let mut out = Vec::new();
    inflater.decompress(&input, &mut out, limit)?;
    let reset = match (role, ws.deflate_params) {
        (Role::Server, Some(params)) => params.client_no_context_takeover,
        (Role::Client, Some(params)) => params.server_no_context_takeover,
        _ => false,
    };
    if reset {
        inflater.reset();
    }
    Ok(out)
}

/// permessage-deflate deflate: compress, strip the trailer, reset when
/// no-context-takeover applies outbound.
fn deflate_message(session: &mut Session, data: &[u8]) -> Result<Vec<u8>> {
    let role = session.role;
    let ws = session.ws.as_mut().expect("websocket session");
    let Some(deflater) = ws.deflate_out.as_mut() else {
        return Err(TransportError::InternalError(
            "deflate requested without a context".into(),
        ));
    };
    let mut out = Vec::new();
    deflater.compress(data, &mut out)?;
    if out.ends_with(&DEFLATE_TRAILER) {
        out.truncate(out.len() - DEFLATE_TRAILER.len());
    }
    let reset = match (role, ws.deflate_params) {
        (Role::Client, Some(params)) => params.client_no_context_takeover,
        (Role::Server, Some(params)) => params.server_no_context_takeover,
        _ => false,
    };
    if reset {
        deflater.reset();
    }
    Ok(out)
}

/// Queues a control frame on the High queue.
fn queue_control(session: &mut Session, opcode: WsOpcode, payload: &[u8]) -> Result<()> {
    let mask_key = {
        let role = session.role;
        session
            .ws
            .as_mut()
            .expect("websocket session")
            .mask_key(role)
    };
    let header = WsFrameHeader {
        fin: true,
        rsv1: false,
        opcode,
        payload_len: payload.len() as u64,
        mask_key,
    };
    let mut bytes = Vec::with_capacity(header.encoded_len() + payload.len());
    ws_frame::encode_frame(&header, payload, &mut bytes);
    let mut slab = session.alloc_slab()?;
    slab.bytes_mut()[..bytes.len()].copy_from_slice(&bytes);
    let len = bytes.len();
    session.enqueue_range(Priority::High, QueuedRange::new(Arc::new(slab), 0, len));
    Ok(())
}

pub(crate) fn queue_json_ping(session: &mut Session) -> Result<()> {
    queue_json_heartbeat(session, JSON_PING)
}

fn queue_json_pong(session: &mut Session) -> Result<()> {
    queue_json_heartbeat(session, JSON_PONG)
}

fn queue_json_heartbeat(session: &mut Session, body: &[u8]) -> Result<()> {
    let mask_key = {
        let role = session.role;
        session
            .ws
            .as_mut()
            .expect("websocket session")
            .mask_key(role)
    };
    let header = WsFrameHeader {
        fin: true,
        rsv1: false,
        opcode: WsOpcode::Text,
        payload_len: body.len() as u64,
        mask_key,
    };
    let mut bytes = Vec::with_capacity(header.encoded_len() + body.len());
    ws_frame::encode_frame(&header, body, &mut bytes);
    let mut slab = session.alloc_slab()?;
    slab.bytes_mut()[..bytes.len()].copy_from_slice(&bytes);
    let len = bytes.len();
    session.enqueue_range(Priority::High, QueuedRange::new(Arc::new(slab), 0, len));
    Ok(())
}

/// JSON write path: enclose the message (or packed messages) in an
/// array, optionally permessage-deflate it, and send one text frame.
pub(crate) fn write_json(
    session: &mut Session,
    buffer: &mut PoolBuffer,
    args: &WriteArgs,
) -> Result<usize> {
    let payload = if buffer.is_packed() {
        crate::session::write::stamp_packed_entry(buffer);
        if buffer.packing_offset == 0 {
            let _ = Session::take_storage(buffer);
            return Ok(0);
        }
        let (slab, headroom, entries) = match Session::take_storage(buffer) {
            Storage::Pooled(slab) => (slab, buffer.headroom, buffer.packing_offset),
            _ => unreachable!("packed buffers are pooled"),
        };
        let mut payload = Vec::with_capacity(entries + 1);
        payload.extend_from_slice(&slab.bytes()[headroom..headroom + entries]);
        payload.push(b']');
        payload
    } else {
        if buffer.is_empty() {
            return Err(TransportError::InvalidArgument(
                "write of an empty buffer".into(),
            ));
        }
        let mut payload = Vec::with_capacity(buffer.len() + 2);
        payload.push(b'[');
        payload.extend_from_slice(buffer.as_slice());
        payload.push(b']');
        let _ = Session::take_storage(buffer);
        payload
    };

    let (body, rsv1) = if session
        .ws
        .as_ref()
        .expect("websocket session")
        .deflate_out
        .is_some()
        && !args.do_not_compress
    {
        (deflate_message(session, &payload)?, true)
    } else {
        (payload, false)
    };

    let mask_key = {
        let role = session.role;
        session
            .ws
            .as_mut()
            .expect("websocket session")
            .mask_key(role)
    };
    let header = WsFrameHeader {
        fin: true,
        rsv1,
        opcode: WsOpcode::Text,
        payload_len: body.len() as u64,
        mask_key,
    };
    let mut slab = session.alloc_slab()?;
    let mut encoded = Vec::with_capacity(header.encoded_len());
    header.encode_into(&mut encoded);
    if encoded.len() + body.len() > slab.bytes().len() {
        return Err(TransportError::InvalidArgument(
            "websocket message exceeds the frame size".into(),
        ));
    }
    slab.bytes_mut()[..encoded.len()].copy_from_slice(&encoded);
    slab.bytes_mut()[encoded.len()..encoded.len() + body.len()].copy_from_slice(&body);
    if let Some(key) = mask_key {
        ws_frame::apply_mask(
            &mut slab.bytes_mut()[encoded.len()..encoded.len() + body.len()],
            key,
            0,
        );
    }
    let total = encoded.len() + body.len();
    session.enqueue_range(args.priority, QueuedRange::new(Arc::new(slab), 0, total));
    Ok(total)
}
