//! The session write path: framing, packing, compression, and
//! fragmentation chains.

use std::sync::Arc;

use tracing::trace;

use ripc_proto::constants::{PING_FRAME, flags};
use ripc_proto::frame::{FragmentInfo, FrameHeader};
use ripc_proto::ws::WsOpcode;
use ripc_proto::ws::frame as ws_frame;

use crate::buffer::{PoolBuffer, Storage};
use crate::compress::{Compressor, ZLIB_GROWTH_MARGIN};
use crate::error::{Result, TransportError};
use crate::pool::Slab;
use crate::scheduler::{Priority, QueuedRange};
use crate::session::{FRAME_HEADROOM, Session};

/// Per-write options.
#[derive(Debug, Clone)]
pub struct WriteArgs {
    pub priority: Priority,
    /// Flush immediately instead of waiting for the high-water mark.
    pub direct_write: bool,
    pub do_not_compress: bool,
}

impl Default for WriteArgs {
    fn default() -> WriteArgs {
        WriteArgs {
            priority: Priority::Medium,
            direct_write: false,
            do_not_compress: false,
        }
    }
}

impl Session {
    /// Frames and queues a filled buffer. Returns the bytes queued on
    /// the session afterwards.
    ///
    /// A fragmentation chain that runs out of pool buffers mid-stream
    /// returns [`TransportError::WriteCallAgain`]; the buffer keeps its
    /// split position and fragment id, and the caller retries with the
    /// same handle once buffers free up.
    pub fn write(&mut self, buffer: &mut PoolBuffer, args: &WriteArgs) -> Result<usize> {
        self.ensure_active()?;
        self.write_impl(buffer, args).map_err(|err| self.fail(err))
    }

    fn write_impl(&mut self, buffer: &mut PoolBuffer, args: &WriteArgs) -> Result<usize> {
        if buffer.is_spent() {
            return Err(TransportError::InvalidArgument(
                "buffer was already written".into(),
            ));
        }
        let queued_before = self.stats.bytes_queued;

        if self.ws.as_ref().is_some_and(|ws| ws.protocol.is_json()) {
            crate::ws::write_json(self, buffer, args)?;
        } else if buffer.is_packed() {
            self.write_packed(buffer, args)?;
        } else {
            match &buffer.storage {
                Storage::Heap(_) => self.write_fragmented(buffer, args)?,
                Storage::Pooled(_) => self.write_single(buffer, args)?,
                Storage::Spent => unreachable!("checked above"),
            }
        }

        self.stats.bytes_out_last_msg = (self.stats.bytes_queued - queued_before) as usize;
        self.stats.messages_written += 1;

        let queued = self.scheduler.queued_bytes();
        if args.direct_write || queued > self.high_water_mark {
            return self.flush();
        }
        Ok(queued)
    }

    /// Single unfragmented message already sitting in a pool slab.
    fn write_single(&mut self, buffer: &mut PoolBuffer, args: &WriteArgs) -> Result<()> {
        let len = buffer.len();
        if len == 0 {
            return Err(TransportError::InvalidArgument(
                "write of an empty buffer".into(),
            ));
        }
        let headroom = buffer.headroom;
        self.emit_message(buffer, headroom, len, 0, args)
    }

    /// Packed buffer: stamp the trailing entry and send the accumulated
    /// region as one frame.
    fn write_packed(&mut self, buffer: &mut PoolBuffer, args: &WriteArgs) -> Result<()> {
        stamp_packed_entry(buffer);
        let payload_len = buffer.packing_offset;
        if payload_len == 0 {
            // Every message was elided; nothing reaches the wire.
            let _ = Self::take_storage(buffer);
            return Ok(());
        }
        let headroom = buffer.headroom;
        self.emit_message(buffer, headroom, payload_len, flags::PACKING, args)
    }

    /// Emits one frame-sized message, compressing when the session and
    /// arguments allow it.
    ///
    /// LZ4 keeps no stream context, so compression is speculative: if
    /// the result does not fit the two-frame spillover, the payload goes
    /// out uncompressed. zlib always commits (the stream context has
    /// advanced) and relies on the sync-flush growth bound.
    fn emit_message(
        &mut self,
        buffer: &mut PoolBuffer,
        headroom: usize,
        payload_len: usize,
        extra_flags: u8,
        args: &WriteArgs,
    ) -> Result<()> {
        if self.compression_eligible(payload_len, args) {
            let payload = match &buffer.storage {
                Storage::Pooled(slab) => slab.bytes()[headroom..headroom + payload_len].to_vec(),
                _ => unreachable!("frame-sized messages are pooled"),
            };
            let compressed = self.compress_raw(&payload)?;
            let cap1 = self.frame_payload_cap(None);
            let cap2 = self.frame_payload_cap(None);
            let commit = match self.comp_out {
                Some(Compressor::Lz4) => compressed.len() <= cap1 + cap2,
                _ => true,
            };
            if commit {
                let _ = Self::take_storage(buffer);
                self.compress_queue.get_or_insert(args.priority);
                return self.emit_compressed(&compressed, None, extra_flags, args.priority);
            }
            trace!(
                payload_len,
                compressed = compressed.len(),
                "compressed payload would not fit two frames, sending plain"
            );
        }

        let header = FrameHeader {
            length: 0,
            flags: flags::DATA | extra_flags,
            opcode: 0,
            fragment: None,
        };
        let Storage::Pooled(slab) = Self::take_storage(buffer) else {
            unreachable!("frame-sized messages are pooled");
        };
        self.emit_in_place(slab, header, headroom, payload_len, args.priority)
    }

    /// Oversized message: split the heap payload into a fragment chain.
    fn write_fragmented(&mut self, buffer: &mut PoolBuffer, args: &WriteArgs) -> Result<()> {
        let total = buffer.len();
        if buffer.frag_id == 0 {
            buffer.frag_id = self.alloc_frag_id();
        }
        let id = buffer.frag_id;

        // LZ4 compresses the whole message and relies on the two-frame
        // spillover; it keeps no context, so a result that does not fit
        // falls back to the plain chain below.
        if buffer.write_cursor == 0
            && matches!(self.comp_out, Some(Compressor::Lz4))
            && self.compression_eligible(total, args)
        {
            let fragment = FragmentInfo::First {
                total_len: total as u32,
                id,
            };
            let cap1 = self.frame_payload_cap(Some(fragment));
            let cap2 = self.frame_payload_cap(Some(FragmentInfo::Continuation { id }));
            let payload = match &buffer.storage {
                Storage::Heap(bytes) => bytes[..total].to_vec(),
                _ => unreachable!("fragment chains are heap backed"),
            };
            let compressed = self.compress_raw(&payload)?;
            if compressed.len() <= cap1 + cap2 {
                let Some((first, spill)) = self.alloc_slab_pair() else {
                    return Err(TransportError::WriteCallAgain);
                };
                self.compress_queue.get_or_insert(args.priority);
                self.emit_compressed_into(
                    &compressed,
                    Some(fragment),
                    0,
                    args.priority,
                    first,
                    spill,
                )?;
                let _ = Self::take_storage(buffer);
                return Ok(());
            }
            trace!(
                total,
                compressed = compressed.len(),
                "LZ4 output exceeds two frames, fragmenting uncompressed"
            );
        }

        let zlib = matches!(self.comp_out, Some(Compressor::Zlib(_)))
            && self.compression_eligible(total, args);

        while buffer.write_cursor < total {
            let cursor = buffer.write_cursor;
            let fragment = if cursor == 0 {
                FragmentInfo::First {
                    total_len: total as u32,
                    id,
                }
            } else {
                FragmentInfo::Continuation { id }
            };
            let cap = self.frame_payload_cap(Some(fragment));
            let input_cap = if zlib { cap - ZLIB_GROWTH_MARGIN } else { cap };
            let end = (cursor + input_cap).min(total);
            let slice = match &buffer.storage {
                Storage::Heap(bytes) => bytes[cursor..end].to_vec(),
                _ => unreachable!("fragment chains are heap backed"),
            };

            if zlib {
                // Hold both output slabs before touching the stream
                // context so a pool miss stays retryable.
                let Some((first, spill)) = self.alloc_slab_pair() else {
                    trace!(cursor, total, "fragment chain starved, returning call-again");
                    return Err(TransportError::WriteCallAgain);
                };
                let compressed = self.compress_raw(&slice)?;
                self.compress_queue.get_or_insert(args.priority);
                self.emit_compressed_into(
                    &compressed,
                    Some(fragment),
                    0,
                    args.priority,
                    first,
                    spill,
                )?;
            } else {
                let Some(slab) = self.try_alloc_slab()? else {
                    trace!(cursor, total, "fragment chain starved, returning call-again");
                    return Err(TransportError::WriteCallAgain);
                };
                let header = FrameHeader {
                    length: 0,
                    flags: flags::DATA | flags::EXTENDED_FLAGS,
                    opcode: 0,
                    fragment: Some(fragment),
                };
                self.emit_copied(slab, header, &slice, args.priority)?;
            }
            buffer.write_cursor = end;
        }

        let _ = Self::take_storage(buffer);
        Ok(())
    }

    /// Whether this payload may be compressed under the negotiated
    /// algorithm, the per-queue pinning rule, and the size threshold.
    fn compression_eligible(&self, len: usize, args: &WriteArgs) -> bool {
        if self.comp_out.is_none() || args.do_not_compress {
            return false;
        }
        if !self.force_compression && len < self.comp_threshold {
            return false;
        }
        match self.compress_queue {
            Some(pinned) => pinned == args.priority,
            None => true,
        }
    }

    fn compress_raw(&mut self, payload: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let comp = self
            .comp_out
            .as_mut()
            .ok_or_else(|| TransportError::InternalError("compressor missing".into()))?;
        let outcome = comp.compress(payload, &mut out)?;
        trace!(
            bytes_in = outcome.bytes_in_used,
            bytes_out = outcome.bytes_out_used,
            "compressed payload"
        );
        Ok(out)
    }

    /// Payload cap of one frame given its fragmentation fields.
    pub(crate) fn frame_payload_cap(&self, fragment: Option<FragmentInfo>) -> usize {
        let version = self.negotiated.version;
        let header_len = match fragment {
            Some(FragmentInfo::First { .. }) => version.first_fragment_header_len(),
            Some(FragmentInfo::Continuation { .. }) => version.fragment_header_len(),
            None => version.data_header_len(),
        };
        self.negotiated.max_msg_size as usize - header_len
    }

    fn try_alloc_slab(&mut self) -> Result<Option<Slab>> {
        match self.alloc_slab() {
            Ok(slab) => Ok(Some(slab)),
            Err(TransportError::NoBuffers(_)) => Ok(None),
            Err(other) => Err(other),
        }
    }

    fn alloc_slab_pair(&mut self) -> Option<(Slab, Slab)> {
        let first = self.alloc_slab().ok()?;
        match self.alloc_slab() {
            Ok(second) => Some((first, second)),
            Err(_) => None,
        }
    }

    /// Emits a compressed payload, spilling into a second frame when it
    /// does not fit the first.
    fn emit_compressed(
        &mut self,
        compressed: &[u8],
        fragment: Option<FragmentInfo>,
        extra_flags: u8,
        priority: Priority,
    ) -> Result<()> {
        let first = self
            .try_alloc_slab()?
            .ok_or_else(|| TransportError::NoBuffers("no buffer for compressed frame".into()))?;
        let spill = self
            .try_alloc_slab()?
            .ok_or_else(|| TransportError::NoBuffers("no buffer for compressed frame".into()))?;
        self.emit_compressed_into(compressed, fragment, extra_flags, priority, first, spill)
    }

    fn emit_compressed_into(
        &mut self,
        compressed: &[u8],
        fragment: Option<FragmentInfo>,
        extra_flags: u8,
        priority: Priority,
        first_slab: Slab,
        spill_slab: Slab,
    ) -> Result<()> {
        let ext = if fragment.is_some() {
            flags::EXTENDED_FLAGS
        } else {
            0
        };
        let first_cap = self.frame_payload_cap(fragment);

        if compressed.len() <= first_cap {
            drop(spill_slab);
            let header = FrameHeader {
                length: 0,
                flags: flags::DATA | flags::COMP_DATA | ext | extra_flags,
                opcode: 0,
                fragment,
            };
            return self.emit_copied(first_slab, header, compressed, priority);
        }

        // First frame carries the uncompressed header's opcode bits and
        // fragmentation fields; the tail rides a COMP_DATA continuation.
        let tail_fragment = fragment.map(|info| FragmentInfo::Continuation { id: info.id() });
        let tail_cap = self.frame_payload_cap(tail_fragment);
        let tail_len = compressed.len() - first_cap;
        if tail_len > tail_cap {
            return Err(TransportError::CompressionError(format!(
                "compressed payload of {} bytes exceeds two frames",
                compressed.len()
            )));
        }

        let header = FrameHeader {
            length: 0,
            flags: flags::DATA | flags::COMP_DATA | flags::COMP_FRAG | ext | extra_flags,
            opcode: 0,
            fragment,
        };
        self.emit_copied(first_slab, header, &compressed[..first_cap], priority)?;

        let tail_ext = if tail_fragment.is_some() {
            flags::EXTENDED_FLAGS
        } else {
            0
        };
        let tail_header = FrameHeader {
            length: 0,
            flags: flags::DATA | flags::COMP_DATA | tail_ext,
            opcode: 0,
            fragment: tail_fragment,
        };
        self.emit_copied(spill_slab, tail_header, &compressed[first_cap..], priority)
    }

    /// Writes header and payload into a fresh slab and queues it.
    fn emit_copied(
        &mut self,
        mut slab: Slab,
        header: FrameHeader,
        payload: &[u8],
        priority: Priority,
    ) -> Result<()> {
        let encoded = header.encode(payload.len(), self.negotiated.version)?;
        let start = FRAME_HEADROOM - encoded.len();
        slab.bytes_mut()[start..FRAME_HEADROOM].copy_from_slice(&encoded);
        slab.bytes_mut()[FRAME_HEADROOM..FRAME_HEADROOM + payload.len()]
            .copy_from_slice(payload);
        self.finish_frame(slab, start, encoded.len() + payload.len(), priority)
    }

    /// Writes the header in front of a payload already resident in the
    /// slab at the headroom boundary.
    fn emit_in_place(
        &mut self,
        mut slab: Slab,
        header: FrameHeader,
        headroom: usize,
        payload_len: usize,
        priority: Priority,
    ) -> Result<()> {
        let encoded = header.encode(payload_len, self.negotiated.version)?;
        if encoded.len() > headroom {
            return Err(TransportError::InternalError(
                "frame header exceeds reserved headroom".into(),
            ));
        }
        let start = headroom - encoded.len();
        slab.bytes_mut()[start..headroom].copy_from_slice(&encoded);
        self.finish_frame(slab, start, encoded.len() + payload_len, priority)
    }

    /// Final framing step: wrap in a WebSocket frame when the session
    /// negotiated one, freeze the slab, and enqueue.
    pub(crate) fn finish_frame(
        &mut self,
        mut slab: Slab,
        mut start: usize,
        mut len: usize,
        priority: Priority,
    ) -> Result<()> {
        if let Some(ws) = &mut self.ws {
            let mask_key = ws.mask_key(self.role);
            let opcode = if ws.protocol.is_json() {
                WsOpcode::Text
            } else {
                WsOpcode::Binary
            };
            let header = ws_frame::WsFrameHeader {
                fin: true,
                rsv1: false,
                opcode,
                payload_len: len as u64,
                mask_key,
            };
            let mut encoded = Vec::with_capacity(header.encoded_len());
            header.encode_into(&mut encoded);
            if encoded.len() > start {
                return Err(TransportError::InternalError(
                    "websocket header exceeds reserved headroom".into(),
                ));
            }
            if let Some(key) = mask_key {
                ws_frame::apply_mask(&mut slab.bytes_mut()[start..start + len], key, 0);
            }
            let ws_start = start - encoded.len();
            slab.bytes_mut()[ws_start..start].copy_from_slice(&encoded);
            start = ws_start;
            len += encoded.len();
        }
        self.enqueue_range(priority, QueuedRange::new(Arc::new(slab), start, len));
        Ok(())
    }
}

/// Stamps the length prefix (RIPC) or separator (JSON) of the message
/// currently in a packed buffer and advances the packing cursor.
pub(crate) fn stamp_packed_entry(buffer: &mut PoolBuffer) {
    let len = buffer.len();
    if len == 0 {
        return;
    }
    let at = buffer.headroom + buffer.packing_offset;
    let json = buffer.json_packed;
    let first = buffer.packing_offset == 0;
    let overhead = buffer.entry_overhead();
    if let Storage::Pooled(slab) = &mut buffer.storage {
        if json {
            slab.bytes_mut()[at] = if first { b'[' } else { b',' };
        } else {
            slab.bytes_mut()[at..at + 2].copy_from_slice(&(len as u16).to_be_bytes());
        }
    }
    buffer.packing_offset += overhead + len;
    let _ = buffer.take_len();
}

/// Queues the framing-appropriate heartbeat.
pub(crate) fn queue_ping(session: &mut Session) -> Result<()> {
    if session.ws.as_ref().is_some_and(|ws| ws.protocol.is_json()) {
        return crate::ws::queue_json_ping(session);
    }
    let mut slab = session.alloc_slab()?;
    let start = FRAME_HEADROOM - PING_FRAME.len();
    slab.bytes_mut()[start..FRAME_HEADROOM].copy_from_slice(&PING_FRAME);
    session.finish_frame(slab, start, PING_FRAME.len(), Priority::High)
}
