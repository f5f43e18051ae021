//! The session read path: frame parsing, decompression, reassembly and
//! packed-message iteration over an opportunistically filled input
//! buffer.

use tracing::trace;

use ripc_proto::frame::{self, FragmentInfo, FrameHeader};

use crate::error::{Result, TransportError};
use crate::session::{PackedCursor, PendingComp, Session, SessionState};

/// Outcome of one `read` call.
#[derive(Debug)]
pub struct ReadEvent {
    /// A complete reassembled message, when one finished this call.
    pub buffer: Option<Vec<u8>>,
    pub status: ReadStatus,
    /// More parseable data is already buffered; call `read` again before
    /// waiting on the transport.
    pub more_data: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    Success,
    WouldBlock,
    /// A heartbeat arrived (and, for WebSocket, was answered).
    Ping,
    /// The tunnel finished swapping file descriptors.
    FdChange,
}

/// One step of the frame loop.
pub(crate) enum Step {
    Event(ReadEvent),
    /// A frame was consumed without completing a message.
    Continue,
    /// The input buffer holds no complete frame.
    NeedData,
}

impl Session {
    /// Reads the next message, heartbeat, or transport event.
    ///
    /// Returns `WouldBlock` status when the transport has nothing
    /// buffered. A returned message may coexist with `more_data`, in
    /// which case the caller should read again without waiting.
    pub fn read(&mut self) -> Result<ReadEvent> {
        self.ensure_active()?;
        self.read_loop().map_err(|err| self.fail(err))
    }

    fn read_loop(&mut self) -> Result<ReadEvent> {
        if let Some(tunnel) = self.transport.tunnel_mut() {
            if tunnel.take_fd_change() {
                let more = self.has_buffered();
                return Ok(ReadEvent {
                    buffer: None,
                    status: ReadStatus::FdChange,
                    more_data: more,
                });
            }
        }

        loop {
            if let Some(event) = self.next_packed()? {
                return Ok(event);
            }

            let step = if self.ws.is_some() {
                crate::ws::ws_read_step(self)?
            } else {
                self.ripc_read_step()?
            };

            match step {
                Step::Event(event) => return Ok(event),
                Step::Continue => continue,
                Step::NeedData => {
                    if !self.fill_input()? {
                        // Filling may have completed a pending FD swap.
                        if let Some(tunnel) = self.transport.tunnel_mut() {
                            if tunnel.take_fd_change() {
                                return Ok(ReadEvent {
                                    buffer: None,
                                    status: ReadStatus::FdChange,
                                    more_data: false,
                                });
                            }
                        }
                        return Ok(ReadEvent {
                            buffer: None,
                            status: ReadStatus::WouldBlock,
                            more_data: false,
                        });
                    }
                }
            }
        }
    }

    /// Parses one RIPC frame from the input buffer.
    fn ripc_read_step(&mut self) -> Result<Step> {
        let version = self.negotiated.version;
        let (header, header_len) =
            match FrameHeader::parse(&self.input[self.input_pos..], version)? {
                Some(parsed) => parsed,
                None => return Ok(Step::NeedData),
            };
        let frame_len = header.length as usize;
        if frame_len > self.negotiated.max_msg_size as usize {
            return Err(TransportError::ProtocolError(format!(
                "frame of {frame_len} bytes exceeds negotiated maximum {}",
                self.negotiated.max_msg_size
            )));
        }
        if self.input.len() - self.input_pos < frame_len {
            return Ok(Step::NeedData);
        }
        let start = self.input_pos + header_len;
        let payload = self.input[start..self.input_pos + frame_len].to_vec();
        self.input_pos += frame_len;
        self.process_frame(header, payload)
    }

    /// Routes one parsed frame through decompression, reassembly, and
    /// packing.
    pub(crate) fn process_frame(
        &mut self,
        header: FrameHeader,
        payload: Vec<u8>,
    ) -> Result<Step> {
        if !header.is_data() {
            return Err(TransportError::ProtocolError(format!(
                "unexpected frame flags 0x{:02x} on an active session",
                header.flags
            )));
        }

        if payload.is_empty()
            && !header.is_packed()
            && !header.is_compressed()
            && header.fragment.is_none()
        {
            self.stats.pings_received += 1;
            let more = self.has_buffered();
            return Ok(Step::Event(ReadEvent {
                buffer: None,
                status: ReadStatus::Ping,
                more_data: more,
            }));
        }

        let mut fragment = header.fragment;
        let mut packed = header.is_packed();
        let mut data = payload;

        if header.is_compressed() {
            if header.is_comp_fragment() {
                if self.pending_comp.is_some() {
                    return Err(TransportError::ProtocolError(
                        "compressed fragment while one is already pending".into(),
                    ));
                }
                trace!(len = data.len(), "stashing first compressed fragment");
                self.pending_comp = Some(PendingComp {
                    fragment,
                    packed,
                    data,
                });
                return Ok(Step::Continue);
            }
            if let Some(pending) = self.pending_comp.take() {
                let mut joined = pending.data;
                joined.extend_from_slice(&data);
                fragment = pending.fragment;
                packed = pending.packed;
                let limit = self.decompress_limit(fragment);
                data = self.decompress_payload(&joined, limit)?;
            } else {
                let limit = self.max_user_payload();
                data = self.decompress_payload(&data, limit)?;
            }
        } else if self.pending_comp.is_some() {
            return Err(TransportError::ProtocolError(
                "expected the second half of a compressed payload".into(),
            ));
        }

        if let Some(info) = fragment {
            let completed = match info {
                FragmentInfo::First { total_len, id } => {
                    self.reassembly.begin(id, total_len, &data)?
                }
                FragmentInfo::Continuation { id } => self.reassembly.append(id, &data)?,
            };
            match completed {
                Some(message) => data = message,
                None => return Ok(Step::Continue),
            }
        }

        if packed {
            self.pending_packed = Some(PackedCursor {
                payload: data,
                pos: 0,
            });
            return match self.next_packed()? {
                Some(event) => Ok(Step::Event(event)),
                None => Ok(Step::Continue),
            };
        }

        self.stats.messages_read += 1;
        let more = self.has_buffered();
        Ok(Step::Event(ReadEvent {
            buffer: Some(data),
            status: ReadStatus::Success,
            more_data: more,
        }))
    }

    /// Hands out the next message packed inside the current frame.
    /// Packed events always report `more_data` so the caller comes back
    /// for the residual without waiting on the transport.
    fn next_packed(&mut self) -> Result<Option<ReadEvent>> {
        let Some(mut cursor) = self.pending_packed.take() else {
            return Ok(None);
        };
        match frame::next_packed_entry(&cursor.payload, cursor.pos)? {
            Some((range, next)) => {
                let message = cursor.payload[range].to_vec();
                cursor.pos = next;
                let drained = matches!(
                    frame::next_packed_entry(&cursor.payload, next),
                    Ok(None)
                );
                if !drained {
                    self.pending_packed = Some(cursor);
                }
                self.stats.messages_read += 1;
                Ok(Some(ReadEvent {
                    buffer: Some(message),
                    status: ReadStatus::Success,
                    more_data: true,
                }))
            }
            None => Ok(None),
        }
    }

    fn decompress_limit(&self, fragment: Option<FragmentInfo>) -> usize {
        match fragment {
            Some(FragmentInfo::First { total_len, .. }) => total_len as usize,
            Some(FragmentInfo::Continuation { .. }) => self.max_user_payload(),
            // Small-payload spillover: at most two frames of output.
            None => self.max_user_payload() * 2,
        }
    }

    pub(crate) fn decompress_payload(&mut self, input: &[u8], limit: usize) -> Result<Vec<u8>> {
        let decomp = self
            .comp_in
            .as_mut()
            .ok_or_else(|| {
                TransportError::ProtocolError(
                    "compressed frame on a session without compression".into(),
                )
            })?;
        let mut out = Vec::new();
        let outcome = decomp.decompress(input, &mut out, limit)?;
        trace!(
            bytes_in = outcome.bytes_in_used,
            bytes_out = outcome.bytes_out_used,
            "decompressed payload"
        );
        Ok(out)
    }

    /// Fills the input buffer from the transport. `Ok(false)` means the
    /// transport would block.
    pub(crate) fn fill_input(&mut self) -> Result<bool> {
        if self.input_pos > 0 {
            self.input.drain(..self.input_pos);
            self.input_pos = 0;
        }
        let old_len = self.input.len();
        let target = self.read_size.max(old_len + 1024);
        self.input.resize(target, 0);
        let result = self.transport.as_transport().read(&mut self.input[old_len..]);
        match result {
            Ok(0) => {
                self.input.truncate(old_len);
                self.state = SessionState::Closing;
                Err(TransportError::ChannelClosed(
                    "peer closed the connection".into(),
                ))
            }
            Ok(n) => {
                self.input.truncate(old_len + n);
                self.stats.bytes_read += n as u64;
                Ok(true)
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                self.input.truncate(old_len);
                Ok(false)
            }
            Err(err) => {
                self.input.truncate(old_len);
                Err(TransportError::ChannelClosed(err.to_string()))
            }
        }
    }

    /// Whether buffered bytes may yield another message without a
    /// transport read.
    pub(crate) fn has_buffered(&self) -> bool {
        if self.pending_packed.is_some() {
            return true;
        }
        if self.input_remaining() > 0 {
            return true;
        }
        if let Some(ws) = &self.ws {
            if ws.inner.len() > ws.inner_pos {
                return true;
            }
        }
        false
    }
}
