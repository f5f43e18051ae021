//! The RIPC frame header codec.
//!
//! A frame is a 16-bit big-endian total length (header included), one
//! flag byte, an optional opcode byte when `EXTENDED_FLAGS` is set, and
//! optional fragmentation fields selected by the opcode bits. The
//! fragment id is one byte through protocol version 12 and two bytes
//! from version 13 on.

use crate::ProtoError;
use crate::constants::{BASE_HEADER_LEN, RipcVersion, flags, opcodes};

/// Fragmentation fields of an extended frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentInfo {
    /// First frame of a fragmented message; advertises the total
    /// reassembled size.
    First { total_len: u32, id: u16 },
    /// Continuation frame of a fragmented message.
    Continuation { id: u16 },
}

impl FragmentInfo {
    pub fn id(&self) -> u16 {
        match *self {
            FragmentInfo::First { id, .. } => id,
            FragmentInfo::Continuation { id } => id,
        }
    }
}

/// A parsed RIPC frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Total frame length from the wire, header included.
    pub length: u16,
    pub flags: u8,
    /// Valid only when `flags` carries `EXTENDED_FLAGS`.
    pub opcode: u8,
    pub fragment: Option<FragmentInfo>,
}

impl FrameHeader {
    /// A plain data frame header.
    pub fn data() -> FrameHeader {
        FrameHeader {
            length: 0,
            flags: flags::DATA,
            opcode: 0,
            fragment: None,
        }
    }

    pub fn is_data(&self) -> bool {
        self.flags & flags::DATA != 0
    }

    pub fn is_packed(&self) -> bool {
        self.flags & flags::PACKING != 0
    }

    pub fn is_compressed(&self) -> bool {
        self.flags & flags::COMP_DATA != 0
    }

    pub fn is_comp_fragment(&self) -> bool {
        self.flags & flags::COMP_FRAG != 0
    }

    /// Length of the encoded header for `version`.
    pub fn header_len(&self, version: RipcVersion) -> usize {
        let mut len = BASE_HEADER_LEN;
        if self.flags & flags::EXTENDED_FLAGS != 0 {
            len += 1;
            match self.fragment {
                Some(FragmentInfo::First { .. }) => len += 4 + version.fragment_id_len(),
                Some(FragmentInfo::Continuation { .. }) => len += version.fragment_id_len(),
                None => {}
            }
        }
        len
    }

    /// Encodes the header for a frame whose payload is `payload_len`
    /// bytes, returning the encoded bytes. The wire length field covers
    /// header plus payload.
    pub fn encode(&self, payload_len: usize, version: RipcVersion) -> Result<Vec<u8>, ProtoError> {
        let header_len = self.header_len(version);
        let total = header_len + payload_len;
        if total > u16::MAX as usize {
            return Err(ProtoError::FrameTooLarge {
                length: total,
                max: u16::MAX as usize,
            });
        }
        let mut out = Vec::with_capacity(header_len);
        out.extend_from_slice(&(total as u16).to_be_bytes());
        out.push(self.flags);
        if self.flags & flags::EXTENDED_FLAGS != 0 {
            let mut opcode = self.opcode;
            match self.fragment {
                Some(FragmentInfo::First { .. }) => opcode |= opcodes::FRAG_HEADER,
                Some(FragmentInfo::Continuation { .. }) => opcode |= opcodes::FRAG,
                None => {}
            }
            out.push(opcode);
            match self.fragment {
                Some(FragmentInfo::First { total_len, id }) => {
                    out.extend_from_slice(&total_len.to_be_bytes());
                    encode_fragment_id(&mut out, id, version);
                }
                Some(FragmentInfo::Continuation { id }) => {
                    encode_fragment_id(&mut out, id, version);
                }
                None => {}
            }
        }
        Ok(out)
    }

    /// Parses a frame header from the front of `buf`.
    ///
    /// Returns `Ok(None)` when `buf` does not yet hold a complete header;
    /// otherwise the header and its encoded length. The caller checks the
    /// advertised frame length against its own negotiated maximum.
    pub fn parse(buf: &[u8], version: RipcVersion) -> Result<Option<(FrameHeader, usize)>, ProtoError> {
        if buf.len() < BASE_HEADER_LEN {
            return Ok(None);
        }
        let length = u16::from_be_bytes([buf[0], buf[1]]);
        let frame_flags = buf[2];
        if (length as usize) < BASE_HEADER_LEN {
            return Err(ProtoError::FrameTooShort(length as usize));
        }

        let mut header = FrameHeader {
            length,
            flags: frame_flags,
            opcode: 0,
            fragment: None,
        };
        let mut cursor = BASE_HEADER_LEN;

        if frame_flags & flags::EXTENDED_FLAGS != 0 {
            if buf.len() < cursor + 1 {
                return Ok(None);
            }
            let opcode = buf[cursor];
            cursor += 1;
            header.opcode = opcode;

            if opcode & opcodes::FRAG_HEADER != 0 {
                let id_len = version.fragment_id_len();
                if buf.len() < cursor + 4 + id_len {
                    return Ok(None);
                }
                let total_len = u32::from_be_bytes([
                    buf[cursor],
                    buf[cursor + 1],
                    buf[cursor + 2],
                    buf[cursor + 3],
                ]);
                cursor += 4;
                let id = parse_fragment_id(&buf[cursor..], version);
                cursor += id_len;
                header.fragment = Some(FragmentInfo::First { total_len, id });
            } else if opcode & opcodes::FRAG != 0 {
                let id_len = version.fragment_id_len();
                if buf.len() < cursor + id_len {
                    return Ok(None);
                }
                let id = parse_fragment_id(&buf[cursor..], version);
                cursor += id_len;
                header.fragment = Some(FragmentInfo::Continuation { id });
            }
        }

        if (length as usize) < cursor {
            return Err(ProtoError::FrameTooShort(length as usize));
        }
        Ok(Some((header, cursor)))
    }

    /// Payload length implied by the wire length and the parsed header.
    pub fn payload_len(&self, header_len: usize) -> usize {
        self.length as usize - header_len
    }
}

fn encode_fragment_id(out: &mut Vec<u8>, id: u16, version: RipcVersion) {
    if version.fragment_id_len() == 2 {
        out.extend_from_slice(&id.to_be_bytes());
    } else {
        out.push(id as u8);
    }
}

fn parse_fragment_id(buf: &[u8], version: RipcVersion) -> u16 {
    if version.fragment_id_len() == 2 {
        u16::from_be_bytes([buf[0], buf[1]])
    } else {
        buf[0] as u16
    }
}

/// Stamps a packed-message length prefix in front of a packed entry.
pub fn encode_packed_len(out: &mut [u8], len: u16) {
    out[..2].copy_from_slice(&len.to_be_bytes());
}

/// Reads the next packed entry from a packed frame payload.
///
/// Returns the entry range relative to `payload` and the cursor past it,
/// or `None` when the payload is drained. A zero-length trailing entry
/// terminates the sequence.
pub fn next_packed_entry(
    payload: &[u8],
    cursor: usize,
) -> Result<Option<(std::ops::Range<usize>, usize)>, ProtoError> {
    if cursor >= payload.len() {
        return Ok(None);
    }
    if payload.len() - cursor < 2 {
        return Err(ProtoError::Truncated("packed length prefix"));
    }
    let len = u16::from_be_bytes([payload[cursor], payload[cursor + 1]]) as usize;
    if len == 0 {
        return Ok(None);
    }
    let start = cursor + 2;
    let end = start + len;
    if end > payload.len() {
        return Err(ProtoError::Truncated("packed entry"));
    }
    Ok(Some((start..end, end)))
}
