//! Caller-visible output buffers.
//!
//! A [`PoolBuffer`] is handed out by `Session::get_buffer`, filled by the
//! caller, and consumed by `Session::write`. Small buffers borrow a pool
//! slab with headroom reserved for the frame header so framing is a
//! checked prepend, never a copy. Oversized buffers are heap backed and
//! split into a fragment chain at write time; the split position and
//! fragment id survive a `WriteCallAgain` so the caller can retry with
//! the same handle.

use crate::error::{Result, TransportError};
use crate::pool::Slab;

pub(crate) enum Storage {
    Pooled(Slab),
    Heap(Vec<u8>),
    /// Contents have been taken by a successful write.
    Spent,
}

pub struct PoolBuffer {
    pub(crate) storage: Storage,
    /// Bytes reserved in front of the payload for the frame header.
    pub(crate) headroom: usize,
    /// Caller payload length.
    len: usize,
    /// Caller payload capacity.
    capacity: usize,
    pub(crate) packed: bool,
    /// JSON array packing (WebSocket JSON subprotocols) instead of
    /// 2-byte length prefixes.
    pub(crate) json_packed: bool,
    /// Bytes of finalized packed entries, including prefixes/separators.
    pub(crate) packing_offset: usize,
    /// Fragment-chain resume state.
    pub(crate) write_cursor: usize,
    pub(crate) frag_id: u16,
}

impl PoolBuffer {
    pub(crate) fn pooled(slab: Slab, headroom: usize, capacity: usize) -> PoolBuffer {
        PoolBuffer {
            storage: Storage::Pooled(slab),
            headroom,
            len: capacity,
            capacity,
            packed: false,
            json_packed: false,
            packing_offset: 0,
            write_cursor: 0,
            frag_id: 0,
        }
    }

    pub(crate) fn pooled_packed(
        slab: Slab,
        headroom: usize,
        capacity: usize,
        json: bool,
    ) -> PoolBuffer {
        PoolBuffer {
            storage: Storage::Pooled(slab),
            headroom,
            len: 0,
            capacity,
            packed: true,
            json_packed: json,
            packing_offset: 0,
            write_cursor: 0,
            frag_id: 0,
        }
    }

    pub(crate) fn heap(size: usize) -> PoolBuffer {
        PoolBuffer {
            storage: Storage::Heap(vec![0; size]),
            headroom: 0,
            len: size,
            capacity: size,
            packed: false,
            json_packed: false,
            packing_offset: 0,
            write_cursor: 0,
            frag_id: 0,
        }
    }

    /// Caller payload length.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Caller payload capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_packed(&self) -> bool {
        self.packed
    }

    /// Shrinks the payload to `len` bytes. Growing past the capacity is
    /// rejected.
    pub fn set_len(&mut self, len: usize) -> Result<()> {
        if len > self.capacity {
            return Err(TransportError::InvalidArgument(format!(
                "length {len} exceeds buffer capacity {}",
                self.capacity
            )));
        }
        self.len = len;
        Ok(())
    }

    /// The writable payload region.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        let start = self.payload_start();
        let len = self.len;
        match &mut self.storage {
            Storage::Pooled(slab) => &mut slab.bytes_mut()[start..start + len],
            Storage::Heap(bytes) => &mut bytes[start..start + len],
            Storage::Spent => &mut [],
        }
    }

    /// The filled payload region.
    pub fn as_slice(&self) -> &[u8] {
        let start = self.payload_start();
        match &self.storage {
            Storage::Pooled(slab) => &slab.bytes()[start..start + self.len],
            Storage::Heap(bytes) => &bytes[start..start + self.len],
            Storage::Spent => &[],
        }
    }

    /// Copies `data` into the buffer and sets the payload length.
    pub fn put(&mut self, data: &[u8]) -> Result<()> {
        let room = if self.packed {
            self.remaining()
        } else {
            self.capacity
        };
        if data.len() > room {
            return Err(TransportError::InvalidArgument(format!(
                "payload of {} bytes exceeds writable room {room}",
                data.len()
            )));
        }
        self.len = data.len();
        self.as_mut_slice().copy_from_slice(data);
        Ok(())
    }

    /// Writable bytes left for the current packed entry.
    pub fn remaining(&self) -> usize {
        let prefix = self.entry_overhead();
        self.capacity
            .saturating_sub(self.packing_offset + prefix + self.len)
    }

    /// Per-entry framing overhead while packing.
    pub(crate) fn entry_overhead(&self) -> usize {
        if !self.packed {
            0
        } else if self.json_packed {
            1
        } else {
            2
        }
    }

    /// Offset of the current payload region inside the storage.
    pub(crate) fn payload_start(&self) -> usize {
        if self.packed {
            self.headroom + self.packing_offset + self.entry_overhead()
        } else {
            self.headroom
        }
    }

    pub(crate) fn is_spent(&self) -> bool {
        matches!(self.storage, Storage::Spent)
    }

    pub(crate) fn take_len(&mut self) -> usize {
        let len = self.len;
        self.len = 0;
        len
    }
}
