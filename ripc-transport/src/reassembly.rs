//! Fragment reassembly.
//!
//! Incoming fragments are keyed by fragment id. A first-fragment frame
//! opens a slot sized to the advertised total; continuations append in
//! order. The id space wraps, so a first fragment colliding with a live
//! slot evicts the stale partial rather than corrupting it.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::error::{Result, TransportError};

struct Slot {
    total: usize,
    buf: Vec<u8>,
}

#[derive(Default)]
pub struct ReassemblyTable {
    slots: HashMap<u16, Slot>,
}

impl ReassemblyTable {
    pub fn new() -> ReassemblyTable {
        ReassemblyTable::default()
    }

    /// Opens a slot for fragment id `id` and stores the first payload.
    /// Returns the completed message when the first fragment already
    /// carries the whole advertised total.
    pub fn begin(&mut self, id: u16, total: u32, payload: &[u8]) -> Result<Option<Vec<u8>>> {
        let total = total as usize;
        if payload.len() > total {
            return Err(TransportError::ProtocolError(format!(
                "first fragment of {} bytes exceeds advertised total {total}",
                payload.len()
            )));
        }
        if let Some(stale) = self.slots.remove(&id) {
            warn!(
                id,
                received = stale.buf.len(),
                total = stale.total,
                "fragment id collision, evicting stale partial"
            );
        }
        let mut buf = Vec::with_capacity(total);
        buf.extend_from_slice(payload);
        if buf.len() == total {
            debug!(id, total, "single-frame fragmented message");
            return Ok(Some(buf));
        }
        self.slots.insert(id, Slot { total, buf });
        Ok(None)
    }

    /// Appends a continuation payload. Completion removes the slot and
    /// surfaces the assembled message; a continuation without a prior
    /// first fragment is a protocol error.
    pub fn append(&mut self, id: u16, payload: &[u8]) -> Result<Option<Vec<u8>>> {
        let slot = self.slots.get_mut(&id).ok_or_else(|| {
            TransportError::ProtocolError(format!(
                "continuation for unknown fragment id {id}"
            ))
        })?;
        if slot.buf.len() + payload.len() > slot.total {
            let err = TransportError::ProtocolError(format!(
                "fragment id {id} overruns advertised total {}",
                slot.total
            ));
            self.slots.remove(&id);
            return Err(err);
        }
        slot.buf.extend_from_slice(payload);
        if slot.buf.len() == slot.total {
            let slot = self.slots.remove(&id).expect("slot exists");
            return Ok(Some(slot.buf));
        }
        Ok(None)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Bytes buffered in an in-progress slot, for tests and diagnostics.
    pub fn buffered(&self, id: u16) -> Option<usize> {
        self.slots.get(&id).map(|slot| slot.buf.len())
    }

    pub fn clear(&mut self) {
        self.slots.clear();
    }
}
