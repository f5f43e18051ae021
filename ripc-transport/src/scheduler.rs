//! Priority output queues and the flush strategy.
//!
//! Framed bytes are queued on one of three priority queues and drained
//! by a repeating flush-strategy permutation (default `H,M,H,L,H,M`)
//! with a safety sweep of the Low queue so nothing starves. Batches are
//! gathered into up to 16 iovecs; adjacent ranges on the same slab are
//! coalesced at enqueue to keep iovec pressure down. Partial writes
//! remember the queue and intra-buffer position to resume from.

use std::io::IoSlice;
use std::sync::Arc;

use smallvec::SmallVec;
use tracing::trace;

use crate::error::{Result, TransportError};
use crate::pool::Slab;
use crate::transport::Transport;

pub use ripc_proto::constants::MAX_IOV;

/// Write priorities, highest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Priority {
    High = 0,
    Medium = 1,
    Low = 2,
}

impl Priority {
    pub fn from_u8(raw: u8) -> Option<Priority> {
        match raw {
            0 => Some(Priority::High),
            1 => Some(Priority::Medium),
            2 => Some(Priority::Low),
            _ => None,
        }
    }
}

const NUM_QUEUES: usize = 3;
const DEFAULT_STRATEGY: [usize; 6] = [0, 1, 0, 2, 0, 1];

/// A byte range of a frozen slab waiting to be written.
pub struct QueuedRange {
    pub slab: Arc<Slab>,
    pub start: usize,
    pub len: usize,
    /// Bytes of this range already written by a previous partial flush.
    pub local: usize,
}

impl QueuedRange {
    pub fn new(slab: Arc<Slab>, start: usize, len: usize) -> QueuedRange {
        QueuedRange {
            slab,
            start,
            len,
            local: 0,
        }
    }

    fn remaining(&self) -> usize {
        self.len - self.local
    }

    fn as_io_slice(&self) -> IoSlice<'_> {
        IoSlice::new(&self.slab.bytes()[self.start + self.local..self.start + self.len])
    }
}

pub struct WriteScheduler {
    queues: [std::collections::VecDeque<QueuedRange>; NUM_QUEUES],
    strategy: Vec<usize>,
    cursor: usize,
    /// Queue holding a partially written buffer; the next flush starts
    /// there.
    resume_queue: Option<usize>,
    queued_bytes: usize,
    max_iov: usize,
}

impl Default for WriteScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl WriteScheduler {
    pub fn new() -> WriteScheduler {
        WriteScheduler {
            queues: Default::default(),
            strategy: DEFAULT_STRATEGY.to_vec(),
            cursor: 0,
            resume_queue: None,
            queued_bytes: 0,
            max_iov: MAX_IOV,
        }
    }

    /// Replaces the flush strategy. The permutation is a string over
    /// `{H,M,L}` and must contain at least one `H` and one `M`.
    pub fn set_strategy(&mut self, order: &str) -> Result<()> {
        let mut strategy = Vec::with_capacity(order.len());
        for ch in order.chars() {
            match ch.to_ascii_uppercase() {
                'H' => strategy.push(0),
                'M' => strategy.push(1),
                'L' => strategy.push(2),
                other => {
                    return Err(TransportError::InvalidArgument(format!(
                        "flush order may only contain H, M and L, got '{other}'"
                    )));
                }
            }
        }
        if !strategy.contains(&0) || !strategy.contains(&1) {
            return Err(TransportError::InvalidArgument(
                "flush order needs at least one H and one M".into(),
            ));
        }
        self.strategy = strategy;
        self.cursor = 0;
        Ok(())
    }

    /// Clamps the iovec batch size; the tunnel sets this to 1 while an
    /// FD swap is pending so the terminating zero-chunk can be slotted
    /// in between frames.
    pub fn set_max_iov(&mut self, max_iov: usize) {
        self.max_iov = max_iov.clamp(1, MAX_IOV);
    }

    pub fn queued_bytes(&self) -> usize {
        self.queued_bytes
    }

    pub fn is_empty(&self) -> bool {
        self.queued_bytes == 0
    }

    /// Queues a range, merging with the queue tail when the two ranges
    /// are adjacent on the same slab.
    pub fn enqueue(&mut self, priority: Priority, range: QueuedRange) {
        self.queued_bytes += range.remaining();
        let queue = &mut self.queues[priority as usize];
        if let Some(back) = queue.back_mut() {
            if Arc::ptr_eq(&back.slab, &range.slab)
                && back.start + back.len == range.start
                && range.local == 0
            {
                back.len += range.len;
                return;
            }
        }
        queue.push_back(range);
    }

    /// Drains queues toward the transport following the flush strategy.
    /// Returns the bytes still queued afterwards; `WouldBlock` from the
    /// transport is not an error.
    pub fn flush(&mut self, transport: &mut dyn Transport) -> Result<usize> {
        loop {
            if self.queued_bytes == 0 {
                return Ok(0);
            }

            let order = self.sweep_order();
            let mut iov: SmallVec<[IoSlice<'_>; MAX_IOV]> = SmallVec::new();
            let mut picks: SmallVec<[(usize, usize); NUM_QUEUES]> = SmallVec::new();
            for &qi in &order {
                let mut taken = 0;
                for entry in &self.queues[qi] {
                    if iov.len() == self.max_iov {
                        break;
                    }
                    iov.push(entry.as_io_slice());
                    taken += 1;
                }
                if taken > 0 {
                    picks.push((qi, taken));
                }
                if iov.len() == self.max_iov {
                    break;
                }
            }
            if iov.is_empty() {
                return Ok(self.queued_bytes);
            }
            let batch_total: usize = iov.iter().map(|s| s.len()).sum();

            let written = match transport.writev(&iov) {
                Ok(n) => n,
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    return Ok(self.queued_bytes);
                }
                Err(err) => {
                    return Err(TransportError::WriteFlushFailed(err.to_string()));
                }
            };
            drop(iov);
            trace!(written, batch_total, "flush batch");
            self.consume(written, &picks);
            if written < batch_total {
                return Ok(self.queued_bytes);
            }
        }
    }

    /// Releases everything still queued (session teardown).
    pub fn clear(&mut self) {
        for queue in &mut self.queues {
            queue.clear();
        }
        self.queued_bytes = 0;
        self.resume_queue = None;
        self.cursor = 0;
    }

    /// Queue visit order for one sweep: the partially written queue
    /// first, then the strategy positions, then the Low safety check.
    fn sweep_order(&mut self) -> SmallVec<[usize; NUM_QUEUES]> {
        let mut order: SmallVec<[usize; NUM_QUEUES]> = SmallVec::new();
        if let Some(qi) = self.resume_queue.take() {
            order.push(qi);
        }
        let mut visited = 0;
        while visited < self.strategy.len() && order.len() < NUM_QUEUES {
            let qi = self.strategy[self.cursor];
            self.cursor = (self.cursor + 1) % self.strategy.len();
            visited += 1;
            if !order.contains(&qi) {
                order.push(qi);
            }
        }
        if !order.contains(&2) {
            order.push(2);
        }
        order
    }

    fn consume(&mut self, mut written: usize, picks: &[(usize, usize)]) {
        'outer: for &(qi, count) in picks {
            for _ in 0..count {
                if written == 0 {
                    break 'outer;
                }
                let remaining = self.queues[qi]
                    .front()
                    .map(QueuedRange::remaining)
                    .unwrap_or(0);
                if written >= remaining {
                    self.queues[qi].pop_front();
                    self.queued_bytes -= remaining;
                    written -= remaining;
                } else {
                    let entry = self.queues[qi].front_mut().expect("checked above");
                    entry.local += written;
                    self.queued_bytes -= written;
                    self.resume_queue = Some(qi);
                    break 'outer;
                }
            }
        }
    }

    /// Test/diagnostic visibility into a queue.
    pub fn queue_depth(&self, priority: Priority) -> usize {
        self.queues[priority as usize].len()
    }

    /// Remaining bytes of the front entry of a queue.
    pub fn front_remaining(&self, priority: Priority) -> Option<usize> {
        self.queues[priority as usize]
            .front()
            .map(QueuedRange::remaining)
    }
}
