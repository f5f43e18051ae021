//! In-memory transports for exercising sessions without sockets.

use std::collections::VecDeque;
use std::io::{self, IoSlice};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::transport::Transport;

struct PipeSide {
    buf: VecDeque<u8>,
    closed: bool,
    /// Bytes the buffer may hold before writes start blocking. `None`
    /// means unbounded.
    capacity: Option<usize>,
}

impl PipeSide {
    fn new() -> PipeSide {
        PipeSide {
            buf: VecDeque::new(),
            closed: false,
            capacity: None,
        }
    }

    fn room(&self) -> usize {
        match self.capacity {
            Some(cap) => cap.saturating_sub(self.buf.len()),
            None => usize::MAX,
        }
    }
}

/// One end of a bidirectional in-memory pipe.
///
/// Reads return `WouldBlock` when the peer has written nothing, and zero
/// when the peer has shut down and the buffer is drained. A write
/// capacity can be set to force partial writes. Clones share the same
/// channel, which lets a test keep a handle for inspection after the
/// end moved into a session.
#[derive(Clone)]
pub struct PipeEnd {
    incoming: Arc<Mutex<PipeSide>>,
    outgoing: Arc<Mutex<PipeSide>>,
}

/// Creates a connected pipe pair.
pub fn pipe() -> (PipeEnd, PipeEnd) {
    let a = Arc::new(Mutex::new(PipeSide::new()));
    let b = Arc::new(Mutex::new(PipeSide::new()));
    (
        PipeEnd {
            incoming: Arc::clone(&a),
            outgoing: Arc::clone(&b),
        },
        PipeEnd {
            incoming: b,
            outgoing: a,
        },
    )
}

impl PipeEnd {
    /// Limits how many bytes the outgoing buffer holds before writes
    /// return short counts or `WouldBlock`.
    pub fn set_write_capacity(&self, capacity: Option<usize>) {
        self.outgoing.lock().capacity = capacity;
    }

    /// Drains and returns everything currently written by this end.
    pub fn drain_written(&self) -> Vec<u8> {
        let mut side = self.outgoing.lock();
        side.buf.drain(..).collect()
    }

    /// Bytes waiting for the peer to read.
    pub fn pending_bytes(&self) -> usize {
        self.outgoing.lock().buf.len()
    }

    /// Copies everything currently written by this end without
    /// consuming it.
    pub fn peek_written(&self) -> Vec<u8> {
        self.outgoing.lock().buf.iter().copied().collect()
    }
}

impl Transport for PipeEnd {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut side = self.incoming.lock();
        if side.buf.is_empty() {
            if side.closed {
                return Ok(0);
            }
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let n = buf.len().min(side.buf.len());
        for slot in buf.iter_mut().take(n) {
            *slot = side.buf.pop_front().expect("length checked");
        }
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut side = self.outgoing.lock();
        if side.closed {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        let n = buf.len().min(side.room());
        if n == 0 && !buf.is_empty() {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        side.buf.extend(&buf[..n]);
        Ok(n)
    }

    fn writev(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        let mut side = self.outgoing.lock();
        if side.closed {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        let mut room = side.room();
        let mut written = 0;
        for buf in bufs {
            if room == 0 {
                break;
            }
            let n = buf.len().min(room);
            side.buf.extend(&buf[..n]);
            written += n;
            room -= n;
            if n < buf.len() {
                break;
            }
        }
        if written == 0 && bufs.iter().any(|b| !b.is_empty()) {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        Ok(written)
    }

    fn supports_writev(&self) -> bool {
        true
    }

    fn shutdown(&mut self) {
        self.outgoing.lock().closed = true;
        self.incoming.lock().closed = true;
    }
}
