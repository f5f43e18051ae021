//! Per-connection session state and the record-oriented API.

pub(crate) mod read;
pub(crate) mod write;

pub use read::{ReadEvent, ReadStatus};
pub use write::WriteArgs;

use tracing::{debug, warn};

use ripc_proto::constants::{
    CompressionType, LZ4_COMPRESSION_THRESHOLD, ProtocolType, RipcVersion,
    ZLIB_COMPRESSION_THRESHOLD,
};
use ripc_proto::frame::FragmentInfo;
use ripc_proto::ws::frame as ws_frame;
use ripc_proto::ws::{CloseCode, WsOpcode};

use crate::buffer::{PoolBuffer, Storage};
use crate::compress::{Compressor, Decompressor};
use crate::error::{Result, TransportError};
use crate::pool::BufferPool;
use crate::reassembly::ReassemblyTable;
use crate::scheduler::{Priority, QueuedRange, WriteScheduler};
use crate::transport::Transport;
use crate::tunnel::TunnelTransport;
use crate::ws::WsState;

/// Space reserved in front of every frame payload: enough for the
/// largest RIPC header plus a WebSocket wrapper.
pub(crate) const FRAME_HEADROOM: usize = 32;

/// Which end of the connection this session is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Initializing,
    Active,
    Closing,
    Inactive,
}

/// Parameters agreed during the handshake.
#[derive(Debug, Clone)]
pub struct Negotiated {
    pub version: RipcVersion,
    /// Maximum total frame size on the wire, headers included.
    pub max_msg_size: u16,
    pub ping_timeout: u8,
    pub protocol_type: ProtocolType,
    pub compression: CompressionType,
    pub compression_level: u8,
    pub shared_key: Option<u64>,
    pub peer_component: String,
    pub peer_hostname: String,
    pub peer_ip: String,
}

/// Buffer and watermark knobs applied at session construction.
#[derive(Debug, Clone)]
pub struct SessionLimits {
    pub guaranteed_buffers: usize,
    pub max_buffers: usize,
    pub high_water_mark: usize,
    /// Input buffer size in frames.
    pub read_frames: usize,
}

impl Default for SessionLimits {
    fn default() -> SessionLimits {
        SessionLimits {
            guaranteed_buffers: 50,
            max_buffers: 100,
            high_water_mark: 12 * 1024,
            read_frames: 10,
        }
    }
}

/// Counters kept per session.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionStats {
    pub bytes_queued: u64,
    pub bytes_read: u64,
    pub messages_written: u64,
    pub messages_read: u64,
    pub bytes_out_last_msg: usize,
    pub pings_sent: u64,
    pub pings_received: u64,
}

/// The leaf connection under a session: either a plain stream or the
/// two-FD HTTP tunnel.
pub enum SessionTransport {
    Plain(Box<dyn Transport>),
    Tunnel(TunnelTransport),
}

impl SessionTransport {
    pub(crate) fn as_transport(&mut self) -> &mut dyn Transport {
        match self {
            SessionTransport::Plain(t) => t.as_mut(),
            SessionTransport::Tunnel(t) => t,
        }
    }

    pub fn tunnel_mut(&mut self) -> Option<&mut TunnelTransport> {
        match self {
            SessionTransport::Tunnel(t) => Some(t),
            SessionTransport::Plain(_) => None,
        }
    }

    fn shutdown(&mut self) {
        self.as_transport().shutdown();
    }
}

/// Stashed first half of a compressed payload that spilled over two
/// frames.
pub(crate) struct PendingComp {
    pub(crate) fragment: Option<FragmentInfo>,
    pub(crate) packed: bool,
    pub(crate) data: Vec<u8>,
}

/// Cursor over the packed entries of a frame being handed out one
/// message per `read` call.
pub(crate) struct PackedCursor {
    pub(crate) payload: Vec<u8>,
    pub(crate) pos: usize,
}

/// Ioctl-style runtime knobs.
#[derive(Debug, Clone)]
pub enum IoctlCmd {
    MaxNumBuffers(usize),
    NumGuaranteedBuffers(usize),
    HighWaterMark(usize),
    SysReadBuffers(usize),
    SysWriteBuffers(usize),
    CompressionThreshold(usize),
    PriorityFlushOrder(String),
    DebugFlags(u32),
}

pub struct Session {
    pub(crate) role: Role,
    pub(crate) state: SessionState,
    pub(crate) negotiated: Negotiated,
    pub(crate) transport: SessionTransport,
    pub(crate) pool: BufferPool,
    pub(crate) scheduler: WriteScheduler,
    pub(crate) reassembly: ReassemblyTable,
    pub(crate) input: Vec<u8>,
    pub(crate) input_pos: usize,
    pub(crate) read_size: usize,
    pub(crate) pending_packed: Option<PackedCursor>,
    pub(crate) pending_comp: Option<PendingComp>,
    pub(crate) comp_out: Option<Compressor>,
    pub(crate) comp_in: Option<Decompressor>,
    /// The first queue that ever compressed; only it may keep doing so.
    pub(crate) compress_queue: Option<Priority>,
    pub(crate) comp_threshold: usize,
    pub(crate) force_compression: bool,
    pub(crate) next_frag_id: u16,
    pub(crate) high_water_mark: usize,
    pub(crate) max_buffers: usize,
    pub(crate) debug_flags: u32,
    pub(crate) ws: Option<WsState>,
    pub(crate) stats: SessionStats,
}

impl Session {
    pub(crate) fn establish(
        role: Role,
        transport: SessionTransport,
        negotiated: Negotiated,
        limits: &SessionLimits,
        shared_pool: Option<BufferPool>,
        ws: Option<WsState>,
    ) -> Session {
        let slab_size = negotiated.max_msg_size as usize + FRAME_HEADROOM;
        let pool = match shared_pool {
            Some(shared) => {
                BufferPool::with_overflow(slab_size, limits.guaranteed_buffers, shared)
            }
            None => BufferPool::new(slab_size, limits.guaranteed_buffers),
        };
        let comp_threshold = match negotiated.compression {
            CompressionType::Lz4 => LZ4_COMPRESSION_THRESHOLD,
            _ => ZLIB_COMPRESSION_THRESHOLD,
        };
        let read_size = slab_size * limits.read_frames.max(1);
        debug!(
            ?role,
            version = ?negotiated.version,
            max_msg_size = negotiated.max_msg_size,
            compression = ?negotiated.compression,
            "session established"
        );
        Session {
            role,
            state: SessionState::Active,
            comp_out: Compressor::new(
                negotiated.compression,
                negotiated.compression_level,
                true,
            ),
            comp_in: Decompressor::new(negotiated.compression, true),
            negotiated,
            transport,
            pool,
            scheduler: WriteScheduler::new(),
            reassembly: ReassemblyTable::new(),
            input: Vec::new(),
            input_pos: 0,
            read_size,
            pending_packed: None,
            pending_comp: None,
            compress_queue: None,
            comp_threshold,
            force_compression: false,
            next_frag_id: 1,
            high_water_mark: limits.high_water_mark,
            max_buffers: limits.max_buffers,
            debug_flags: 0,
            ws,
            stats: SessionStats::default(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn negotiated(&self) -> &Negotiated {
        &self.negotiated
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    pub fn transport_mut(&mut self) -> &mut SessionTransport {
        &mut self.transport
    }

    /// Largest caller payload that fits one unfragmented frame.
    pub fn max_user_payload(&self) -> usize {
        let max = self.negotiated.max_msg_size as usize;
        if let Some(ws) = &self.ws {
            if ws.protocol.is_json() {
                // JSON messages ride the WebSocket frame directly; leave
                // room for the enclosing array brackets.
                return max - 2;
            }
        }
        max - self.negotiated.version.data_header_len()
    }

    pub(crate) fn ensure_active(&self) -> Result<()> {
        match self.state {
            SessionState::Active => Ok(()),
            SessionState::Initializing => Err(TransportError::ChannelClosed(
                "session still initializing".into(),
            )),
            SessionState::Closing | SessionState::Inactive => {
                Err(TransportError::ChannelClosed("session is closed".into()))
            }
        }
    }

    /// Latches a fatal error: the session becomes inactive and every
    /// later operation fails fast.
    pub(crate) fn fail(&mut self, err: TransportError) -> TransportError {
        if err.is_fatal() && self.state != SessionState::Inactive {
            warn!(code = err.code(), error = %err, "session failed");
            self.state = SessionState::Inactive;
            self.transport.shutdown();
            self.scheduler.clear();
            self.reassembly.clear();
        }
        err
    }

    /// Hands out an output buffer of `size` payload bytes.
    ///
    /// Oversized requests return a heap-backed buffer split into a
    /// fragment chain at write time. Packed buffers must fit one frame;
    /// each packed entry additionally consumes its length prefix (RIPC)
    /// or separator (JSON).
    pub fn get_buffer(&mut self, size: usize, packed: bool) -> Result<PoolBuffer> {
        self.ensure_active()?;
        if size == 0 {
            return Err(TransportError::InvalidArgument(
                "buffer size must be nonzero".into(),
            ));
        }
        let max_payload = self.max_user_payload();
        let json = self.ws.as_ref().is_some_and(|ws| ws.protocol.is_json());

        if packed {
            if size > max_payload {
                return Err(TransportError::InvalidArgument(format!(
                    "packed buffer of {size} bytes exceeds frame payload {max_payload}"
                )));
            }
            let slab = self.alloc_slab()?;
            return Ok(PoolBuffer::pooled_packed(slab, FRAME_HEADROOM, size, json));
        }

        if size <= max_payload {
            let slab = self.alloc_slab()?;
            return Ok(PoolBuffer::pooled(slab, FRAME_HEADROOM, size));
        }

        if json {
            return Err(TransportError::InvalidArgument(format!(
                "JSON message of {size} bytes exceeds frame payload {max_payload}"
            )));
        }
        let id_space = self.negotiated.version.fragment_id_max() as usize;
        if size > max_payload * id_space {
            return Err(TransportError::InvalidArgument(format!(
                "message of {size} bytes exceeds the fragmentable maximum"
            )));
        }
        Ok(PoolBuffer::heap(size))
    }

    /// Takes a slab, flushing once to free space before giving up.
    pub(crate) fn alloc_slab(&mut self) -> Result<crate::pool::Slab> {
        if self.pool.stats().in_use >= self.max_buffers {
            return Err(TransportError::NoBuffers(
                "session reached its output buffer cap".into(),
            ));
        }
        if let Some(slab) = self.pool.alloc_shared(self.pool.slab_size()) {
            return Ok(slab);
        }
        // Draining the queues releases frozen slabs back to the pool.
        let _ = self.flush()?;
        self.pool
            .alloc_shared(self.pool.slab_size())
            .ok_or_else(|| TransportError::NoBuffers("output buffer pools exhausted".into()))
    }

    /// Finalizes the message currently in a packed buffer and advances
    /// the packing cursor. Returns the room left for the next message;
    /// zero means the buffer is full.
    pub fn pack(&mut self, buffer: &mut PoolBuffer) -> Result<usize> {
        self.ensure_active()?;
        if !buffer.is_packed() {
            return Err(TransportError::InvalidArgument(
                "pack on a non-packed buffer".into(),
            ));
        }
        if buffer.is_spent() {
            return Err(TransportError::InvalidArgument(
                "buffer was already written".into(),
            ));
        }
        write::stamp_packed_entry(buffer);
        Ok(buffer.remaining())
    }

    /// Drains the priority queues toward the transport. Returns the
    /// bytes still queued.
    pub fn flush(&mut self) -> Result<usize> {
        if self.state == SessionState::Inactive {
            return Err(TransportError::ChannelClosed("session is closed".into()));
        }
        if let SessionTransport::Tunnel(tunnel) = &self.transport {
            // While an FD swap is pending only one iovec may go out per
            // call so the zero-chunk can be slotted in.
            let clamp = if tunnel.is_switching() { 1 } else { crate::scheduler::MAX_IOV };
            self.scheduler.set_max_iov(clamp);
        }
        let result = self.scheduler.flush(self.transport.as_transport());
        match result {
            Ok(remaining) => Ok(remaining),
            Err(err) => Err(self.fail(err)),
        }
    }

    /// Queues a ping appropriate for the negotiated framing and flushes.
    pub fn ping(&mut self) -> Result<usize> {
        self.ensure_active()?;
        write::queue_ping(self)?;
        self.stats.pings_sent += 1;
        self.flush()
    }

    /// Closes the session. Safe to call repeatedly.
    pub fn close(&mut self) -> Result<()> {
        if self.state == SessionState::Inactive {
            return Ok(());
        }
        if let Some(ws) = &mut self.ws {
            if self.state == SessionState::Active && !ws.close_sent {
                ws.close_sent = true;
                let payload = ws_frame::encode_close_payload(CloseCode::Normal as u16, b"");
                let mut frame = Vec::with_capacity(payload.len() + 8);
                let header = ws_frame::WsFrameHeader {
                    fin: true,
                    rsv1: false,
                    opcode: WsOpcode::Close,
                    payload_len: payload.len() as u64,
                    mask_key: ws.mask_key(self.role),
                };
                ws_frame::encode_frame(&header, &payload, &mut frame);
                let _ = self.transport.as_transport().write(&frame);
            }
        }
        self.state = SessionState::Closing;
        self.transport.shutdown();
        self.scheduler.clear();
        self.reassembly.clear();
        self.pending_packed = None;
        self.pending_comp = None;
        self.state = SessionState::Inactive;
        debug!("session closed");
        Ok(())
    }

    /// Runtime configuration knobs.
    pub fn ioctl(&mut self, cmd: IoctlCmd) -> Result<()> {
        match cmd {
            IoctlCmd::MaxNumBuffers(n) => {
                if n == 0 {
                    return Err(TransportError::InvalidArgument(
                        "max buffers must be nonzero".into(),
                    ));
                }
                self.max_buffers = n;
            }
            IoctlCmd::NumGuaranteedBuffers(n) => {
                if n == 0 {
                    return Err(TransportError::InvalidArgument(
                        "guaranteed buffers must be nonzero".into(),
                    ));
                }
                self.pool.set_max(n);
            }
            IoctlCmd::HighWaterMark(n) => self.high_water_mark = n,
            IoctlCmd::SysReadBuffers(n) => {
                if n == 0 {
                    return Err(TransportError::InvalidArgument(
                        "read buffer count must be nonzero".into(),
                    ));
                }
                self.read_size = self.pool.slab_size() * n;
            }
            IoctlCmd::SysWriteBuffers(n) => {
                if n == 0 {
                    return Err(TransportError::InvalidArgument(
                        "write buffer count must be nonzero".into(),
                    ));
                }
                self.scheduler.set_max_iov(n);
            }
            IoctlCmd::CompressionThreshold(n) => {
                let floor = match self.negotiated.compression {
                    CompressionType::Lz4 => LZ4_COMPRESSION_THRESHOLD,
                    _ => ZLIB_COMPRESSION_THRESHOLD,
                };
                if n < floor {
                    return Err(TransportError::InvalidArgument(format!(
                        "compression threshold {n} below the minimum {floor}"
                    )));
                }
                self.comp_threshold = n;
            }
            IoctlCmd::PriorityFlushOrder(order) => {
                self.scheduler.set_strategy(&order)?;
            }
            IoctlCmd::DebugFlags(flags) => self.debug_flags = flags,
        }
        Ok(())
    }

    /// Allocates the next fragment id; the id space wraps and 0 is
    /// reserved.
    pub(crate) fn alloc_frag_id(&mut self) -> u16 {
        let id = self.next_frag_id;
        let max = self.negotiated.version.fragment_id_max();
        self.next_frag_id = if id >= max { 1 } else { id + 1 };
        id
    }

    /// Moves a filled slab region onto a priority queue.
    pub(crate) fn enqueue_range(&mut self, priority: Priority, range: QueuedRange) {
        self.stats.bytes_queued += range.len as u64;
        self.scheduler.enqueue(priority, range);
    }

    pub(crate) fn take_storage(buffer: &mut PoolBuffer) -> Storage {
        std::mem::replace(&mut buffer.storage, Storage::Spent)
    }

    /// Bytes buffered on the input side that have not been parsed yet.
    pub(crate) fn input_remaining(&self) -> usize {
        self.input.len() - self.input_pos
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
