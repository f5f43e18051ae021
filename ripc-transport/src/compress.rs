//! Compression codec registry.
//!
//! Contexts are selected once at session construction from the
//! negotiated algorithm id and owned exclusively by the session. zlib
//! keeps a stream context per direction and flushes every message with a
//! sync flush so frame boundaries stay aligned; LZ4 is contextless block
//! compression. LZ4 output can exceed the input, so callers size frames
//! with [`lz4_worst_case`] and fall back to the two-frame spillover when
//! a compressed payload outgrows a single frame.

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

pub use ripc_proto::constants::CompressionType;

use crate::error::{Result, TransportError};

/// Bytes consumed and produced by one codec call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressOutcome {
    pub bytes_in_used: usize,
    pub bytes_out_used: usize,
}

/// Worst-case compressed size for an LZ4 block of `input_len` bytes.
pub fn lz4_worst_case(input_len: usize) -> usize {
    lz4_flex::block::get_maximum_output_size(input_len)
}

/// Headroom to leave when sizing zlib input slices so a sync-flushed
/// block cannot outgrow the frame on incompressible data.
pub const ZLIB_GROWTH_MARGIN: usize = 16;

pub enum Compressor {
    Zlib(Box<Compress>),
    Lz4,
}

impl Compressor {
    /// Builds a context for `kind`, or `None` for uncompressed sessions.
    /// `zlib_header` selects zlib wrapping (RIPC) or raw deflate
    /// (permessage-deflate).
    pub fn new(kind: CompressionType, level: u8, zlib_header: bool) -> Option<Compressor> {
        match kind {
            CompressionType::None => None,
            CompressionType::Zlib => Some(Compressor::Zlib(Box::new(Compress::new(
                Compression::new(u32::from(level.min(9))),
                zlib_header,
            )))),
            CompressionType::Lz4 => Some(Compressor::Lz4),
        }
    }

    pub fn kind(&self) -> CompressionType {
        match self {
            Compressor::Zlib(_) => CompressionType::Zlib,
            Compressor::Lz4 => CompressionType::Lz4,
        }
    }

    /// Drops any accumulated stream state (permessage-deflate
    /// no-context-takeover).
    pub fn reset(&mut self) {
        if let Compressor::Zlib(ctx) = self {
            ctx.reset();
        }
    }

    /// Compresses `input`, appending to `out`.
    pub fn compress(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<CompressOutcome> {
        match self {
            Compressor::Zlib(ctx) => {
                let before_in = ctx.total_in();
                let before_out = ctx.total_out();
                out.reserve(input.len() + input.len() / 1000 + 64);
                loop {
                    let consumed = (ctx.total_in() - before_in) as usize;
                    let status = ctx
                        .compress_vec(&input[consumed..], out, FlushCompress::Sync)
                        .map_err(|e| TransportError::CompressionError(e.to_string()))?;
                    let consumed = (ctx.total_in() - before_in) as usize;
                    if consumed == input.len() && status == Status::Ok {
                        break;
                    }
                    match status {
                        Status::Ok | Status::BufError => out.reserve(out.len().max(256)),
                        Status::StreamEnd => break,
                    }
                }
                Ok(CompressOutcome {
                    bytes_in_used: (ctx.total_in() - before_in) as usize,
                    bytes_out_used: (ctx.total_out() - before_out) as usize,
                })
            }
            Compressor::Lz4 => {
                let start = out.len();
                out.resize(start + lz4_worst_case(input.len()), 0);
                let written = lz4_flex::block::compress_into(input, &mut out[start..])
                    .map_err(|e| TransportError::CompressionError(e.to_string()))?;
                out.truncate(start + written);
                Ok(CompressOutcome {
                    bytes_in_used: input.len(),
                    bytes_out_used: written,
                })
            }
        }
    }
}

pub enum Decompressor {
    Zlib {
        ctx: Box<Decompress>,
        zlib_header: bool,
    },
    Lz4,
}

impl Decompressor {
    pub fn new(kind: CompressionType, zlib_header: bool) -> Option<Decompressor> {
        match kind {
            CompressionType::None => None,
            CompressionType::Zlib => Some(Decompressor::Zlib {
                ctx: Box::new(Decompress::new(zlib_header)),
                zlib_header,
            }),
            CompressionType::Lz4 => Some(Decompressor::Lz4),
        }
    }

    pub fn kind(&self) -> CompressionType {
        match self {
            Decompressor::Zlib { .. } => CompressionType::Zlib,
            Decompressor::Lz4 => CompressionType::Lz4,
        }
    }

    /// Drops any accumulated stream state (permessage-deflate
    /// no-context-takeover).
    pub fn reset(&mut self) {
        if let Decompressor::Zlib { ctx, zlib_header } = self {
            ctx.reset(*zlib_header);
        }
    }

    /// Decompresses `input`, appending to `out`. `max_out` bounds the
    /// produced size; exceeding it is a [`TransportError::CompressionError`].
    pub fn decompress(
        &mut self,
        input: &[u8],
        out: &mut Vec<u8>,
        max_out: usize,
    ) -> Result<CompressOutcome> {
        match self {
            Decompressor::Zlib { ctx, .. } => {
                let before_in = ctx.total_in();
                let before_out = ctx.total_out();
                loop {
                    let consumed = (ctx.total_in() - before_in) as usize;
                    let produced = (ctx.total_out() - before_out) as usize;
                    if produced > max_out {
                        return Err(TransportError::CompressionError(format!(
                            "decompressed payload exceeds {max_out} bytes"
                        )));
                    }
                    if consumed == input.len() {
                        break;
                    }
                    out.reserve((max_out - produced).clamp(256, 16 * 1024));
                    let status = ctx
                        .decompress_vec(&input[consumed..], out, FlushDecompress::Sync)
                        .map_err(|e| TransportError::CompressionError(e.to_string()))?;
                    if status == Status::StreamEnd {
                        break;
                    }
                }
                let produced = (ctx.total_out() - before_out) as usize;
                if produced > max_out {
                    return Err(TransportError::CompressionError(format!(
                        "decompressed payload exceeds {max_out} bytes"
                    )));
                }
                Ok(CompressOutcome {
                    bytes_in_used: (ctx.total_in() - before_in) as usize,
                    bytes_out_used: produced,
                })
            }
            Decompressor::Lz4 => {
                let start = out.len();
                out.resize(start + max_out, 0);
                let written = lz4_flex::block::decompress_into(input, &mut out[start..])
                    .map_err(|e| TransportError::CompressionError(e.to_string()))?;
                out.truncate(start + written);
                Ok(CompressOutcome {
                    bytes_in_used: input.len(),
                    bytes_out_used: written,
                })
            }
        }
    }
}
