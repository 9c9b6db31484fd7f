//! Decoded frame with typed accessors.
//!
//! A [`Frame`] is the output of the framer: header metadata plus the
//! decoded (post-decompression) payload in a pooled buffer. Dropping the
//! frame returns the payload storage to the pool.

use crate::pool::PooledBuf;
use crate::protocol::wire_format::is_reserved_command;

/// Position of one chunk within a fragmented payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkInfo {
    /// Reassembly key shared by all chunks of one payload (nonzero).
    pub packet_id: u32,
    /// Byte offset of this chunk within the reassembled payload.
    pub chunk_offset: u32,
    /// Length of the complete payload.
    pub total_length: u32,
}

/// A complete decoded frame.
#[derive(Debug)]
pub struct Frame {
    /// Command id selecting the handler category.
    pub command_id: u16,
    /// Correlation id; 0 means "not a response to a prior request".
    pub response_id: u32,
    /// Chunk position when this frame is part of a fragmented payload.
    pub chunk: Option<ChunkInfo>,
    /// Decoded payload bytes.
    pub payload: PooledBuf,
}

impl Frame {
    /// Borrow the payload bytes.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Decoded payload length.
    #[inline]
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    /// Whether this frame answers a prior request.
    #[inline]
    pub fn is_response(&self) -> bool {
        self.response_id != 0
    }

    /// Whether this frame is one chunk of a fragmented payload.
    #[inline]
    pub fn is_chunked(&self) -> bool {
        self.chunk.is_some()
    }

    /// Whether the command id is reserved for the engine.
    #[inline]
    pub fn is_reserved(&self) -> bool {
        is_reserved_command(self.command_id)
    }
}
