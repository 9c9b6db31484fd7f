//! Per-peer frame extraction with resynchronization.
//!
//! One [`Framer`] per TCP peer. Incoming bytes land in the peer's ring
//! buffer; the framer repeatedly peeks the 7-byte fixed header, waits for
//! the complete frame (optional fields + payload + sentinel), verifies
//! the sentinel, and hands the pieces to the [`FrameDecoder`].
//!
//! # Resynchronization
//!
//! A malformed header byte, an impossible length, a wrong sentinel, or a
//! checksum failure discards bytes up to one past the next `0x00`, which
//! is the next candidate header start. A single corrupted frame costs at
//! most one extra frame boundary.
//!
//! The UDP path has no ring and no sentinel: each datagram is a complete
//! frame candidate, decoded directly by
//! [`FrameDecoder::decode_datagram`]; malformed datagrams are dropped
//! silently by the caller.

use tracing::{trace, warn};

use crate::pool::BytePool;
use crate::protocol::codec::FrameDecoder;
use crate::protocol::frame::Frame;
use crate::protocol::wire_format::{
    HeaderByte, CHUNK_FIELDS_SIZE, HEADER_SIZE, RESPONSE_FIELD_SIZE, SENTINEL,
};
use crate::ring::RingBuffer;

/// Outcome of one extraction attempt.
enum Step {
    /// Not enough buffered bytes for a complete frame.
    NeedMore,
    /// Bytes were discarded (resync or decode failure); try again.
    Skipped,
    /// A complete frame was extracted.
    Extracted(Frame),
}

/// Stream framer for one TCP peer.
pub struct Framer {
    ring: RingBuffer,
    pool: BytePool,
    decoder: FrameDecoder,
    max_payload_size: usize,
}

impl Framer {
    /// Create a framer with a ring of at least `ring_capacity` bytes.
    ///
    /// The ring should hold at least two maximum-size frames so a slow
    /// reader never stalls mid-frame.
    pub fn new(pool: BytePool, ring_capacity: usize, max_payload_size: usize) -> Self {
        Self {
            ring: RingBuffer::new(ring_capacity),
            decoder: FrameDecoder::new(pool.clone(), max_payload_size),
            pool,
            max_payload_size,
        }
    }

    /// Number of bytes buffered but not yet framed.
    pub fn buffered(&self) -> usize {
        self.ring.len()
    }

    /// Feed received bytes and extract every complete frame.
    ///
    /// Partial frames stay buffered for the next push. Malformed regions
    /// are discarded internally; this never fails.
    pub fn push(&mut self, data: &[u8]) -> Vec<Frame> {
        let mut frames = Vec::new();
        let mut rest = data;

        loop {
            let written = self.ring.write(rest);
            rest = &rest[written..];

            loop {
                match self.try_extract() {
                    Step::Extracted(frame) => frames.push(frame),
                    Step::Skipped => continue,
                    Step::NeedMore => break,
                }
            }

            if rest.is_empty() {
                return frames;
            }
            if written == 0 {
                // Ring full with no extractable frame: whatever is
                // buffered can never complete. Drop it and resync on the
                // bytes still in hand.
                warn!(
                    buffered = self.ring.len(),
                    "ring saturated with unframeable bytes, discarding"
                );
                self.ring.clear();
            }
        }
    }

    fn try_extract(&mut self) -> Step {
        let hv = match self.ring.peek_header(0) {
            Some(hv) => hv,
            None => return Step::NeedMore,
        };

        let header_byte = match HeaderByte::decode(hv.header_byte) {
            Ok(hb) => hb,
            Err(err) => {
                trace!(%err, "malformed header byte, resynchronizing");
                self.ring.skip_until(0, SENTINEL);
                return Step::Skipped;
            }
        };

        let payload_len = hv.payload_length as usize;
        if payload_len > self.max_payload_size {
            trace!(payload_len, "header claims oversize payload, resynchronizing");
            self.ring.skip_until(0, SENTINEL);
            return Step::Skipped;
        }

        let opt_len = header_byte.optional_len();
        let frame_len = HEADER_SIZE + opt_len + payload_len;
        if frame_len + 1 > self.ring.capacity() {
            // Can never fit; do not wait for it.
            self.ring.skip_until(0, SENTINEL);
            return Step::Skipped;
        }
        if self.ring.len() < frame_len + 1 {
            return Step::NeedMore;
        }

        // The byte following the payload must be the sentinel.
        if self.ring.peek_byte(frame_len) != Some(SENTINEL) {
            trace!(command_id = hv.command_id, "missing sentinel, resynchronizing");
            self.ring.skip_until(HEADER_SIZE, SENTINEL);
            return Step::Skipped;
        }

        let mut opt_buf = [0u8; CHUNK_FIELDS_SIZE + RESPONSE_FIELD_SIZE];
        let opt = &mut opt_buf[..opt_len];
        if opt_len > 0 && !self.ring.peek(opt, HEADER_SIZE) {
            return Step::NeedMore;
        }

        // Consume header + optional fields + body, then the sentinel.
        let mut body = self.pool.rent(payload_len);
        self.ring.read(body.as_mut_slice(), HEADER_SIZE + opt_len);
        self.ring.skip(1);

        match self
            .decoder
            .finish(header_byte, hv.command_id, payload_len, hv.checksum, opt, body)
        {
            Ok(frame) => Step::Extracted(frame),
            Err(err) => {
                // Frame region already consumed up to its sentinel; the
                // next candidate header follows it.
                trace!(%err, command_id = hv.command_id, "frame discarded");
                Step::Skipped
            }
        }
    }
}

impl std::fmt::Debug for Framer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Framer")
            .field("buffered", &self.ring.len())
            .field("ring_capacity", &self.ring.capacity())
            .finish()
    }
}
