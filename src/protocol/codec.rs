//! Payload codec - frame encoding and decoding.
//!
//! [`FrameEncoder`] produces complete on-wire frames: fixed header,
//! optional chunk/response fields, payload body (optionally LZ4
//! compressed), and the TCP sentinel. [`FrameDecoder`] is the inverse
//! half shared by the TCP framer and the UDP datagram path: checksum
//! verification, header-byte validation, and decompression.
//!
//! [`MsgPackCodec`] serializes user payload types with MessagePack.
//!
//! # Compression
//!
//! LZ4 is applied per frame and only when the compressed form (including
//! its 4-byte length prefix) is strictly smaller than the raw body;
//! otherwise the frame is sent uncompressed and the header byte says so.
//! The decoder reports the decompressed length as the payload length.

use std::borrow::Cow;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{FramingError, Result, SendError};
use crate::pool::{BytePool, PooledBuf};
use crate::protocol::frame::{ChunkInfo, Frame};
use crate::protocol::wire_format::{
    Checksum, CompressionMode, HeaderByte, HEADER_SIZE, SENTINEL,
};

/// MessagePack codec for structured user payloads.
///
/// Uses `rmp_serde::to_vec_named` so structs travel as maps with field
/// names, keeping layouts stable across independently built peers.
pub struct MsgPackCodec;

impl MsgPackCodec {
    /// Encode a value to MsgPack bytes.
    #[inline]
    pub fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(value)?)
    }

    /// Decode MsgPack bytes to a value.
    #[inline]
    pub fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

/// Encoder for complete on-wire frames.
#[derive(Debug, Clone)]
pub struct FrameEncoder {
    compression: CompressionMode,
    max_payload_size: usize,
    sentinel: bool,
}

impl FrameEncoder {
    /// Encoder for TCP frames (sentinel-terminated).
    pub fn tcp(max_payload_size: usize) -> Self {
        Self {
            compression: CompressionMode::None,
            max_payload_size,
            sentinel: true,
        }
    }

    /// Encoder for UDP frames (no sentinel).
    pub fn udp(max_payload_size: usize) -> Self {
        Self {
            compression: CompressionMode::None,
            max_payload_size,
            sentinel: false,
        }
    }

    /// Enable or disable payload compression.
    pub fn with_compression(mut self, mode: CompressionMode) -> Self {
        self.compression = mode;
        self
    }

    /// The largest payload a single unchunked frame may carry.
    #[inline]
    pub fn max_payload_size(&self) -> usize {
        self.max_payload_size
    }

    /// Encode a single unchunked frame.
    ///
    /// `response_id` of 0 means the frame carries no correlation id.
    /// Fails with [`SendError::PacketTooLarge`] when the payload exceeds
    /// the configured maximum; callers that want fragmentation use
    /// [`encode_chunks`](Self::encode_chunks).
    pub fn encode(
        &self,
        command_id: u16,
        response_id: u32,
        payload: &[u8],
    ) -> std::result::Result<Bytes, SendError> {
        if payload.len() > self.max_payload_size {
            return Err(SendError::PacketTooLarge);
        }
        Ok(self.encode_one(command_id, response_id, None, payload))
    }

    /// Encode an oversized payload as successive chunked frames sharing
    /// `packet_id`.
    ///
    /// Every chunk carries `max_payload_size` bytes except the last,
    /// which carries the remainder. `packet_id` must be nonzero.
    pub fn encode_chunks(
        &self,
        command_id: u16,
        response_id: u32,
        payload: &[u8],
        packet_id: u32,
    ) -> std::result::Result<Vec<Bytes>, SendError> {
        if packet_id == 0 || payload.is_empty() {
            return Err(SendError::Invalid);
        }
        let total_length = u32::try_from(payload.len()).map_err(|_| SendError::PacketTooLarge)?;

        let mut frames = Vec::with_capacity(payload.len().div_ceil(self.max_payload_size));
        let mut offset = 0usize;
        while offset < payload.len() {
            let end = (offset + self.max_payload_size).min(payload.len());
            let chunk = ChunkInfo {
                packet_id,
                chunk_offset: offset as u32,
                total_length,
            };
            frames.push(self.encode_one(command_id, response_id, Some(chunk), &payload[offset..end]));
            offset = end;
        }
        Ok(frames)
    }

    fn encode_one(
        &self,
        command_id: u16,
        response_id: u32,
        chunk: Option<ChunkInfo>,
        payload: &[u8],
    ) -> Bytes {
        // Compress only when it actually wins.
        let (mode, body): (CompressionMode, Cow<'_, [u8]>) = match self.compression {
            CompressionMode::Lz4 if !payload.is_empty() => {
                let compressed = lz4_flex::compress_prepend_size(payload);
                if compressed.len() < payload.len() {
                    (CompressionMode::Lz4, Cow::Owned(compressed))
                } else {
                    (CompressionMode::None, Cow::Borrowed(payload))
                }
            }
            _ => (CompressionMode::None, Cow::Borrowed(payload)),
        };

        let header_byte = HeaderByte {
            compression: mode,
            is_response: response_id != 0,
            is_chunked: chunk.is_some(),
        };

        let opt_len = header_byte.optional_len();
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + opt_len + body.len() + 1);
        buf.put_u8(header_byte.encode());
        buf.put_u16_le(command_id);
        buf.put_u16_le(body.len() as u16);
        buf.put_u16_le(0); // checksum backfilled below
        if let Some(chunk) = chunk {
            buf.put_u32_le(chunk.packet_id);
            buf.put_u32_le(chunk.chunk_offset);
            buf.put_u32_le(chunk.total_length);
        }
        if response_id != 0 {
            buf.put_u32_le(response_id);
        }
        buf.put_slice(&body);

        let checksum = Checksum::over(&[&buf[..5], &buf[HEADER_SIZE..]]);
        buf[5..HEADER_SIZE].copy_from_slice(&checksum.to_le_bytes());

        if self.sentinel {
            buf.put_u8(SENTINEL);
        }
        buf.freeze()
    }
}

/// Decoder half shared by the TCP framer and the UDP datagram path.
#[derive(Debug, Clone)]
pub struct FrameDecoder {
    pool: BytePool,
    max_payload_size: usize,
}

impl FrameDecoder {
    /// Create a decoder renting its output buffers from `pool`.
    pub fn new(pool: BytePool, max_payload_size: usize) -> Self {
        Self {
            pool,
            max_payload_size,
        }
    }

    /// Decode one complete datagram as a frame (UDP path, no sentinel).
    ///
    /// The datagram must contain exactly one frame; trailing or missing
    /// bytes are a framing error and the caller drops the datagram.
    pub fn decode_datagram(&self, datagram: &[u8]) -> std::result::Result<Frame, FramingError> {
        if datagram.len() < HEADER_SIZE {
            return Err(FramingError::Truncated);
        }
        let header_byte = HeaderByte::decode(datagram[0])?;
        let command_id = u16::from_le_bytes([datagram[1], datagram[2]]);
        let payload_length = u16::from_le_bytes([datagram[3], datagram[4]]) as usize;
        let checksum = u16::from_le_bytes([datagram[5], datagram[6]]);

        let opt_len = header_byte.optional_len();
        if datagram.len() != HEADER_SIZE + opt_len + payload_length {
            return Err(FramingError::Truncated);
        }

        let opt = &datagram[HEADER_SIZE..HEADER_SIZE + opt_len];
        let mut body = self.pool.rent(payload_length);
        body.as_mut_slice()
            .copy_from_slice(&datagram[HEADER_SIZE + opt_len..]);

        self.finish(header_byte, command_id, payload_length, checksum, opt, body)
    }

    /// Verify and decode a frame whose pieces have already been pulled
    /// from the ring: validated header byte, fixed-header fields, the
    /// optional-field bytes, and the raw body.
    pub fn finish(
        &self,
        header_byte: HeaderByte,
        command_id: u16,
        payload_length: usize,
        checksum: u16,
        opt: &[u8],
        body: PooledBuf,
    ) -> std::result::Result<Frame, FramingError> {
        debug_assert_eq!(opt.len(), header_byte.optional_len());
        debug_assert_eq!(body.len(), payload_length);

        let computed = Checksum::over(&[
            &[header_byte.encode()],
            &command_id.to_le_bytes(),
            &(payload_length as u16).to_le_bytes(),
            opt,
            &body,
        ]);
        if computed != checksum {
            return Err(FramingError::ChecksumMismatch);
        }

        let (chunk, response_id) = parse_optional_fields(header_byte, opt);

        let payload = match header_byte.compression {
            CompressionMode::None => body,
            CompressionMode::Lz4 => {
                let raw = lz4_flex::decompress_size_prepended(&body)
                    .map_err(|_| FramingError::DecompressFailure)?;
                if raw.len() > self.max_payload_size {
                    return Err(FramingError::PayloadTooLarge);
                }
                self.pool.adopt(raw)
            }
        };

        Ok(Frame {
            command_id,
            response_id,
            chunk,
            payload,
        })
    }
}

fn parse_optional_fields(header_byte: HeaderByte, opt: &[u8]) -> (Option<ChunkInfo>, u32) {
    let mut at = 0;
    let chunk = header_byte.is_chunked.then(|| {
        let info = ChunkInfo {
            packet_id: u32::from_le_bytes(opt[at..at + 4].try_into().unwrap()),
            chunk_offset: u32::from_le_bytes(opt[at + 4..at + 8].try_into().unwrap()),
            total_length: u32::from_le_bytes(opt[at + 8..at + 12].try_into().unwrap()),
        };
        at += 12;
        info
    });
    let response_id = if header_byte.is_response {
        u32::from_le_bytes(opt[at..at + 4].try_into().unwrap())
    } else {
        0
    };
    (chunk, response_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::wire_format::TCP_PAYLOAD_SIZE_MAX;

    fn decoder() -> FrameDecoder {
        FrameDecoder::new(BytePool::new(), TCP_PAYLOAD_SIZE_MAX)
    }

    fn udp_roundtrip(encoder: &FrameEncoder, command_id: u16, response_id: u32, payload: &[u8]) -> Frame {
        let wire = encoder.encode(command_id, response_id, payload).unwrap();
        decoder().decode_datagram(&wire).unwrap()
    }

    #[test]
    fn test_happy_single_frame_wire_layout() {
        let encoder = FrameEncoder::tcp(TCP_PAYLOAD_SIZE_MAX);
        let wire = encoder.encode(5, 0, &[45, 48, 72, 15]).unwrap();

        // header byte: no compression, no response, no chunk
        assert_eq!(wire[0], 0);
        // command id 5, little endian
        assert_eq!(&wire[1..3], &[5, 0]);
        // payload length 4
        assert_eq!(&wire[3..5], &[4, 0]);
        // checksum over header-with-zeroed-checksum + body
        let expected = Checksum::over(&[&[0, 5, 0, 4, 0], &[45, 48, 72, 15]]);
        assert_eq!(u16::from_le_bytes([wire[5], wire[6]]), expected);
        // body then sentinel
        assert_eq!(&wire[7..11], &[45, 48, 72, 15]);
        assert_eq!(wire[11], SENTINEL);
        assert_eq!(wire.len(), 12);
    }

    #[test]
    fn test_udp_frame_has_no_sentinel() {
        let encoder = FrameEncoder::udp(UDP_MAX);
        let wire = encoder.encode(5, 0, &[1, 2, 3]).unwrap();
        assert_eq!(wire.len(), HEADER_SIZE + 3);
    }

    const UDP_MAX: usize = crate::protocol::wire_format::UDP_PAYLOAD_SIZE_MAX;

    #[test]
    fn test_roundtrip_plain() {
        let encoder = FrameEncoder::udp(UDP_MAX);
        let frame = udp_roundtrip(&encoder, 42, 0, b"hello world");
        assert_eq!(frame.command_id, 42);
        assert_eq!(frame.response_id, 0);
        assert!(frame.chunk.is_none());
        assert_eq!(frame.payload(), b"hello world");
    }

    #[test]
    fn test_roundtrip_with_response_id() {
        let encoder = FrameEncoder::udp(UDP_MAX);
        let frame = udp_roundtrip(&encoder, 42, 0xDEADBEEF, b"reply");
        assert_eq!(frame.response_id, 0xDEADBEEF);
        assert!(frame.is_response());
        assert_eq!(frame.payload(), b"reply");
    }

    #[test]
    fn test_roundtrip_compressed() {
        let encoder = FrameEncoder::udp(UDP_MAX).with_compression(CompressionMode::Lz4);
        let payload = vec![7u8; 10_000]; // highly compressible
        let wire = encoder.encode(9, 0, &payload).unwrap();
        assert!(wire.len() < payload.len());
        assert_eq!(wire[0] & 0b0000_0111, 1); // lz4 mode bits

        let frame = decoder().decode_datagram(&wire).unwrap();
        assert_eq!(frame.payload(), &payload[..]);
        assert_eq!(frame.payload_len(), 10_000);
    }

    #[test]
    fn test_incompressible_payload_sent_raw() {
        let encoder = FrameEncoder::udp(UDP_MAX).with_compression(CompressionMode::Lz4);
        // 4 bytes cannot win against the 4-byte length prefix.
        let wire = encoder.encode(9, 0, &[1, 2, 3, 4]).unwrap();
        assert_eq!(wire[0] & 0b0000_0111, 0);
        let frame = decoder().decode_datagram(&wire).unwrap();
        assert_eq!(frame.payload(), &[1, 2, 3, 4]);
    }

    #[test]
    fn test_encode_rejects_oversize() {
        let encoder = FrameEncoder::tcp(16);
        let result = encoder.encode(1, 0, &[0u8; 17]);
        assert_eq!(result.unwrap_err(), SendError::PacketTooLarge);
    }

    #[test]
    fn test_encode_chunks_layout() {
        let encoder = FrameEncoder::tcp(32_768);
        let payload = vec![0xCD; 131_072];
        let frames = encoder.encode_chunks(7, 0, &payload, 99).unwrap();
        assert_eq!(frames.len(), 4);

        let dec = FrameDecoder::new(BytePool::new(), 32_768);
        for (i, wire) in frames.iter().enumerate() {
            // Strip the TCP sentinel for datagram-style decode.
            let frame = dec.decode_datagram(&wire[..wire.len() - 1]).unwrap();
            let chunk = frame.chunk.expect("chunked");
            assert_eq!(chunk.packet_id, 99);
            assert_eq!(chunk.chunk_offset, (i * 32_768) as u32);
            assert_eq!(chunk.total_length, 131_072);
            assert_eq!(frame.payload_len(), 32_768);
        }
    }

    #[test]
    fn test_encode_chunks_last_carries_remainder() {
        let encoder = FrameEncoder::tcp(100);
        let payload = vec![1u8; 250];
        let frames = encoder.encode_chunks(7, 0, &payload, 5).unwrap();
        assert_eq!(frames.len(), 3);

        let dec = FrameDecoder::new(BytePool::new(), 100);
        let last = &frames[2];
        let frame = dec.decode_datagram(&last[..last.len() - 1]).unwrap();
        assert_eq!(frame.payload_len(), 50);
        assert_eq!(frame.chunk.unwrap().chunk_offset, 200);
    }

    #[test]
    fn test_encode_chunks_rejects_zero_packet_id() {
        let encoder = FrameEncoder::tcp(100);
        assert_eq!(
            encoder.encode_chunks(7, 0, &[1], 0).unwrap_err(),
            SendError::Invalid
        );
    }

    #[test]
    fn test_decode_rejects_checksum_mismatch() {
        let encoder = FrameEncoder::udp(UDP_MAX);
        let wire = encoder.encode(5, 0, b"payload").unwrap();
        let mut corrupted = wire.to_vec();
        corrupted[9] ^= 0xFF;
        assert_eq!(
            decoder().decode_datagram(&corrupted).unwrap_err(),
            FramingError::ChecksumMismatch
        );
    }

    #[test]
    fn test_decode_rejects_truncated_datagram() {
        let encoder = FrameEncoder::udp(UDP_MAX);
        let wire = encoder.encode(5, 0, b"payload").unwrap();
        assert_eq!(
            decoder().decode_datagram(&wire[..wire.len() - 2]).unwrap_err(),
            FramingError::Truncated
        );
        assert_eq!(
            decoder().decode_datagram(&[1, 2, 3]).unwrap_err(),
            FramingError::Truncated
        );
    }

    #[test]
    fn test_decode_rejects_encryption_bits() {
        let encoder = FrameEncoder::udp(UDP_MAX);
        let wire = encoder.encode(5, 0, b"x").unwrap();
        let mut tampered = wire.to_vec();
        tampered[0] |= 0b0000_1000;
        assert_eq!(
            decoder().decode_datagram(&tampered).unwrap_err(),
            FramingError::UnknownEncryption
        );
    }

    #[test]
    fn test_decode_rejects_oversize_decompressed() {
        // Compresses far below the limit but inflates past it.
        let encoder = FrameEncoder::udp(UDP_MAX).with_compression(CompressionMode::Lz4);
        let payload = vec![0u8; 60_000];
        let wire = encoder.encode(5, 0, &payload).unwrap();

        let tight = FrameDecoder::new(BytePool::new(), 1_000);
        assert_eq!(
            tight.decode_datagram(&wire).unwrap_err(),
            FramingError::PayloadTooLarge
        );
    }

    #[test]
    fn test_msgpack_roundtrip() {
        #[derive(serde::Serialize, serde::Deserialize, PartialEq, Debug)]
        struct Sample {
            id: u32,
            name: String,
        }

        let value = Sample {
            id: 7,
            name: "netwire".into(),
        };
        let bytes = MsgPackCodec::encode(&value).unwrap();
        let back: Sample = MsgPackCodec::decode(&bytes).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn test_empty_payload_frame() {
        let encoder = FrameEncoder::udp(UDP_MAX);
        let frame = udp_roundtrip(&encoder, 3, 0, b"");
        assert_eq!(frame.payload_len(), 0);
    }
}
