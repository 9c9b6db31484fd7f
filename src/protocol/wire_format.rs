//! Wire format constants, header bitfield, and checksum.
//!
//! Every frame starts with a 7-byte fixed header:
//! ```text
//! ┌─────────────┬────────────┬────────────────┬──────────┐
//! │ Header byte │ Command ID │ Payload length │ Checksum │
//! │ 1 byte      │ 2 bytes LE │ 2 bytes LE     │ 2 bytes  │
//! └─────────────┴────────────┴────────────────┴──────────┘
//! ```
//!
//! Optional fields follow, selected by the header byte: chunk fields
//! (`packet_id`, `chunk_offset`, `total_length`, 4 bytes each) when the
//! chunked bit is set, then `response_id` (4 bytes) when the response bit
//! is set. The payload body comes last, terminated by a `0x00` sentinel
//! on TCP. All multi-byte integers are little endian.

use std::time::Duration;

use crate::error::FramingError;

/// Fixed header size in bytes (before optional chunk/response fields).
pub const HEADER_SIZE: usize = 7;

/// Size of the optional chunk fields (packet id, offset, total length).
pub const CHUNK_FIELDS_SIZE: usize = 12;

/// Size of the optional response id field.
pub const RESPONSE_FIELD_SIZE: usize = 4;

/// TCP frame terminator used for resynchronization.
pub const SENTINEL: u8 = 0x00;

/// Largest command id available to user code.
pub const USER_COMMAND_LIMIT: u16 = 0xFFEF;

/// Default maximum payload size per TCP frame.
pub const TCP_PAYLOAD_SIZE_MAX: usize = 65_535;

/// Default maximum payload size per UDP datagram.
pub const UDP_PAYLOAD_SIZE_MAX: usize = 65_507;

/// Linger applied when closing sockets on dispose.
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Inactivity TTL for partial reassemblies (timed variant).
pub const REASSEMBLY_TTL: Duration = Duration::from_millis(1_500);

/// Default timeout for request/response round trips.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Reserved control command ids (all above [`USER_COMMAND_LIMIT`]).
pub mod commands {
    /// Echo request; the payload carries a timestamp.
    pub const PING: u16 = 0xFFFD;
    /// Server-assigned identity notification.
    pub const CLIENT_INFO: u16 = 0xFFFE;
    /// UDP endpoint pairing notification.
    pub const UDP_CONNECT: u16 = 0xFFFC;
    /// Connection handshake.
    pub const CONNECT: u16 = 0xFFFB;
    /// Graceful teardown.
    pub const DISCONNECT: u16 = 0xFFFA;
}

/// Returns whether `command_id` is reserved for the engine.
#[inline]
pub fn is_reserved_command(command_id: u16) -> bool {
    command_id > USER_COMMAND_LIMIT
}

/// Header byte layout.
pub mod header_bits {
    /// Bits 0-2: compression mode.
    pub const COMPRESSION_MASK: u8 = 0b0000_0111;
    /// Bits 3-4: encryption mode (reserved, must be zero).
    pub const ENCRYPTION_MASK: u8 = 0b0001_1000;
    /// Bit 5: frame is a response to a prior request.
    pub const RESPONSE_BIT: u8 = 0b0010_0000;
    /// Bit 6: frame is one chunk of a fragmented payload.
    pub const CHUNKED_BIT: u8 = 0b0100_0000;
    /// Bit 7: reserved, must be zero.
    pub const RESERVED_BIT: u8 = 0b1000_0000;
}

/// Payload compression modes carried in the header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionMode {
    /// Payload sent as-is.
    #[default]
    None,
    /// LZ4 block with prepended uncompressed length, used only when it
    /// is strictly smaller than the raw payload.
    Lz4,
}

impl CompressionMode {
    /// Mode bits for the header byte.
    #[inline]
    pub fn bits(self) -> u8 {
        match self {
            CompressionMode::None => 0,
            CompressionMode::Lz4 => 1,
        }
    }

    /// Decode the mode bits from a header byte.
    pub fn from_bits(bits: u8) -> Result<Self, FramingError> {
        match bits {
            0 => Ok(CompressionMode::None),
            1 => Ok(CompressionMode::Lz4),
            _ => Err(FramingError::UnknownCompression),
        }
    }
}

/// Validated view of a header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderByte {
    /// Compression applied to the payload body.
    pub compression: CompressionMode,
    /// The frame answers a prior request (`response_id` field present).
    pub is_response: bool,
    /// The frame is one chunk of a fragmented payload (chunk fields
    /// present).
    pub is_chunked: bool,
}

impl HeaderByte {
    /// Compose the on-wire byte.
    pub fn encode(&self) -> u8 {
        let mut b = self.compression.bits();
        if self.is_response {
            b |= header_bits::RESPONSE_BIT;
        }
        if self.is_chunked {
            b |= header_bits::CHUNKED_BIT;
        }
        b
    }

    /// Parse and validate an incoming header byte.
    ///
    /// Rejects reserved bits and nonzero encryption modes; no cipher is
    /// mandated and the engine never encrypts.
    pub fn decode(raw: u8) -> Result<Self, FramingError> {
        if raw & header_bits::RESERVED_BIT != 0 {
            return Err(FramingError::ReservedBits);
        }
        if raw & header_bits::ENCRYPTION_MASK != 0 {
            return Err(FramingError::UnknownEncryption);
        }
        let compression = CompressionMode::from_bits(raw & header_bits::COMPRESSION_MASK)?;
        Ok(Self {
            compression,
            is_response: raw & header_bits::RESPONSE_BIT != 0,
            is_chunked: raw & header_bits::CHUNKED_BIT != 0,
        })
    }

    /// Byte count of the optional fields this header selects.
    #[inline]
    pub fn optional_len(&self) -> usize {
        let mut n = 0;
        if self.is_chunked {
            n += CHUNK_FIELDS_SIZE;
        }
        if self.is_response {
            n += RESPONSE_FIELD_SIZE;
        }
        n
    }
}

/// Running 16-bit folded byte-sum checksum.
///
/// Covers the fixed header (checksum field zeroed), optional fields, and
/// the encoded payload body. The 32-bit byte sum is folded into 16 bits
/// by repeatedly adding the carry half back in.
#[derive(Debug, Default, Clone, Copy)]
pub struct Checksum {
    sum: u32,
}

impl Checksum {
    /// Start a fresh checksum.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes into the sum.
    #[inline]
    pub fn update(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.sum += u32::from(b);
        }
    }

    /// Fold to the 16-bit wire value.
    pub fn finalize(self) -> u16 {
        let mut sum = self.sum;
        while sum >> 16 != 0 {
            sum = (sum & 0xFFFF) + (sum >> 16);
        }
        sum as u16
    }

    /// One-shot checksum over a list of byte regions.
    pub fn over(parts: &[&[u8]]) -> u16 {
        let mut c = Self::new();
        for part in parts {
            c.update(part);
        }
        c.finalize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_byte_roundtrip() {
        let hb = HeaderByte {
            compression: CompressionMode::Lz4,
            is_response: true,
            is_chunked: true,
        };
        let raw = hb.encode();
        assert_eq!(raw, 0b0110_0001);
        assert_eq!(HeaderByte::decode(raw).unwrap(), hb);
    }

    #[test]
    fn test_header_byte_plain() {
        let hb = HeaderByte {
            compression: CompressionMode::None,
            is_response: false,
            is_chunked: false,
        };
        assert_eq!(hb.encode(), 0);
        assert_eq!(hb.optional_len(), 0);
    }

    #[test]
    fn test_header_byte_rejects_reserved_bit() {
        assert_eq!(
            HeaderByte::decode(0b1000_0000),
            Err(FramingError::ReservedBits)
        );
    }

    #[test]
    fn test_header_byte_rejects_encryption() {
        assert_eq!(
            HeaderByte::decode(0b0000_1000),
            Err(FramingError::UnknownEncryption)
        );
        assert_eq!(
            HeaderByte::decode(0b0001_0000),
            Err(FramingError::UnknownEncryption)
        );
    }

    #[test]
    fn test_header_byte_rejects_unknown_compression() {
        assert_eq!(
            HeaderByte::decode(0b0000_0111),
            Err(FramingError::UnknownCompression)
        );
    }

    #[test]
    fn test_optional_len() {
        let mut hb = HeaderByte::decode(0).unwrap();
        hb.is_chunked = true;
        assert_eq!(hb.optional_len(), CHUNK_FIELDS_SIZE);
        hb.is_response = true;
        assert_eq!(hb.optional_len(), CHUNK_FIELDS_SIZE + RESPONSE_FIELD_SIZE);
    }

    #[test]
    fn test_reserved_command_range() {
        assert!(!is_reserved_command(0));
        assert!(!is_reserved_command(USER_COMMAND_LIMIT));
        assert!(is_reserved_command(USER_COMMAND_LIMIT + 1));
        assert!(is_reserved_command(commands::PING));
        assert!(is_reserved_command(commands::CONNECT));
        assert!(is_reserved_command(commands::DISCONNECT));
        assert!(is_reserved_command(commands::CLIENT_INFO));
        assert!(is_reserved_command(commands::UDP_CONNECT));
    }

    #[test]
    fn test_checksum_simple_sum() {
        assert_eq!(Checksum::over(&[&[1, 2, 3]]), 6);
        assert_eq!(Checksum::over(&[&[1, 2], &[3]]), 6);
    }

    #[test]
    fn test_checksum_folds_carry() {
        let data = [0xFFu8; 300];
        let sum: u32 = 300 * 255;
        let expected = ((sum & 0xFFFF) + (sum >> 16)) as u16;
        assert_eq!(Checksum::over(&[&data]), expected);
    }

    #[test]
    fn test_checksum_detects_single_flip() {
        let original = b"some payload bytes";
        let mut flipped = *original;
        flipped[4] ^= 0x01;
        assert_ne!(Checksum::over(&[original]), Checksum::over(&[&flipped]));
    }

    #[test]
    fn test_checksum_incremental_matches_oneshot() {
        let mut c = Checksum::new();
        c.update(b"hello ");
        c.update(b"world");
        assert_eq!(c.finalize(), Checksum::over(&[b"hello world"]));
    }
}
