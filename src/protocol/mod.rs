//! Protocol module - wire format, codec, framing, and frame types.
//!
//! This module implements the binary protocol of the engine:
//! - 7-byte fixed header with bitfield flags, plus optional chunk and
//!   response fields
//! - frame encoder/decoder with checksum and optional LZ4
//! - per-peer framer with TCP resynchronization
//! - fixed layouts for reserved control commands

mod codec;
mod control;
mod frame;
mod framer;
mod wire_format;

pub use codec::{FrameDecoder, FrameEncoder, MsgPackCodec};
pub use control::{ClientInfo, PingInfo, UdpAssignment};
pub use frame::{ChunkInfo, Frame};
pub use framer::Framer;
pub use wire_format::{
    commands, header_bits, is_reserved_command, Checksum, CompressionMode, HeaderByte,
    CHUNK_FIELDS_SIZE, CLOSE_TIMEOUT, DEFAULT_REQUEST_TIMEOUT, HEADER_SIZE, REASSEMBLY_TTL,
    RESPONSE_FIELD_SIZE, SENTINEL, TCP_PAYLOAD_SIZE_MAX, UDP_PAYLOAD_SIZE_MAX, USER_COMMAND_LIMIT,
};
