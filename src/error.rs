//! Error types for netwire.

use thiserror::Error;

/// Main error type for all netwire operations.
#[derive(Debug, Error)]
pub enum NetwireError {
    /// I/O error during socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// MsgPack serialization error.
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error.
    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    /// Caller violated a protocol precondition (reserved command id,
    /// callback for an unregistered id, ...).
    #[error("Protocol misuse: {0}")]
    Misuse(String),

    /// The engine has been disposed.
    #[error("Engine disposed")]
    Disposed,

    /// Transport-level connect did not complete within the given timeout.
    #[error("Connect timed out")]
    ConnectTimeout,

    /// Connection closed unexpectedly.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Backpressure timeout - write queue full.
    #[error("Backpressure timeout")]
    BackpressureTimeout,
}

/// Result type alias using NetwireError.
pub type Result<T> = std::result::Result<T, NetwireError>;

/// Error returned from `send`-family operations.
///
/// The success case ("none") is `Ok(())` on the caller side. Transient
/// failures are not retried by the engine; the caller decides.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    /// The operation is invalid in the current engine state.
    #[error("send invalid in current state")]
    Invalid,

    /// The underlying socket failed.
    #[error("socket error during send")]
    SocketError,

    /// The peer is not connected (never connected, or already removed).
    #[error("peer disconnected")]
    Disconnected,

    /// A single unchunked frame cannot carry this payload.
    #[error("packet too large")]
    PacketTooLarge,
}

/// Outcome delivered to the awaiter of a request that did not complete
/// with a response.
#[derive(Debug, Error)]
pub enum RequestError {
    /// No response arrived within the timeout; the response slot was
    /// released.
    #[error("request timed out")]
    TimedOut,

    /// The request was cancelled before a response arrived.
    #[error("request cancelled")]
    Cancelled,

    /// The request frame could not be sent.
    #[error("request send failed: {0}")]
    Send(#[from] SendError),

    /// The response payload could not be deserialized to the requested
    /// type.
    #[error("response decode failed: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// The response arrived but its fixed layout was invalid.
    #[error("response layout invalid")]
    BadResponse,
}

/// Frame-local decode failures.
///
/// These never propagate out of the receive path: the framer discards the
/// offending bytes and resynchronizes (TCP) or drops the datagram (UDP).
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FramingError {
    /// Checksum verification failed.
    #[error("checksum mismatch")]
    ChecksumMismatch,

    /// Header carries a compression mode this engine does not know.
    #[error("unknown compression mode")]
    UnknownCompression,

    /// Header carries a nonzero encryption mode (reserved).
    #[error("unknown encryption mode")]
    UnknownEncryption,

    /// Reserved header bits were set.
    #[error("reserved header bits set")]
    ReservedBits,

    /// LZ4 decompression failed.
    #[error("decompression failed")]
    DecompressFailure,

    /// Decoded payload exceeds the configured maximum.
    #[error("payload too large")]
    PayloadTooLarge,

    /// The frame is shorter than its header claims.
    #[error("truncated frame")]
    Truncated,
}

/// Why a peer left, as reported to `on_disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The peer sent a DISCONNECT frame or closed the stream cleanly.
    Graceful,
    /// The underlying socket failed.
    SocketError,
    /// The peer went silent past a timeout and its state was reset.
    TimeoutReset,
    /// Removed for a reason the engine cannot classify.
    Unspecified,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_error_display() {
        assert_eq!(SendError::Disconnected.to_string(), "peer disconnected");
        assert_eq!(SendError::PacketTooLarge.to_string(), "packet too large");
    }

    #[test]
    fn test_request_error_from_send_error() {
        let err: RequestError = SendError::SocketError.into();
        assert!(matches!(err, RequestError::Send(SendError::SocketError)));
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        let err: NetwireError = io.into();
        assert!(matches!(err, NetwireError::Io(_)));
    }
}
