//! Protocol error types
//!
//! Errors that can occur while encoding, decoding or reassembling bus
//! frames. By the taxonomy in the error-handling design these are all
//! protocol violations: the peer that produced them gets an ERR frame and
//! its connection is closed.

use thiserror::Error;

/// Errors that can occur during protocol operations
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Command byte is not one of the six known message kinds
    #[error("unknown command byte 0x{0:02x}")]
    UnknownCommand(u8),

    /// Flags byte is not exactly one of CONTINUATION or LAST
    #[error("invalid frame flags 0x{0:02x}")]
    InvalidFlags(u8),

    /// A single frame's payload exceeds the connection's transmit-unit size
    #[error("frame payload {size} exceeds limit {limit}")]
    FrameTooLarge { size: usize, limit: usize },

    /// A reassembled message exceeds the hard message cap
    #[error("message size {size} exceeds maximum {max}")]
    MessageTooLarge { size: usize, max: usize },

    /// Value kind byte is not one of the five scalar kinds
    #[error("unknown value kind {0}")]
    UnknownKind(u8),

    /// Value body is shorter than its kind or length prefix requires
    #[error("value truncated: expected {expected} bytes, got {actual}")]
    ValueTruncated { expected: usize, actual: usize },

    /// Value body is longer than its length prefix declares
    #[error("value overlong: {trailing} trailing bytes")]
    ValueOverlong { trailing: usize },

    /// Text payload is not valid UTF-8
    #[error("invalid UTF-8 in payload")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    /// Mapping/sequence payload is not valid JSON
    #[error("invalid JSON in payload: {0}")]
    InvalidJson(#[from] serde_json::Error),

    /// JSON payload decoded to a scalar where a mapping or sequence is required
    #[error("JSON payload is neither a mapping nor a sequence")]
    NotAContainer,
}
