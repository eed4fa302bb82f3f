//! Protocol error types

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProtocolError>;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Invalid magic bytes")]
    InvalidMagic,

    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    #[error("Unknown message type: 0x{0:04x}")]
    UnknownMessageType(u16),

    #[error("Invalid payload length: expected {expected}, got {got}")]
    InvalidPayloadLength { expected: usize, got: usize },

    #[error("Payload too large: max {max}, got {got}")]
    PayloadTooLarge { max: usize, got: usize },

    #[error("CRC mismatch: expected 0x{expected:08x}, got 0x{got:08x}")]
    CrcMismatch { expected: u32, got: u32 },

    #[error("Invalid field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("Invalid UTF-8 in {0}")]
    InvalidUtf8(&'static str),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
