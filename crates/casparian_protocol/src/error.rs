//! Wire-level protocol errors (§6, §7 `protocol` error kind).

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProtocolError>;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("header too short: expected {expected} bytes, got {got}")]
    HeaderTooShort { expected: usize, got: usize },

    #[error("protocol version mismatch: expected {expected:#x}, got {got:#x}")]
    VersionMismatch { expected: u8, got: u8 },

    #[error("invalid op_code: {0:#x}")]
    InvalidOpCode(u8),

    #[error("invalid content_type: {0}")]
    InvalidContentType(u8),

    #[error("payload length mismatch: header says {expected}, got {got}")]
    PayloadLengthMismatch { expected: usize, got: usize },

    #[error("payload too large: {size} bytes exceeds max {max}")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("expected {expected} wire frames, got {got}")]
    InvalidFrameCount { expected: usize, got: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON encode/decode error: {0}")]
    Json(#[from] serde_json::Error),
}
