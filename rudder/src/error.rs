use std::time::Duration;

use thiserror::Error;

/// All errors produced by the rudder transport and session layers.
#[derive(Debug, Error)]
pub enum RudderError {
    #[error("frame too short: expected {expected} bytes, got {actual}")]
    FrameTooShort { expected: usize, actual: usize },

    #[error("frame too long: {0} bytes exceeds the fixed frame size")]
    FrameTooLong(usize),

    #[error("unknown frame kind: 0x{0:02x}")]
    UnknownFrameKind(u8),

    #[error("payload length {len} exceeds maximum {max}")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("invalid filename: {0:?}")]
    InvalidFilename(String),

    #[error("no such file: {0}")]
    NoSuchFile(String),

    #[error("peer refused the transfer: {0}")]
    RemoteRefusal(String),

    #[error("no response to the transfer request")]
    HandshakeFail,

    #[error("no inbound traffic for {0:?}")]
    IdleTimeout(Duration),

    #[error("transfer ended with {missing} frames never delivered")]
    Incomplete { missing: u32 },

    #[error("dropped {0} undecodable datagrams, giving up")]
    TooManyMalformed(u32),

    #[error("session cancelled")]
    Cancelled,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RudderError>;
