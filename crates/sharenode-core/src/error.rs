//! Error types for Sharenode

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed key material: {0}")]
    MalformedKey(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Secure session not established")]
    NotEnabled,

    #[error("Signature verification failed")]
    BadSignature,

    #[error("Truncated frame: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    #[error("Unknown message type: {0}")]
    UnknownMessageType(u8),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Invalid segment index: {index}, file has {total} segments")]
    InvalidSegmentIndex { index: u32, total: u32 },

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
}

pub type Result<T> = std::result::Result<T, Error>;
