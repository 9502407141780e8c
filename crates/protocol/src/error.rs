//! Error types for the wire protocol

use thiserror::Error;

/// Result type alias for protocol operations
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors raised while encoding or decoding wire data
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Payload was not valid base64
    #[error("base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),

    /// Ciphertext length is not a whole number of cipher blocks
    #[error("invalid data package received, data must be multiple of {block} bytes, has: {len}")]
    BlockSize { block: usize, len: usize },

    /// Decoded text did not start with `type=`
    #[error("invalid data package received, check encryption key")]
    MissingType,

    /// Key material could not be loaded
    #[error("key error: {0}")]
    Key(String),

    /// Malformed binary packet
    #[error("packet error: {0}")]
    Packet(String),

    /// Malformed admin protocol response
    #[error("admin protocol error: {0}")]
    Admin(String),

    /// Underlying I/O failure
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Create a packet error
    pub fn packet(msg: impl Into<String>) -> Self {
        ProtocolError::Packet(msg.into())
    }

    /// Create a key error
    pub fn key(msg: impl Into<String>) -> Self {
        ProtocolError::Key(msg.into())
    }

    /// Create an admin protocol error
    pub fn admin(msg: impl Into<String>) -> Self {
        ProtocolError::Admin(msg.into())
    }
}
