//! Error types for the pvrd wire protocol.

use thiserror::Error;

/// Protocol-level errors that can occur during encoding or decoding.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Frame payload is larger than the allowed maximum.
    #[error("Frame too large: {0} bytes (max: {1})")]
    FrameTooLarge(u32, u32),

    /// A field read ran past the end of the payload.
    #[error("Malformed payload: expected {expected} more bytes, got {actual}")]
    Malformed { expected: usize, actual: usize },

    /// A string field did not contain valid UTF-8.
    #[error("Invalid UTF-8 in string field")]
    InvalidUtf8,

    /// The message class on the wire is not one we know.
    #[error("Unknown message class: {0}")]
    UnknownClass(u32),

    /// Payload compression or decompression failed.
    #[error("Compression error: {0}")]
    Compression(String),
}
