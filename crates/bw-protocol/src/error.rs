//! Protocol error types

use thiserror::Error;

/// Errors that can occur during protocol operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Unknown frame kind
    #[error("Unknown frame kind: {0}")]
    UnknownFrameKind(u8),

    /// Frame kind in the header disagrees with the decoded envelope
    #[error("Frame kind mismatch: header says {header:?}, payload is {payload:?}")]
    KindMismatch {
        header: crate::envelope::FrameKind,
        payload: crate::envelope::FrameKind,
    },

    /// Payload exceeds maximum size
    #[error("Payload too large: {size} bytes exceeds maximum of {max} bytes")]
    PayloadTooLarge { size: usize, max: usize },

    /// Envelope serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Message payload was not valid JSON for the expected type
    #[error("Invalid message payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
