//! Protocol error types

use thiserror::Error;

/// Errors from parsing or building wire messages
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame shorter than its own header
    #[error("message too short: {size} bytes")]
    TooShort { size: usize },

    /// Declared length exceeds the 16MB cap
    #[error("message length {size} exceeds limit {limit}")]
    TooLong { size: usize, limit: usize },

    /// Body ended before a field was complete
    #[error("truncated {what}")]
    Truncated { what: &'static str },

    /// Reply's response_to does not match the request id we sent
    #[error("message id mismatch: expected {expected}, got {got}")]
    IdMismatch { expected: u32, got: u32 },

    /// Opcode value is not part of the dialect
    #[error("unknown opcode {0}")]
    BadOpcode(u32),

    /// Message is structurally valid but violates the dialect
    #[error("bad message: {0}")]
    BadMessage(&'static str),

    /// Malformed document payload
    #[error("document payload: {0}")]
    Doc(#[from] keel_doc::DocError),

    /// Malformed namespace string
    #[error("bad namespace {0:?}")]
    BadNamespace(String),
}

impl ProtocolError {
    #[inline]
    pub fn truncated(what: &'static str) -> Self {
        Self::Truncated { what }
    }
}
