//! Document codec error types

use thiserror::Error;

/// Errors from parsing or building documents
#[derive(Debug, Error)]
pub enum DocError {
    /// Input ended before the declared length
    #[error("document truncated: need {need} bytes, have {have}")]
    Truncated {
        /// Bytes required to continue
        need: usize,
        /// Bytes actually available
        have: usize,
    },

    /// Declared length exceeds the size cap
    #[error("document size {size} exceeds limit {limit}")]
    TooLarge { size: usize, limit: usize },

    /// Declared length is smaller than the minimal document
    #[error("document size {0} below minimum")]
    TooSmall(usize),

    /// Unknown value type tag
    #[error("unknown value type tag 0x{0:02x}")]
    BadTypeTag(u8),

    /// Field name or string payload is not valid UTF-8
    #[error("invalid UTF-8 in {0}")]
    BadUtf8(&'static str),

    /// Document did not end with the closing zero byte
    #[error("missing document terminator")]
    MissingTerminator,
}

impl DocError {
    #[inline]
    pub fn truncated(need: usize, have: usize) -> Self {
        Self::Truncated { need, have }
    }
}
