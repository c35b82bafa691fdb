//! Keel - Document model
//!
//! The dynamic document type that flows through the proxy: ordered fields,
//! dynamic typing, a canonical total order across types, and a compact
//! little-endian binary codec.
//!
//! # Design Principles
//!
//! - **Insertion order is data**: field order is preserved and significant
//!   (sharding keys are ordered field lists).
//! - **One total order**: every pair of values compares, across types, so
//!   chunk bounds partition the key space without special cases.
//! - **Codec owns the bytes**: encode/decode work against `bytes` buffers
//!   with bounds checking; malformed input returns errors, never panics.

mod codec;
mod document;
mod error;
mod hash;
mod oid;
mod value;

pub use codec::{decode_doc, encode_doc, encoded_len, peek_doc_len};
pub use document::Doc;
pub use error::DocError;
pub use hash::hashed_key;
pub use oid::ObjectId;
pub use value::Value;

/// Result type for document operations
pub type Result<T> = std::result::Result<T, DocError>;

/// Largest document the codec will accept (16MB, matching the wire cap)
pub const MAX_DOC_SIZE: usize = 16 * 1024 * 1024;

#[cfg(test)]
mod codec_test;
#[cfg(test)]
mod document_test;
#[cfg(test)]
mod hash_test;
