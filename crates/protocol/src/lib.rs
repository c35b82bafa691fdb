//! Keel - Wire protocol
//!
//! Sans-IO parsing and building of the request/reply dialect spoken on both
//! sides of the proxy. Each message starts with a 16-byte header
//! `{length:u32, req_id:u32, response_to:u32, opcode:u32}` (little-endian,
//! length includes itself); document payloads use the `keel_doc` codec.
//!
//! # Design Principles
//!
//! - **Sans-IO**: this crate never touches a socket. Callers frame bytes
//!   off their streams and hand complete messages here.
//! - **Bounds-checked**: malformed or truncated input returns
//!   `ProtocolError`, never panics.
//! - **Round-trip clean**: `encode(decode(bytes)) == bytes` for every
//!   recognized message kind.

mod decode;
mod encode;
mod error;
mod message;
mod namespace;
mod version;

pub use decode::{Delete, DeleteSub, GetMore, Insert, KillCursors, Query, Reply, Update, UpdateSub};
pub use encode::{
    wire_delete, wire_get_more, wire_insert, wire_kill_cursors, wire_update, MsgBuilder,
    QueryBuilder, ReplyBuilder,
};
pub use error::ProtocolError;
pub use message::{MsgHeader, Opcode, RawMessage, HEADER_LEN};
pub use namespace::Namespace;
pub use version::ChunkVersion;

/// Result type for protocol operations
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Hard cap on any message in either direction (16MB)
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// The four ASCII bytes of `"GET "` read as a little-endian length prefix;
/// a client "message" this long is an HTTP request on the wire port
pub const HTTP_GET_MAGIC: u32 = 0x2054_4547;

#[cfg(test)]
mod decode_test;
