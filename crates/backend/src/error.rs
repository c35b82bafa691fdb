//! The operational error taxonomy
//!
//! Everything an operation against the cluster can fail with, classified
//! the way the retry loops need: backend-internal anomalies retry blindly,
//! classified client errors drive specific recovery (topology refresh,
//! primary re-election), and request errors propagate to the client.

use keel_protocol::ProtocolError;
use thiserror::Error;

/// Result type for operations against the cluster
pub type Result<T> = std::result::Result<T, OpError>;

/// Operational errors, classified for retry decisions
#[derive(Debug, Error)]
pub enum OpError {
    /// Transport failure mid-conversation
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed bytes from a backend
    #[error("wire error: {0}")]
    Protocol(#[from] ProtocolError),

    /// A backend behaved in a way it never should (truncated reply,
    /// id mismatch, bad ack shape)
    #[error("backend internal error: {0}")]
    Internal(String),

    /// Backend reports the cursor is gone
    #[error("cursor not found: {0}")]
    CursorNotFound(String),

    /// Backend rejected the query in a well-formed reply
    #[error("query failure: {0}")]
    QueryFailure(String),

    /// Backend's chunk versions disagree with ours; refresh and retry
    #[error("shard config stale: {0}")]
    ShardConfigStale(String),

    /// The node we took for primary is not
    #[error("not master")]
    NotMaster,

    /// Node is permanently incapable of serving as primary
    #[error("{addr} permanently failed: {msg}")]
    PermanentFailure { addr: String, msg: String },

    /// Node cannot reach the rest of its replica set
    #[error("{addr} connectivity error: {msg}")]
    Connectivity { addr: String, msg: String },

    /// No replica satisfied the read preference, or no primary for a write
    #[error("no suitable backend: {0}")]
    NoSuitableBackend(String),

    /// Topology has never been fetched and no snapshot is cached
    #[error("no shard config available yet")]
    NoShardConfig,

    /// The topology document itself is inconsistent
    #[error("shard config broken: {0}")]
    ShardConfigBroken(String),

    /// Client's request is malformed or uses an unsupported feature
    #[error("{0}")]
    BadRequest(String),

    /// Privilege check failed
    #[error("unauthorized")]
    Unauthorized,

    /// Recognized but unsupported shape
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// Operation deadline expired
    #[error("timeout: {0}")]
    Timeout(String),
}

impl OpError {
    /// An error the backend reported in a well-formed reply, as opposed to
    /// a transport/protocol anomaly
    pub fn is_backend_client_error(&self) -> bool {
        matches!(
            self,
            OpError::CursorNotFound(_)
                | OpError::QueryFailure(_)
                | OpError::ShardConfigStale(_)
                | OpError::NotMaster
                | OpError::PermanentFailure { .. }
                | OpError::Connectivity { .. }
        )
    }

    #[inline]
    pub fn internal(msg: impl Into<String>) -> Self {
        OpError::Internal(msg.into())
    }

    #[inline]
    pub fn bad_request(msg: impl Into<String>) -> Self {
        OpError::BadRequest(msg.into())
    }
}

impl From<keel_doc::DocError> for OpError {
    fn from(e: keel_doc::DocError) -> Self {
        OpError::Protocol(ProtocolError::Doc(e))
    }
}

impl From<keel_auth::AuthError> for OpError {
    fn from(e: keel_auth::AuthError) -> Self {
        match e {
            keel_auth::AuthError::Unauthorized => OpError::Unauthorized,
            other => OpError::Internal(other.to_string()),
        }
    }
}
