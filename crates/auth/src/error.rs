//! Auth error types

use thiserror::Error;

/// Errors from authentication and authorization
#[derive(Debug, Error)]
pub enum AuthError {
    /// Privilege check failed
    #[error("unauthorized")]
    Unauthorized,

    /// Key file missing, unreadable or malformed
    #[error("bad key file {path}: {reason}")]
    BadKeyFile { path: String, reason: String },

    /// A stored user document carries a role we do not know
    #[error("unknown privilege `{role}` for database `{db}`")]
    UnknownRole { role: String, db: String },
}
