//! Keel - Authentication
//!
//! Capability-level auth: the shared secret the proxy presents to backends,
//! the nonce handshake clients drive, and per-database privilege masks.
//!
//! Credentials live in each database's `system.users` collection; the
//! [`CredentialsCache`] holds a parsed snapshot, refreshed by whoever owns
//! the read path (the cache itself never does I/O).

mod cache;
mod error;
mod privileges;
mod secret;

pub use cache::CredentialsCache;
pub use error::AuthError;
pub use privileges::{Privilege, Privileges};
pub use secret::{load_secret, make_auth_key, make_digest, mknonce};

/// Result type for auth operations
pub type Result<T> = std::result::Result<T, AuthError>;

/// The user the proxy itself authenticates as against backends
pub const SYSTEM_USER: &str = "__system";

#[cfg(test)]
mod privileges_test;
