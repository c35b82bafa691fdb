//! Shared secret and the nonce handshake
//!
//! The key file holds a base64-ish blob (whitespace ignored). The secret
//! sent over the wire is never the blob itself but its user digest, and
//! every authentication proves possession through a per-connection nonce.

use std::path::Path;

use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::{AuthError, Result, SYSTEM_USER};

fn sha256_hex(input: &str) -> String {
    let mut ctx = Sha256::new();
    ctx.update(input.as_bytes());
    hex::encode(ctx.finalize())
}

/// Password digest stored per user: `hex(H(user + ":keel:" + password))`
pub fn make_digest(user: &str, password: &str) -> String {
    sha256_hex(&format!("{user}:keel:{password}"))
}

/// Key a client (or the proxy) presents: `hex(H(nonce + user + digest))`
pub fn make_auth_key(nonce: &str, user: &str, digest: &str) -> String {
    sha256_hex(&format!("{nonce}{user}{digest}"))
}

/// A fresh 8-byte hex nonce
pub fn mknonce() -> String {
    let mut raw = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut raw);
    hex::encode(raw)
}

/// Load the shared secret from a key file and derive the system digest.
///
/// Only base64 characters are allowed between whitespace; anything else
/// fails startup.
pub fn load_secret(path: &Path) -> Result<String> {
    let bad = |reason: &str| AuthError::BadKeyFile {
        path: path.display().to_string(),
        reason: reason.to_owned(),
    };

    let raw = std::fs::read_to_string(path).map_err(|e| bad(&e.to_string()))?;
    let mut key = String::new();
    for c in raw.chars() {
        if c.is_whitespace() {
            continue;
        }
        if c.is_ascii_alphanumeric() || c == '=' || c == '+' || c == '/' {
            key.push(c);
        } else {
            return Err(bad("non-base64 character"));
        }
    }
    if key.is_empty() {
        return Err(bad("empty key"));
    }

    Ok(make_digest(SYSTEM_USER, &key))
}
