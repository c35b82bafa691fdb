//! 12-byte object identifiers
//!
//! Used for chunk epochs and the proxy's own server id. Generation is
//! timestamp + random tail; ordering is lexicographic over the raw bytes.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::RngCore;

/// A 12-byte opaque identifier with a hex display form
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ObjectId([u8; 12]);

impl ObjectId {
    /// The all-zero id (used as the null chunk epoch)
    pub const ZERO: ObjectId = ObjectId([0; 12]);

    /// Generate a fresh id: 4-byte big-endian unix time + 8 random bytes
    pub fn generate() -> Self {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0);

        let mut bytes = [0u8; 12];
        bytes[..4].copy_from_slice(&secs.to_be_bytes());
        rand::thread_rng().fill_bytes(&mut bytes[4..]);
        Self(bytes)
    }

    #[inline]
    pub const fn from_bytes(bytes: [u8; 12]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub const fn bytes(&self) -> &[u8; 12] {
        &self.0
    }

    #[inline]
    pub fn is_zero(&self) -> bool {
        self.0 == [0; 12]
    }

    /// Parse a 24-character hex string
    pub fn parse_hex(s: &str) -> Option<Self> {
        let raw = hex::decode(s).ok()?;
        let bytes: [u8; 12] = raw.try_into().ok()?;
        Some(Self(bytes))
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_differ() {
        assert_ne!(ObjectId::generate(), ObjectId::generate());
    }

    #[test]
    fn hex_round_trip() {
        let id = ObjectId::generate();
        assert_eq!(ObjectId::parse_hex(&id.to_string()), Some(id));
    }

    #[test]
    fn zero_is_zero() {
        assert!(ObjectId::ZERO.is_zero());
        assert!(!ObjectId::generate().is_zero());
    }
}
