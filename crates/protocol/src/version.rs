//! Chunk versions
//!
//! A version is `(epoch, stamp)`. The epoch is an opaque 12-byte id that
//! changes on any chunk-migration event; stamps from different epochs are
//! incomparable, so ordering is only ever defined within one epoch.

use std::fmt;

use keel_doc::ObjectId;

/// Version tag attached to every chunk, used to detect stale routing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChunkVersion {
    epoch: ObjectId,
    stamp: u64,
}

impl ChunkVersion {
    pub const ZERO: ChunkVersion = ChunkVersion {
        epoch: ObjectId::ZERO,
        stamp: 0,
    };

    #[inline]
    pub fn new(epoch: ObjectId, stamp: u64) -> Self {
        Self { epoch, stamp }
    }

    #[inline]
    pub fn epoch(&self) -> ObjectId {
        self.epoch
    }

    #[inline]
    pub fn stamp(&self) -> u64 {
        self.stamp
    }

    /// The zero version marks unsharded routing; no handshake is performed
    #[inline]
    pub fn is_zero(&self) -> bool {
        self.stamp == 0 && self.epoch.is_zero()
    }

    /// Stamp order, defined only within one epoch
    pub fn same_epoch(&self, other: &ChunkVersion) -> bool {
        self.epoch == other.epoch
    }
}

impl fmt::Display for ChunkVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Version({}, {})", self.epoch, self.stamp)
    }
}
