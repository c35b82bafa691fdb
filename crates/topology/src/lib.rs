//! Keel - Cluster topology
//!
//! The parsed cluster map (shards, databases, collections, chunks with
//! versions), the cache that keeps a snapshot of it current, the router
//! that turns `(namespace, criteria)` into target shards, and the
//! snapshot file that makes the proxy usable before the config servers
//! answer.
//!
//! # Coherency model
//!
//! Maps are immutable once built. The cache swaps whole `Arc`s under a
//! short lock, so an operation that grabbed a map keeps routing against
//! it for its entire life; later operations observe monotonically newer
//! snapshots.

mod cache;
mod map;
mod snapshot;

pub use cache::TopologyCache;
pub use map::{Chunk, Collection, Database, TopologyMap, VersionedShard};
pub use snapshot::SnapshotStore;

/// Snapshot-cache key for the cluster map
pub const SNAPSHOT_TOPOLOGY: &str = "shard_config";
/// Snapshot-cache key for the credentials listing
pub const SNAPSHOT_AUTH: &str = "auth";

#[cfg(test)]
mod cache_test;
