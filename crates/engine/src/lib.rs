//! Keel - Read and write engines
//!
//! The operation layer between sessions and shards. Reads become
//! datasources (direct, or a k-way ordered merge across shards) with
//! hedged retransmission against slow replicas; writes are planned into
//! per-shard parallel groups and cross-shard sequential groups, executed
//! under deadlines, and their acknowledgements merged back into one.
//!
//! # Retry contract
//!
//! Operation entry points retry on `ShardConfigStale` (refreshing the
//! topology first) and on `NotMaster`; everything else propagates to the
//! session, which turns it into a client-visible reply.

mod plan;
mod read;
mod runtime;
mod source;
mod write;

pub use plan::{plan_delete, plan_find_and_modify, plan_insert, plan_update};
pub use read::{count, distinct, query};
pub use runtime::{LogLevelHook, Runtime};
pub use source::DataSource;
pub use write::{find_and_modify, insert, remove, update, WriteOp};

pub use keel_backend::{OpError, Result};

#[cfg(test)]
mod write_test;
