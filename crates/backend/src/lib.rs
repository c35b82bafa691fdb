//! Keel - Backend plumbing
//!
//! Everything between the engines and the wire: pooled connections with
//! the version handshake, endpoints with their lifelong ping loops,
//! backends aggregating endpoint liveness, and shards selecting a backend
//! for each operation.
//!
//! # Liveness model
//!
//! Every endpoint pings continuously; nobody on the request path ever
//! waits for a probe except after a lost primary, where the shard runs a
//! single shared emergency sweep and read paths briefly queue behind it.

mod backend;
mod conn;
mod endpoint;
mod env;
mod error;
mod lazy;
mod monitor;
mod pool;
mod shard;

pub use backend::{Backend, SoftwareVersion};
pub use conn::Connection;
pub use endpoint::Endpoint;
pub use env::ClusterEnv;
pub use error::{OpError, Result};
pub use lazy::Lazy;
pub use monitor::{HealthStatus, Level};
pub use pool::ShardPool;
pub use shard::{PingQuery, Shard};
