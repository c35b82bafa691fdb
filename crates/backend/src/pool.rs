//! Process-wide shard interning
//!
//! Shards are shared by connection string: every topology snapshot that
//! names the same replica set gets the same `Arc<Shard>`, so ping state,
//! pools and primary tracking survive topology refreshes.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::env::ClusterEnv;
use crate::error::Result;
use crate::shard::Shard;

/// The process's shard registry
pub struct ShardPool {
    env: Arc<ClusterEnv>,
    shards: RwLock<HashMap<String, Arc<Shard>>>,
}

impl ShardPool {
    pub fn new(env: Arc<ClusterEnv>) -> Self {
        Self {
            env,
            shards: RwLock::new(HashMap::new()),
        }
    }

    /// The shard for `connstr`, constructing and interning on first sight
    pub fn get(&self, id: &str, connstr: &str) -> Result<Arc<Shard>> {
        if let Some(shard) = self.shards.read().get(connstr) {
            return Ok(Arc::clone(shard));
        }

        let fresh = Shard::make(id, connstr, Arc::clone(&self.env))?;
        let mut shards = self.shards.write();
        // A racing caller may have interned meanwhile; theirs wins
        Ok(Arc::clone(shards.entry(connstr.to_owned()).or_insert(fresh)))
    }
}
