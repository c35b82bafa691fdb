//! The per-process context operations run against

use std::sync::Arc;

use keel_auth::CredentialsCache;
use keel_backend::{ClusterEnv, ShardPool};
use keel_topology::{SnapshotStore, TopologyCache};

/// Hook the binary installs so the setLogLevel command can reach the
/// subscriber
pub type LogLevelHook = Arc<dyn Fn(i64) + Send + Sync>;

/// Everything with process lifetime that the engines and sessions touch.
/// Built once at startup and passed by reference into every session.
pub struct Runtime {
    pub env: Arc<ClusterEnv>,
    pub topology: Arc<TopologyCache>,
    pub shards: Arc<ShardPool>,
    pub snapshots: Arc<SnapshotStore>,
    pub credentials: Arc<CredentialsCache>,
    pub log_hook: Option<LogLevelHook>,
}

impl Runtime {
    pub fn new(
        env: Arc<ClusterEnv>,
        topology: Arc<TopologyCache>,
        shards: Arc<ShardPool>,
        snapshots: Arc<SnapshotStore>,
    ) -> Self {
        Self {
            env,
            topology,
            shards,
            snapshots,
            credentials: Arc::new(CredentialsCache::new()),
            log_hook: None,
        }
    }

    #[must_use]
    pub fn with_log_hook(mut self, hook: LogLevelHook) -> Self {
        self.log_hook = Some(hook);
        self
    }
}
