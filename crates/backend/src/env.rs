//! Process-wide context threaded through the cluster plumbing

use keel_config::Options;
use keel_doc::ObjectId;

/// What every endpoint, backend and shard needs to know about the process
/// it runs in. Built once at startup and shared by reference; replaces the
/// globals a long-lived server tends to grow.
pub struct ClusterEnv {
    pub options: Options,
    /// This proxy's identity, sent along with version handshakes
    pub server_id: ObjectId,
    /// The config servers' connection string, named in version handshakes
    pub config_connstr: String,
    /// Digest the proxy authenticates with against backends, when keyed
    pub shared_secret: Option<String>,
}

impl ClusterEnv {
    pub fn new(options: Options, config_connstr: String, shared_secret: Option<String>) -> Self {
        Self {
            options,
            server_id: ObjectId::generate(),
            config_connstr,
            shared_secret,
        }
    }
}
