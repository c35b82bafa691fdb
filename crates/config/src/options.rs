//! The proxy's tunables

use std::path::PathBuf;
use std::time::Duration;

use clap::Args;

use crate::duration::{parse_duration, parse_timeout, Timeout};

fn hardware_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

/// Every tunable of the proxy, exposed as long command-line options.
///
/// Duration-valued options accept `<n>min`, `<n>s`, `<n>ms`, `<n>us`;
/// those defaulting to `inf` also accept the literal `inf`.
#[derive(Debug, Clone, Args)]
pub struct Options {
    /// Require authorization for clients
    #[arg(long, default_value_t = false)]
    pub auth: bool,

    /// File containing a shared secret between the proxy and the backends
    #[arg(long)]
    pub key_file: Option<PathBuf>,

    /// Estimated ping between two local backends
    #[arg(long, value_parser = parse_duration, default_value = "10ms")]
    pub local_threshold: Duration,

    /// Ignore replicas whose replication lag exceeds this value
    #[arg(long, value_parser = parse_timeout, default_value = "inf")]
    pub max_repl_lag: Timeout,

    /// Default timeout for queries
    #[arg(long, value_parser = parse_timeout, default_value = "inf")]
    pub read_timeout: Timeout,

    /// Default timeout for inserts/updates/deletes
    #[arg(long, value_parser = parse_timeout, default_value = "inf")]
    pub write_timeout: Timeout,

    /// Default retransmit interval for queries
    #[arg(long, value_parser = parse_timeout, default_value = "inf")]
    pub read_retransmit: Timeout,

    /// Default retransmit interval for inserts/updates/deletes
    #[arg(long, value_parser = parse_timeout, default_value = "inf")]
    pub write_retransmit: Timeout,

    /// Timeout for backend pings
    #[arg(long, value_parser = parse_duration, default_value = "500ms")]
    pub ping_timeout: Duration,

    /// Ping interval for alive backends
    #[arg(long, value_parser = parse_duration, default_value = "10s")]
    pub ping_interval: Duration,

    /// Ping interval for dead backends
    #[arg(long, value_parser = parse_duration, default_value = "2s")]
    pub ping_fail_interval: Duration,

    /// Timeout for config servers
    #[arg(long, value_parser = parse_duration, default_value = "1s")]
    pub conf_timeout: Duration,

    /// Retransmit interval for config servers
    #[arg(long, value_parser = parse_duration, default_value = "20ms")]
    pub conf_retransmit: Duration,

    /// Poll interval for config servers
    #[arg(long, value_parser = parse_duration, default_value = "10s")]
    pub conf_interval: Duration,

    /// Maximal primary election time before monitoring reports critical
    #[arg(long, value_parser = parse_timeout, default_value = "inf")]
    pub monitor_no_primary: Timeout,

    /// Maximal topology snapshot age before monitoring reports critical
    #[arg(long, value_parser = parse_timeout, default_value = "inf")]
    pub monitor_config_age: Timeout,

    /// Make all cursor IDs global to the process instead of per-session
    #[arg(long, default_value_t = false)]
    pub global_cursors: bool,

    /// Persistent connections to keep pooled per backend endpoint
    #[arg(long, default_value_t = hardware_threads())]
    pub conn_pool_size: usize,

    /// Worker threads for the runtime
    #[arg(long, default_value_t = hardware_threads())]
    pub threads: usize,

    /// Forbid all writes through this proxy
    #[arg(long, default_value_t = false)]
    pub read_only: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            auth: false,
            key_file: None,
            local_threshold: Duration::from_millis(10),
            max_repl_lag: Timeout::INF,
            read_timeout: Timeout::INF,
            write_timeout: Timeout::INF,
            read_retransmit: Timeout::INF,
            write_retransmit: Timeout::INF,
            ping_timeout: Duration::from_millis(500),
            ping_interval: Duration::from_secs(10),
            ping_fail_interval: Duration::from_secs(2),
            conf_timeout: Duration::from_secs(1),
            conf_retransmit: Duration::from_millis(20),
            conf_interval: Duration::from_secs(10),
            monitor_no_primary: Timeout::INF,
            monitor_config_age: Timeout::INF,
            global_cursors: false,
            conn_pool_size: hardware_threads(),
            threads: hardware_threads(),
            read_only: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let o = Options::default();
        assert_eq!(o.local_threshold, Duration::from_millis(10));
        assert_eq!(o.ping_timeout, Duration::from_millis(500));
        assert_eq!(o.conf_retransmit, Duration::from_millis(20));
        assert_eq!(o.read_timeout, Timeout::INF);
        assert!(!o.read_only);
        assert!(o.conn_pool_size > 0);
    }
}
