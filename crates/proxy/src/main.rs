//! keeld - the Keel routing proxy
//!
//! # Usage
//!
//! ```bash
//! keeld -c cfg1:4700,cfg2:4700 -l 4717
//! keeld -c cfg1:4700 -l 10.0.0.5:4717 -l 4718 -C /var/cache/keel.snapshot -v
//! ```
//!
//! Every tunable is a long option; durations accept `min|s|ms|us`
//! suffixes and the literal `inf`. Exit code 0 on a clean shutdown, 1 on
//! a fatal startup error.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use keel_backend::{ClusterEnv, ShardPool};
use keel_config::Options;
use keel_engine::{LogLevelHook, Runtime};
use keel_session::Listener;
use keel_topology::{SnapshotStore, TopologyCache, SNAPSHOT_AUTH};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*, reload};

/// keeld - sharded document-store routing proxy
#[derive(Parser, Debug)]
#[command(name = "keeld")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Config servers, comma-separated host:port pairs
    #[arg(short = 'c', long = "config-servers", value_name = "host:port[,...]")]
    config_servers: String,

    /// Address to listen on, repeatable
    #[arg(short = 'l', long = "listen", value_name = "[host:]port", required = true)]
    listen: Vec<String>,

    /// Cache the cluster topology in this file
    #[arg(short = 'C', long = "config-cache", value_name = "file")]
    config_cache: Option<PathBuf>,

    /// Increase logging verbosity (repeatable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,

    /// Write the log to this file instead of stderr
    #[arg(short = 'L', long = "logfile", value_name = "path")]
    logfile: Option<PathBuf>,

    #[command(flatten)]
    options: Options,
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("keeld: {e:#}");
        tracing::error!(error = %e, "keeld stopped");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let log_hook = init_logging(cli.verbose, cli.logfile.as_deref())?;

    let threads = cli.options.threads.max(1);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(threads)
        .enable_all()
        .build()
        .context("cannot build the runtime")?;

    runtime.block_on(serve(cli, log_hook))
}

async fn serve(cli: Cli, log_hook: LogLevelHook) -> Result<()> {
    tracing::info!("starting keeld");

    let shared_secret = match &cli.options.key_file {
        Some(path) => Some(keel_auth::load_secret(path)?),
        None => None,
    };

    let env = Arc::new(ClusterEnv::new(
        cli.options.clone(),
        cli.config_servers.clone(),
        shared_secret,
    ));
    let snapshots = Arc::new(SnapshotStore::open(cli.config_cache.clone()));
    let shards = Arc::new(ShardPool::new(Arc::clone(&env)));
    let topology = Arc::new(
        TopologyCache::new(
            &cli.config_servers,
            Arc::clone(&env),
            Arc::clone(&shards),
            Arc::clone(&snapshots),
        )
        .context("cannot set up the topology cache")?,
    );

    let rt = Arc::new(
        Runtime::new(env, Arc::clone(&topology), shards, Arc::clone(&snapshots))
            .with_log_hook(log_hook),
    );

    // A cached credentials listing makes auth usable before any fetch
    if let Some(auth) = snapshots.get(SNAPSHOT_AUTH) {
        tracing::info!("using credentials snapshot");
        rt.credentials.install(&auth);
    }

    tokio::spawn(Arc::clone(&topology).keep_updating());
    if rt.env.options.auth {
        tokio::spawn(keel_session::keep_credentials_updated(Arc::clone(&rt)));
    }

    let cancel = CancellationToken::new();
    let mut servers = Vec::new();
    for raw in &cli.listen {
        let addr = listen_addr(raw);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("cannot listen on {addr}"))?;
        let front = Listener::new(Arc::clone(&rt));
        let cancel = cancel.clone();
        servers.push(tokio::spawn(async move {
            front.run(listener, cancel).await;
        }));
    }

    tokio::signal::ctrl_c()
        .await
        .context("cannot wait for ctrl-c")?;
    tracing::info!("shutting down");
    cancel.cancel();
    for server in servers {
        let _ = server.await;
    }
    Ok(())
}

/// `[host:]port`: a bare port binds every interface
fn listen_addr(raw: &str) -> String {
    if raw.parse::<u16>().is_ok() {
        format!("0.0.0.0:{raw}")
    } else {
        raw.to_owned()
    }
}

fn init_logging(verbose: u8, logfile: Option<&std::path::Path>) -> Result<LogLevelHook> {
    let (filter, handle) = reload::Layer::new(filter_for(verbose as i64));

    let registry = tracing_subscriber::registry().with(filter);
    match logfile {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("cannot open log file {}", path.display()))?;
            registry
                .with(fmt::layer().with_ansi(false).with_writer(Arc::new(file)))
                .init();
        }
        None => {
            registry
                .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
                .init();
        }
    }

    Ok(Arc::new(move |level: i64| {
        let _ = handle.reload(filter_for(level));
    }))
}

fn filter_for(level: i64) -> EnvFilter {
    let directive = match level {
        i64::MIN..=0 => "info",
        1 => "debug",
        _ => "trace",
    };
    EnvFilter::try_new(directive).unwrap_or_else(|_| EnvFilter::new("info"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_port_binds_all_interfaces() {
        assert_eq!(listen_addr("4717"), "0.0.0.0:4717");
        assert_eq!(listen_addr("10.0.0.5:4717"), "10.0.0.5:4717");
        assert_eq!(listen_addr("localhost:4717"), "localhost:4717");
    }

    #[test]
    fn cli_parses_the_documented_surface() {
        let cli = Cli::parse_from([
            "keeld",
            "-c",
            "cfg1:4700,cfg2:4700",
            "-l",
            "4717",
            "-l",
            "127.0.0.1:4718",
            "-C",
            "/tmp/keel.snapshot",
            "-vv",
            "--read-timeout",
            "2s",
            "--read-retransmit",
            "50ms",
            "--max-repl-lag",
            "inf",
            "--local-threshold",
            "15ms",
            "--conn-pool-size",
            "8",
            "--read-only",
        ]);
        assert_eq!(cli.config_servers, "cfg1:4700,cfg2:4700");
        assert_eq!(cli.listen.len(), 2);
        assert_eq!(cli.verbose, 2);
        assert_eq!(
            cli.options.read_timeout,
            keel_config::Timeout::finite(std::time::Duration::from_secs(2))
        );
        assert_eq!(
            cli.options.read_retransmit,
            keel_config::Timeout::finite(std::time::Duration::from_millis(50))
        );
        assert_eq!(cli.options.max_repl_lag, keel_config::Timeout::INF);
        assert_eq!(cli.options.conn_pool_size, 8);
        assert!(cli.options.read_only);
    }

    #[test]
    fn bad_duration_is_a_parse_error() {
        let result = Cli::try_parse_from(["keeld", "-c", "cfg:4700", "-l", "4717", "--read-timeout", "5h"]);
        assert!(result.is_err());
    }
}
