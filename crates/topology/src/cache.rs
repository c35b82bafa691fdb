//! The topology cache and its refresh loop
//!
//! Holds the current `TopologyMap` snapshot, fetches fresh ones from the
//! config servers (racing a second server when the first is slow), and
//! keeps refreshing in the background. On startup a cached snapshot file
//! stands in until the config servers answer.

use std::sync::Arc;
use std::time::Instant;

use keel_backend::{Backend, ClusterEnv, Connection, OpError, Result, Shard, ShardPool};
use keel_doc::{doc, Doc, Value};
use keel_protocol::{wire_get_more, Namespace, QueryBuilder};
use parking_lot::Mutex;
use tokio::task::JoinSet;

use crate::map::TopologyMap;
use crate::snapshot::SnapshotStore;
use crate::SNAPSHOT_TOPOLOGY;

/// Holder of the current cluster map
pub struct TopologyCache {
    connstr: String,
    env: Arc<ClusterEnv>,
    pool: Arc<ShardPool>,
    store: Arc<SnapshotStore>,
    /// Config servers, probed like any backend so fetches pick the
    /// nearest one
    servers: Vec<Arc<Backend>>,
    config_shard: Arc<Shard>,
    current: Mutex<Option<Arc<TopologyMap>>>,
}

impl TopologyCache {
    /// Build the cache and adopt the snapshot file if one is usable
    pub fn new(
        connstr: &str,
        env: Arc<ClusterEnv>,
        pool: Arc<ShardPool>,
        store: Arc<SnapshotStore>,
    ) -> Result<Self> {
        if connstr.is_empty() {
            return Err(OpError::bad_request(
                "connection string for config servers cannot be empty",
            ));
        }

        let mut servers = Vec::new();
        for addr in connstr.split(',') {
            servers.push(Backend::standalone(Arc::clone(&env), addr)?);
        }
        let config_shard = pool.get("config", connstr)?;

        let cache = Self {
            connstr: connstr.to_owned(),
            env,
            pool,
            store,
            servers,
            config_shard,
            current: Mutex::new(None),
        };

        if let Some(raw) = cache.store.get(SNAPSHOT_TOPOLOGY) {
            tracing::info!("using shard config snapshot");
            match TopologyMap::parse(Arc::clone(&cache.config_shard), raw, &cache.pool) {
                Ok(map) => *cache.current.lock() = Some(Arc::new(map)),
                Err(e) => tracing::info!(error = %e, "cannot use shard config snapshot"),
            }
        }

        Ok(cache)
    }

    #[inline]
    pub fn connection_string(&self) -> &str {
        &self.connstr
    }

    #[inline]
    pub fn config_shard(&self) -> &Arc<Shard> {
        &self.config_shard
    }

    pub fn exists(&self) -> bool {
        self.current.lock().is_some()
    }

    /// The current snapshot, or `NoShardConfig` when none was ever
    /// fetched and no snapshot file existed
    pub fn get(&self) -> Result<Arc<TopologyMap>> {
        self.current.lock().clone().ok_or(OpError::NoShardConfig)
    }

    /// Fetch a fresh map and swap it in when materially different
    pub async fn update(&self) -> Result<()> {
        tracing::debug!("fetching shard config");
        let raw = self.fetch_config().await?;

        let unchanged = self
            .current
            .lock()
            .as_ref()
            .is_some_and(|m| *m.raw() == raw);
        if unchanged {
            tracing::debug!("shard config unchanged");
            return Ok(());
        }

        let map = TopologyMap::parse(Arc::clone(&self.config_shard), raw.clone(), &self.pool)?;
        tracing::info!("shard config changed");
        *self.current.lock() = Some(Arc::new(map));
        self.store.put(SNAPSHOT_TOPOLOGY, raw);
        Ok(())
    }

    /// Refresh forever, every `conf_interval`, swallowing failures
    pub async fn keep_updating(self: Arc<Self>) {
        loop {
            if let Err(e) = self.update().await {
                tracing::warn!(error = %e, "cannot update shard config");
            }
            tokio::time::sleep(self.env.options.conf_interval).await;
        }
    }

    /// Fetch the four config tables through the nearest config server,
    /// racing a second one when the first has not answered within the
    /// retransmit threshold. First success wins; the loser is dropped.
    async fn fetch_config(&self) -> Result<Doc> {
        let opts = &self.env.options;
        let deadline = Instant::now() + opts.conf_timeout;

        // Order servers by roundtrip so the race starts at the nearest
        let mut order: Vec<Arc<Backend>> = self.servers.clone();
        order.sort_by_key(|b| b.roundtrip().unwrap_or(std::time::Duration::MAX));
        let mut remaining = order.into_iter();

        let mut set: JoinSet<Result<Doc>> = JoinSet::new();
        let first = remaining.next().expect("at least one config server");
        tracing::debug!(server = %first.addr(), "using config server");
        set.spawn(fetch_from(first));

        let hedge_wait = opts.conf_retransmit.min(opts.conf_timeout);
        match tokio::time::timeout(hedge_wait, set.join_next()).await {
            Ok(Some(Ok(Ok(raw)))) => return Ok(raw),
            Ok(_) => {} // fetch failed; hedge below
            Err(_) => {} // still running; hedge below
        }

        if let Some(second) = remaining.next() {
            tracing::debug!(server = %second.addr(), "retransmitting config request");
            set.spawn(fetch_from(second));
        }

        let rest = deadline.saturating_duration_since(Instant::now());
        let winner = tokio::time::timeout(rest, async {
            while let Some(joined) = set.join_next().await {
                match joined {
                    Ok(Ok(raw)) => return Some(raw),
                    Ok(Err(e)) => tracing::debug!(error = %e, "config fetch failed"),
                    Err(e) => tracing::debug!(error = %e, "config fetch task died"),
                }
            }
            None
        })
        .await;

        match winner {
            Ok(Some(raw)) => Ok(raw),
            _ => Err(OpError::internal("cannot communicate with config servers")),
        }
    }
}

/// Pull all four tables over one connection
async fn fetch_from(server: Arc<Backend>) -> Result<Doc> {
    let endpoint = server.endpoint();
    let mut conn = endpoint.get_any();

    // The leading ping both opens the connection and proves the server
    // responsive before the table scans start
    let ping = QueryBuilder::new(Namespace::new("local", "$cmd"), doc! { "ping" => 1 })
        .batch_size(1)
        .build();
    conn.establish(None, &ping).await?;
    conn.read_reply(0).await?;

    let shards = read_table(&mut conn, Namespace::new("config", "shards"), None).await?;
    let databases = read_table(&mut conn, Namespace::new("config", "databases"), None).await?;
    let collections = read_table(
        &mut conn,
        Namespace::new("config", "collections"),
        Some(doc! { "dropped" => false }),
    )
    .await?;
    let chunks = read_table(&mut conn, Namespace::new("config", "chunks"), None).await?;

    conn.release();
    tracing::debug!("fetching config complete");

    Ok(doc! {
        "shards" => shards,
        "databases" => databases,
        "collections" => collections,
        "chunks" => chunks,
    })
}

/// Drain one table through its cursor
async fn read_table(
    conn: &mut Connection,
    ns: Namespace,
    condition: Option<Doc>,
) -> Result<Vec<Value>> {
    tracing::debug!(table = %ns, "fetching table");

    let query = doc! {
        "query" => condition.unwrap_or_default(),
        "$orderby" => doc! { "_id" => 1 },
    };
    let msg = QueryBuilder::new(ns.clone(), query).build();
    conn.send(&msg).await?;

    let mut rows = Vec::new();
    let mut reply = conn.read_reply(0).await?;
    loop {
        rows.extend(reply.documents.drain(..).map(Value::Doc));
        if reply.cursor_id == 0 {
            break;
        }
        conn.send(&wire_get_more(0, &ns, reply.cursor_id)).await?;
        reply = conn.read_reply(0).await?;
    }
    Ok(rows)
}
