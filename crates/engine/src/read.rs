//! The read path
//!
//! A query goes to one shard directly or to many through an ordered
//! merge. Every conversation with a backend runs through `talk`, which
//! hedges: when the first attempt has not answered within the retransmit
//! threshold, a second replica gets the same query, and whichever answers
//! first wins. The loser is aborted and its connection dropped, because
//! its on-wire state is undefined.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use keel_backend::{Backend, ClusterEnv, Connection, Shard};
use keel_config::Timeout;
use keel_doc::{Doc, Value};
use keel_protocol::{
    wire_get_more, wire_kill_cursors, ChunkVersion, Namespace, Query, QueryBuilder, Reply,
};
use keel_topology::VersionedShard;
use rand::Rng;
use tokio::task::JoinSet;

use crate::runtime::Runtime;
use crate::source::{cmp_order, DataSource, SourceKind};
use crate::{OpError, Result};

/// How long a cursor teardown may spend telling the backend
const KILL_CURSORS_TIMEOUT: Duration = Duration::from_millis(20);

const ALLOWED_QUERY_FLAGS: u32 =
    Query::SLAVE_OK | Query::EXHAUST | Query::NO_TIMEOUT | Query::PARTIAL;

/// Execute a client query, routing by its criteria.
///
/// Retries up to three times: stale config refreshes the topology first,
/// a lost primary just retries; anything else propagates.
pub async fn query(
    rt: &Runtime,
    q: &Query,
    privileges: &keel_auth::Privileges,
) -> Result<DataSource> {
    if q.flags & !ALLOWED_QUERY_FLAGS != 0 {
        return Err(OpError::bad_request("specified flags are not supported"));
    }
    if q.properties.contains("$explain") {
        return Err(OpError::bad_request("$explain is not supported"));
    }

    if q.ns.collection() == "system.users" {
        privileges.require(q.ns.db(), keel_auth::Privilege::UserAdmin)?;
    } else {
        privileges.require(q.ns.db(), keel_auth::Privilege::Read)?;
    }

    let mut last: Option<OpError> = None;
    for _attempt in 0..3 {
        let map = rt.topology.get()?;
        let shards = map.find(&q.ns, &q.criteria)?;

        let result = match shards.len() {
            0 => {
                tracing::debug!(ns = %q.ns, "query has no shards to run on");
                Ok(DataSource::null())
            }
            1 => {
                tracing::debug!(ns = %q.ns, "query goes to a single shard");
                let vs = shards.into_iter().next().unwrap();
                BackendSource::open(Arc::clone(&rt.env), vs.shard, vs.version, q.clone())
                    .await
                    .map(|src| DataSource::new(SourceKind::Backend(src)))
            }
            n => {
                tracing::debug!(ns = %q.ns, shards = n, "query fans out");
                MergeSource::open(Arc::clone(&rt.env), q.clone(), shards)
                    .await
                    .map(|src| DataSource::new(SourceKind::Merge(src)))
            }
        };

        match result {
            Ok(ds) => return Ok(ds),
            Err(e @ OpError::ShardConfigStale(_)) => {
                tracing::info!(error = %e, "updating shard config");
                last = Some(e);
                rt.topology.update().await?;
            }
            Err(e @ OpError::NotMaster) => {
                tracing::info!(error = %e, "re-executing query");
                last = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    Err(last.expect("retries imply a recorded error"))
}

/// `count` across the routed shards: sums the per-shard `n`
pub async fn count(
    rt: &Runtime,
    q: &Query,
    privileges: &keel_auth::Privileges,
) -> Result<Doc> {
    aggregation(rt, q, privileges, |rets, out| {
        let n: i64 = rets.iter().filter_map(|r| r.get_i64("n")).sum();
        out.push("n", n);
    })
    .await
}

/// `distinct` across the routed shards: merges and dedups the values
pub async fn distinct(
    rt: &Runtime,
    q: &Query,
    privileges: &keel_auth::Privileges,
) -> Result<Doc> {
    aggregation(rt, q, privileges, |rets, out| {
        let mut values: Vec<Value> = rets
            .iter()
            .filter_map(|r| r.get_array("values"))
            .flat_map(|vs| vs.iter().cloned())
            .collect();
        values.sort();
        values.dedup();
        out.push("values", values);
    })
    .await
}

/// Run a command-shaped query against every routed shard and merge the
/// per-shard replies
async fn aggregation(
    rt: &Runtime,
    q: &Query,
    privileges: &keel_auth::Privileges,
    merge: impl Fn(&[Doc], &mut Doc),
) -> Result<Doc> {
    privileges.require(q.ns.db(), keel_auth::Privilege::Read)?;

    // The command's first value names the collection; its `query` field
    // routes
    let coll = q
        .criteria
        .front()
        .and_then(|(_, v)| v.as_str())
        .ok_or_else(|| OpError::bad_request("command names no collection"))?;
    let target = Namespace::new(q.ns.db(), coll);
    let criteria = q.criteria.get_doc("query").cloned().unwrap_or_default();

    let mut last: Option<OpError> = None;
    for _attempt in 0..3 {
        let map = rt.topology.get()?;
        let shards = map.find(&target, &criteria)?;

        let result = aggregate_once(rt, q, shards, &merge).await;
        match result {
            Ok(doc) => return Ok(doc),
            Err(e @ OpError::ShardConfigStale(_)) => {
                tracing::info!(error = %e, "updating shard config");
                last = Some(e);
                rt.topology.update().await?;
            }
            Err(e @ OpError::NotMaster) => {
                tracing::info!(error = %e, "re-executing command");
                last = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    Err(last.expect("retries imply a recorded error"))
}

async fn aggregate_once(
    rt: &Runtime,
    q: &Query,
    shards: Vec<VersionedShard>,
    merge: &impl Fn(&[Doc], &mut Doc),
) -> Result<Doc> {
    let rets = match shards.len() {
        0 => Vec::new(),
        1 => {
            let vs = shards.into_iter().next().unwrap();
            vec![run_command(Arc::clone(&rt.env), vs, q.clone()).await?]
        }
        _ => {
            let mut set = JoinSet::new();
            for vs in shards {
                set.spawn(run_command(Arc::clone(&rt.env), vs, q.clone()));
            }
            let mut rets = Vec::new();
            while let Some(joined) = set.join_next().await {
                rets.push(joined.map_err(|e| OpError::internal(e.to_string()))??);
            }
            for ret in &rets {
                if !ret.is_ok() {
                    return Err(OpError::QueryFailure(
                        ret.get_str("errmsg").unwrap_or("unknown error").to_owned(),
                    ));
                }
            }
            rets
        }
    };

    let mut out = Doc::new();
    merge(&rets, &mut out);
    out.push("ok", 1);
    Ok(out)
}

/// One command against one shard through the regular read machinery
async fn run_command(env: Arc<ClusterEnv>, vs: VersionedShard, q: Query) -> Result<Doc> {
    let mut src = BackendSource::open(env, vs.shard, vs.version, q).await?;
    let ret = src
        .get()
        .cloned()
        .ok_or_else(|| OpError::internal("command returned no reply document"))?;
    src.close().await;
    Ok(ret)
}

/// What a fetch task hands back: the connection on success (so it can be
/// pooled again), the failing backend on error (so it can be marked)
type FetchOutcome = std::result::Result<(Connection, Reply), (OpError, Option<Arc<Backend>>)>;

async fn run_fetch(
    mut conn: Connection,
    backend: Option<Arc<Backend>>,
    ns: Option<Namespace>,
    version: ChunkVersion,
    msg: Bytes,
    req_id: u32,
) -> FetchOutcome {
    let attempt = async {
        let route = ns.as_ref().map(|ns| (ns, version));
        conn.establish(route, &msg).await?;
        conn.read_reply(req_id).await
    }
    .await;
    match attempt {
        Ok(reply) => Ok((conn, reply)),
        Err(e) => Err((e, backend)),
    }
}

/// One remote cursor on one shard
pub(crate) struct BackendSource {
    env: Arc<ClusterEnv>,
    shard: Arc<Shard>,
    version: ChunkVersion,
    query: Query,
    conn: Option<Connection>,
    cursor_id: u64,
    req_id: u32,
    /// Documents handed out so far; a restarted query skips this many
    consumed: u64,
    docs: VecDeque<Doc>,
}

enum TalkKind {
    InitialQuery,
    GetMore,
}

impl BackendSource {
    /// Pick a backend per the read preference and fetch the first batch
    pub(crate) async fn open(
        env: Arc<ClusterEnv>,
        shard: Arc<Shard>,
        version: ChunkVersion,
        query: Query,
    ) -> Result<Self> {
        let conn = shard
            .read_op(query.flags, query.read_preference(), None)
            .await
            .ok_or_else(|| {
                OpError::NoSuitableBackend(format!(
                    "no backend suitable for operation on shard {}",
                    shard.id()
                ))
            })?;

        let mut src = Self {
            env,
            shard,
            version,
            query,
            conn: Some(conn),
            cursor_id: 0,
            req_id: rand::thread_rng().gen(),
            consumed: 0,
            docs: VecDeque::new(),
        };
        tracing::debug!("requesting initial portion of data");
        src.talk(TalkKind::InitialQuery).await?;
        Ok(src)
    }

    pub(crate) fn at_end(&self) -> bool {
        self.cursor_id == 0 && self.docs.is_empty()
    }

    pub(crate) fn get(&self) -> Option<&Doc> {
        self.docs.front()
    }

    pub(crate) async fn advance(&mut self) -> Result<()> {
        self.consumed += 1;
        self.docs.pop_front();
        if self.docs.is_empty() && self.cursor_id != 0 {
            tracing::debug!("need to request more data");
            self.talk(TalkKind::GetMore).await?;
        }
        Ok(())
    }

    /// Kill the remote cursor politely, with a hard bound; a teardown
    /// that misbehaves costs the connection, not the caller's time
    pub(crate) async fn close(&mut self) {
        let Some(mut conn) = self.conn.take() else {
            return;
        };
        if self.cursor_id != 0 {
            let msg = wire_kill_cursors(&[self.cursor_id]);
            self.cursor_id = 0;
            match tokio::time::timeout(KILL_CURSORS_TIMEOUT, conn.send(&msg)).await {
                Ok(Ok(())) => conn.release(),
                _ => tracing::debug!("cannot send kill-cursors; dropping connection"),
            }
        } else {
            conn.release();
        }
    }

    pub(crate) fn used_endpoints(&self) -> Vec<Doc> {
        match &self.conn {
            Some(conn) => vec![keel_doc::doc! {
                "shard" => self.shard.id(),
                "backend" => conn.backend_addr(),
                "endpoint" => conn.endpoint().addr().to_string(),
            }],
            None => Vec::new(),
        }
    }

    fn next_req_id(&mut self) -> u32 {
        self.req_id = self.req_id.wrapping_add(1);
        self.req_id
    }

    /// Namespace for the version handshake; commands handshake for the
    /// collection they operate on
    fn effective_ns(&self) -> Namespace {
        if self.query.ns.is_command() {
            if let Some((_, v)) = self.query.query.front() {
                if let Some(coll) = v.as_str() {
                    return Namespace::new(self.query.ns.db(), coll);
                }
            }
        }
        self.query.ns.clone()
    }

    fn make_query(&self, req_id: u32) -> Bytes {
        let mut b = QueryBuilder::new(self.query.ns.clone(), self.query.query.clone())
            .msg_id(req_id)
            .skip(self.consumed as i32)
            .batch_size(if self.query.n_to_return == 1 { 1 } else { 0 })
            .field_selector(self.query.field_selector.clone());
        if self.query.wants_secondary() {
            b = b.slave_ok();
        }
        b.build()
    }

    /// The hedged conversation. `GetMore` continues the existing cursor
    /// on the held connection; a retransmit always restarts the query at
    /// the current position on a different backend, because the cursor
    /// does not travel.
    async fn talk(&mut self, kind: TalkKind) -> Result<()> {
        let started = Instant::now();
        let opts = &self.env.options;
        let pref = self.query.read_preference().cloned();

        let retransmit = pref
            .as_ref()
            .and_then(|p| p.get_i64("retransmitMs"))
            .map(|ms| Timeout::finite(Duration::from_millis(ms.max(0) as u64)))
            .unwrap_or(opts.read_retransmit);
        let timeout = pref
            .as_ref()
            .and_then(|p| p.get_i64("timeoutMs"))
            .map(|ms| Timeout::finite(Duration::from_millis(ms.max(0) as u64)))
            .unwrap_or(opts.read_timeout);

        let req_id = self.next_req_id();
        let msg = match kind {
            TalkKind::InitialQuery => self.make_query(req_id),
            TalkKind::GetMore => wire_get_more(req_id, &self.query.ns, self.cursor_id),
        };

        let conn = self
            .conn
            .take()
            .ok_or_else(|| OpError::internal("datasource has no connection"))?;
        let first_backend = conn.endpoint().backend();
        let route_ns = Some(self.effective_ns());

        let mut set: JoinSet<FetchOutcome> = JoinSet::new();
        set.spawn(run_fetch(
            conn,
            first_backend.clone(),
            route_ns.clone(),
            self.version,
            msg,
            req_id,
        ));

        let mut recorded: Option<OpError> = None;

        // Phase one: give the first attempt the retransmit window
        let hedge = retransmit.min(timeout);
        let phase1 = match hedge.get() {
            Some(d) => tokio::time::timeout(d, set.join_next()).await,
            None => Ok(set.join_next().await),
        };
        match phase1 {
            Ok(Some(outcome)) => {
                match flatten(outcome) {
                    Ok((conn, reply)) => {
                        self.install(conn, reply);
                        tracing::debug!(
                            took_ms = started.elapsed().as_millis() as u64,
                            "query done"
                        );
                        return Ok(());
                    }
                    Err((e, failed)) => {
                        if matches!(e, OpError::NotMaster) {
                            // Fall through to the retransmit; the shard
                            // re-pings meanwhile
                            self.shard.lost_master();
                            recorded = Some(e);
                        } else if e.is_backend_client_error() {
                            return Err(e);
                        } else {
                            if let Some(b) = &failed {
                                self.shard.failed(b);
                            }
                            recorded = Some(e);
                        }
                    }
                }
            }
            Ok(None) => return Err(OpError::internal("fetch task vanished")),
            Err(_elapsed) => {} // first attempt still running; hedge below
        }

        // Phase two: hedge onto a different backend, race both until the
        // overall deadline
        if retransmit.is_finite() {
            if let Some(conn2) = self
                .shard
                .read_op(self.query.flags, pref.as_ref(), first_backend.as_ref())
                .await
            {
                tracing::debug!(endpoint = %conn2.endpoint().addr(), "retransmitting query");
                let backend2 = conn2.endpoint().backend();
                let msg2 = self.make_query(req_id);
                set.spawn(run_fetch(
                    conn2,
                    backend2,
                    route_ns.clone(),
                    self.version,
                    msg2,
                    req_id,
                ));
            }
        }

        if set.is_empty() {
            return Err(recorded.unwrap_or_else(|| {
                OpError::Timeout(format!(
                    "timeout while talking to shard {}",
                    self.shard.connection_string()
                ))
            }));
        }

        loop {
            let remaining = match timeout.get() {
                Some(d) => {
                    let rest = d.saturating_sub(started.elapsed());
                    if rest.is_zero() {
                        break;
                    }
                    Some(rest)
                }
                None => None,
            };

            let joined = match remaining {
                Some(rest) => match tokio::time::timeout(rest, set.join_next()).await {
                    Ok(j) => j,
                    Err(_elapsed) => break,
                },
                None => set.join_next().await,
            };

            let Some(outcome) = joined else { break };
            match flatten(outcome) {
                Ok((conn, reply)) => {
                    // The loser is aborted with the set; its connection
                    // drops rather than returning to a pool
                    self.install(conn, reply);
                    tracing::debug!(
                        took_ms = started.elapsed().as_millis() as u64,
                        "query done"
                    );
                    return Ok(());
                }
                Err((e, failed)) => {
                    if let OpError::NotMaster = &e {
                        self.shard.lost_master();
                        return Err(e);
                    }
                    if e.is_backend_client_error() {
                        return Err(e);
                    }
                    if let Some(b) = &failed {
                        self.shard.failed(b);
                    }
                    recorded.get_or_insert(e);
                    if set.is_empty() {
                        break;
                    }
                }
            }
        }

        Err(recorded.unwrap_or_else(|| {
            OpError::Timeout(format!(
                "timeout while talking to shard {}",
                self.shard.connection_string()
            ))
        }))
    }

    fn install(&mut self, conn: Connection, reply: Reply) {
        tracing::debug!(
            count = reply.documents.len(),
            cursor = reply.cursor_id,
            "received batch"
        );
        self.conn = Some(conn);
        self.cursor_id = reply.cursor_id;
        self.docs = reply.documents.into();
    }
}

fn flatten(
    outcome: std::result::Result<FetchOutcome, tokio::task::JoinError>,
) -> std::result::Result<(Connection, Reply), (OpError, Option<Arc<Backend>>)> {
    match outcome {
        Ok(inner) => inner,
        Err(join) => Err((OpError::internal(format!("fetch task died: {join}")), None)),
    }
}

/// Ordered merge across several shards' cursors
pub(crate) struct MergeSource {
    order_by: Doc,
    partial: bool,
    sources: Vec<BackendSource>,
    /// Index of the source currently holding the smallest document
    current: usize,
}

impl MergeSource {
    pub(crate) async fn open(
        env: Arc<ClusterEnv>,
        query: Query,
        shards: Vec<VersionedShard>,
    ) -> Result<Self> {
        let order_by = query.order_by().cloned().unwrap_or_default();
        let partial = query.flags & Query::PARTIAL != 0;

        let mut set = JoinSet::new();
        for vs in shards {
            set.spawn(BackendSource::open(
                Arc::clone(&env),
                vs.shard,
                vs.version,
                query.clone(),
            ));
        }

        let mut sources = Vec::new();
        let mut fatal: Option<OpError> = None;
        while let Some(joined) = set.join_next().await {
            let opened = joined.map_err(|e| OpError::internal(e.to_string()))?;
            match opened {
                Ok(mut src) => {
                    if src.at_end() {
                        src.close().await;
                    } else {
                        sources.push(src);
                    }
                }
                Err(e) if partial && is_partial_shieldable(&e) => {
                    tracing::debug!(error = %e, "dropping branch under partial flag");
                }
                Err(e) => {
                    if fatal.is_none() {
                        fatal = Some(e);
                    }
                }
            }
        }
        if let Some(e) = fatal {
            for mut src in sources {
                src.close().await;
            }
            return Err(e);
        }

        let mut merge = Self {
            order_by,
            partial,
            sources,
            current: 0,
        };
        merge.pick_current();
        Ok(merge)
    }

    pub(crate) fn at_end(&self) -> bool {
        self.sources.is_empty()
    }

    pub(crate) fn get(&self) -> Option<&Doc> {
        self.sources.get(self.current).and_then(BackendSource::get)
    }

    pub(crate) async fn advance(&mut self) -> Result<()> {
        if self.sources.is_empty() {
            return Ok(());
        }

        match self.sources[self.current].advance().await {
            Ok(()) => {
                if self.sources[self.current].at_end() {
                    let mut done = self.sources.swap_remove(self.current);
                    done.close().await;
                }
            }
            Err(e) if self.partial && is_partial_shieldable(&e) => {
                tracing::debug!(error = %e, "dropping failed branch under partial flag");
                self.sources.swap_remove(self.current);
            }
            Err(e) => return Err(e),
        }

        self.pick_current();
        Ok(())
    }

    pub(crate) async fn close(&mut self) {
        for src in &mut self.sources {
            src.close().await;
        }
        self.sources.clear();
    }

    pub(crate) fn used_endpoints(&self) -> Vec<Doc> {
        self.sources
            .iter()
            .flat_map(BackendSource::used_endpoints)
            .collect()
    }

    fn pick_current(&mut self) {
        let mut best = 0;
        for i in 1..self.sources.len() {
            let (Some(a), Some(b)) = (self.sources[i].get(), self.sources[best].get()) else {
                continue;
            };
            if cmp_order(a, b, &self.order_by).is_lt() {
                best = i;
            }
        }
        self.current = best;
    }
}

/// The `partial` flag shields transport and protocol trouble on one
/// branch; classified backend errors still surface
fn is_partial_shieldable(e: &OpError) -> bool {
    matches!(
        e,
        OpError::Io(_) | OpError::Protocol(_) | OpError::Internal(_) | OpError::Timeout(_)
    )
}
