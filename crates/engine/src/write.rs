//! Write operations
//!
//! Every write is a tree: backend writes at the leaves (legacy wire form
//! or command form by backend capability), composed under `Parallel` and
//! `Sequential` nodes by the planner. The uniform lifecycle is *perform*
//! (issue, bounded by the write deadlines), *acknowledge* (get the
//! acknowledgement for a write concern, cached per concern), *finish*
//! (release connections; idempotent).

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use keel_auth::{Privilege, Privileges};
use keel_backend::{ClusterEnv, Connection, Shard};
use keel_doc::{doc, Doc, Value};
use keel_protocol::{ChunkVersion, Delete, Insert, Namespace, QueryBuilder, Update};
use keel_topology::{Database, TopologyMap};

use crate::plan;
use crate::runtime::Runtime;
use crate::{OpError, Result};

/// Backoff when the shard has no primary, and between not-master retries
const NO_PRIMARY_PAUSE: Duration = Duration::from_millis(500);

/// The error code a backend's write ack carries for "not master"
const ACK_CODE_NOT_MASTER: i64 = 10058;

type BoxedFut<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// When a sequential write stops early
pub(crate) enum StopRule {
    /// Limit-1 semantics: the first shard that changed anything ends the
    /// walk
    NonZeroN,
    /// findAndModify: the first shard that returned a document
    NonNullValue,
}

impl StopRule {
    pub(crate) fn stops(&self, ack: &Doc) -> bool {
        match self {
            StopRule::NonZeroN => ack.get_i64("n").unwrap_or(0) != 0,
            StopRule::NonNullValue => ack.get("value").is_some_and(|v| !v.is_null()),
        }
    }
}

/// How a composite merges its children's acknowledgements
pub(crate) enum MergeRule {
    Default,
    /// findAndModify across shards: the last ack wins, and every earlier
    /// one must have been a miss
    LastValue,
}

impl MergeRule {
    pub(crate) fn apply(&self, acks: &[Doc]) -> Result<Doc> {
        match self {
            MergeRule::Default => Ok(default_ack_merge(acks)),
            MergeRule::LastValue => {
                let misses = &acks[..acks.len().saturating_sub(1)];
                if misses
                    .iter()
                    .any(|a| a.get("value").is_some_and(|v| !v.is_null()))
                {
                    return Err(OpError::internal(
                        "non-final findAndModify ack carries a value",
                    ));
                }
                Ok(acks
                    .last()
                    .cloned()
                    .unwrap_or_else(|| doc! { "value" => Value::Null, "ok" => 1 }))
            }
        }
    }
}

struct LastAck {
    concern: Doc,
    status: Doc,
}

/// What a backend write sends
#[derive(Clone)]
pub(crate) enum Payload {
    /// Legacy wire message; acknowledged through getLastError
    Legacy(Bytes),
    /// Command form; the reply is the acknowledgement
    Command(Doc),
    /// findAndModify command; the reply is the result document
    FindAndModify(Doc),
}

/// One write against one shard's primary
pub struct BackendWrite {
    env: Arc<ClusterEnv>,
    pub(crate) shard: Arc<Shard>,
    pub(crate) version: ChunkVersion,
    ns: Namespace,
    pub(crate) payload: Payload,
    conn: Option<Connection>,
    last: Option<LastAck>,
}

impl BackendWrite {
    pub(crate) fn new(
        env: Arc<ClusterEnv>,
        shard: Arc<Shard>,
        version: ChunkVersion,
        ns: Namespace,
        payload: Payload,
    ) -> Self {
        Self {
            env,
            shard,
            version,
            ns,
            payload,
            conn: None,
            last: None,
        }
    }

    /// The retry harness: acquire a primary (pausing when there is
    /// none), issue the write bounded by the retransmit threshold, react
    /// to timeouts and not-master acks, all under the overall write
    /// deadline.
    async fn perform(&mut self) -> Result<()> {
        let opts = &self.env.options;
        let deadline = opts.write_timeout.get().map(|d| Instant::now() + d);

        let mut attempt = 0usize;
        loop {
            if deadline.is_some_and(|dl| Instant::now() >= dl) {
                break;
            }

            let Some(conn) = self.shard.primary().await else {
                tokio::time::sleep(NO_PRIMARY_PAUSE).await;
                continue;
            };
            let backend = conn.endpoint().backend();

            let mut task = tokio::spawn(do_perform(
                conn,
                self.ns.clone(),
                self.version,
                self.payload.clone(),
            ));

            let wait = opts.write_retransmit.min(opts.write_timeout);
            let joined = match wait.get() {
                Some(d) => tokio::time::timeout(d, &mut task).await.ok(),
                None => Some((&mut task).await),
            };

            match joined {
                Some(join_result) => {
                    let (conn, concern, status) = join_result
                        .map_err(|e| OpError::internal(format!("write task died: {e}")))??;

                    let retry_not_master = status.get("err").is_some_and(|e| !e.is_null())
                        && status.get_i64("code") == Some(ACK_CODE_NOT_MASTER);

                    self.conn = Some(conn);
                    self.last = Some(LastAck { concern, status });

                    if !retry_not_master {
                        return Ok(());
                    }
                    self.shard.lost_master();
                    if attempt != 0 {
                        tokio::time::sleep(NO_PRIMARY_PAUSE).await;
                    }
                }
                None => {
                    // Timed out mid-write: the abandoned connection's
                    // state is undefined, so it goes down with the task
                    tracing::warn!(
                        backend = %backend.as_ref().map(|b| b.addr().to_owned()).unwrap_or_default(),
                        "timeout while writing"
                    );
                    task.abort();
                    let _ = task.await;
                    if let Some(b) = &backend {
                        self.shard.failed(b);
                    }
                }
            }
            attempt += 1;
        }

        Err(OpError::NoSuitableBackend(format!(
            "cannot communicate with primary for shard {}",
            self.shard.connection_string()
        )))
    }

    async fn acknowledge(&mut self, concern: &Doc) -> Result<Doc> {
        let refresh = concern.contains("wtimeout")
            || self
                .last
                .as_ref()
                .map_or(true, |l| !write_concerns_equal(concern, &l.concern));
        if refresh {
            let status = self.do_acknowledge(concern).await?;
            self.last = Some(LastAck {
                concern: concern.clone(),
                status,
            });
        }
        Ok(self.last.as_ref().expect("ack just set").status.clone())
    }

    async fn do_acknowledge(&mut self, concern: &Doc) -> Result<Doc> {
        match &self.payload {
            Payload::Legacy(_) => {
                let conn = self
                    .conn
                    .as_mut()
                    .ok_or_else(|| OpError::internal("acknowledge before perform"))?;
                validate_ack(conn.acknowledge(self.ns.db(), concern).await?)
            }
            Payload::Command(_) => Err(OpError::bad_request(
                "cannot issue getLastError after a write command",
            )),
            Payload::FindAndModify(_) => Err(OpError::bad_request(
                "cannot issue getLastError after findAndModify",
            )),
        }
    }

    fn last_status(&self) -> Doc {
        self.last
            .as_ref()
            .map(|l| l.status.clone())
            .unwrap_or_default()
    }

    fn finish(&mut self) {
        if let Some(conn) = self.conn.take() {
            conn.release();
        }
    }
}

/// One attempt on one connection; returns the connection for reuse
async fn do_perform(
    mut conn: Connection,
    ns: Namespace,
    version: ChunkVersion,
    payload: Payload,
) -> Result<(Connection, Doc, Doc)> {
    match payload {
        Payload::Legacy(msg) => {
            tracing::debug!(backend = %conn.backend_addr(), "issuing legacy write");
            conn.establish(Some((&ns, version)), &msg).await?;
            let concern = doc! { "getLastError" => 1 };
            let status = validate_ack(conn.acknowledge(ns.db(), &concern).await?)?;
            Ok((conn, concern, status))
        }
        Payload::Command(cmd) => {
            tracing::debug!(backend = %conn.backend_addr(), "issuing write command");
            let concern = cmd
                .get_doc("writeConcern")
                .cloned()
                .unwrap_or_else(|| doc! { "w" => 1 });
            let msg = QueryBuilder::new(ns.cmd(), cmd).build();
            conn.establish(Some((&ns, version)), &msg).await?;
            let status = validate_ack(conn.read_reply_doc(0).await?)?;
            Ok((conn, concern, status))
        }
        Payload::FindAndModify(cmd) => {
            tracing::debug!(backend = %conn.backend_addr(), "issuing findAndModify");
            let msg = QueryBuilder::new(ns.cmd(), cmd).build();
            conn.establish(Some((&ns, version)), &msg).await?;
            let status = conn.read_reply_doc(0).await?;
            Ok((conn, Doc::new(), status))
        }
    }
}

/// A composite of writes, parallel or sequential
pub struct MultiWrite {
    pub(crate) ops: Vec<WriteOp>,
    /// How many children have been commenced; only those acknowledge and
    /// finish
    commenced: usize,
    write_concern: Doc,
    pub(crate) stop: Option<StopRule>,
    merge: MergeRule,
    last: Option<LastAck>,
}

impl MultiWrite {
    pub(crate) fn new(write_concern: Doc, stop: Option<StopRule>, merge: MergeRule) -> Self {
        let write_concern = if write_concern.is_empty() {
            doc! { "getLastError" => 1 }
        } else {
            write_concern
        };
        Self {
            ops: Vec::new(),
            commenced: 0,
            write_concern,
            stop,
            merge,
            last: None,
        }
    }

    pub(crate) fn add(&mut self, op: WriteOp) {
        self.ops.push(op);
    }

    async fn perform_parallel(&mut self) -> Result<()> {
        self.commenced = self.ops.len();

        let ops = std::mem::take(&mut self.ops);
        let mut set = tokio::task::JoinSet::new();
        for (idx, mut op) in ops.into_iter().enumerate() {
            set.spawn(async move {
                let result = op.perform().await;
                (idx, op, result)
            });
        }

        let mut slots: Vec<Option<WriteOp>> = Vec::new();
        let mut first_err: Option<OpError> = None;
        while let Some(joined) = set.join_next().await {
            let (idx, op, result) = joined.map_err(|e| OpError::internal(e.to_string()))?;
            if slots.len() <= idx {
                slots.resize_with(idx + 1, || None);
            }
            slots[idx] = Some(op);
            if let Err(e) = result {
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }
        self.ops = slots.into_iter().flatten().collect();

        if let Some(e) = first_err {
            return Err(e);
        }

        let acks: Vec<Doc> = self.ops.iter().map(WriteOp::last_status).collect();
        let status = self.merge.apply(&acks)?;
        self.last = Some(LastAck {
            concern: self.write_concern.clone(),
            status,
        });
        Ok(())
    }

    async fn perform_sequential(&mut self) -> Result<()> {
        let mut acks = Vec::new();
        for i in 0..self.ops.len() {
            self.commenced = i + 1;
            self.ops[i].perform().await?;
            let ack = self.ops[i].last_status();
            let failed = ack.get("err").is_some_and(|e| !e.is_null());
            let stop = self.stop.as_ref().is_some_and(|s| s.stops(&ack));
            acks.push(ack);
            if failed || stop {
                break;
            }
        }

        let status = self.merge.apply(&acks)?;
        self.last = Some(LastAck {
            concern: self.write_concern.clone(),
            status,
        });
        Ok(())
    }

    async fn acknowledge(&mut self, concern: &Doc) -> Result<Doc> {
        let refresh = concern.contains("wtimeout")
            || self
                .last
                .as_ref()
                .map_or(true, |l| !write_concerns_equal(concern, &l.concern));
        if refresh {
            let mut acks = Vec::with_capacity(self.commenced);
            for op in &mut self.ops[..self.commenced] {
                acks.push(op.acknowledge(concern).await?);
            }
            let status = self.merge.apply(&acks)?;
            self.last = Some(LastAck {
                concern: concern.clone(),
                status,
            });
        }
        Ok(self.last.as_ref().expect("ack just set").status.clone())
    }

    fn last_status(&self) -> Doc {
        self.last
            .as_ref()
            .map(|l| l.status.clone())
            .unwrap_or_default()
    }

    fn is_acknowledgable(&self) -> bool {
        self.ops.iter().all(WriteOp::is_acknowledgable)
    }
}

/// A planned write operation of any shape
pub enum WriteOp {
    /// A write that already failed at planning or dispatch; its ack is
    /// the error document
    Failed(Doc),
    /// A no-op with a fixed acknowledgement (null routes)
    Null(Doc),
    Backend(Box<BackendWrite>),
    Parallel(MultiWrite),
    Sequential(MultiWrite),
}

impl WriteOp {
    /// Wrap an error so a later getLastError can report it
    pub fn failed(errmsg: impl Into<String>) -> Self {
        let errmsg = errmsg.into();
        WriteOp::Failed(doc! {
            "errmsg" => errmsg.as_str(),
            "err" => errmsg.as_str(),
            "ok" => 0,
        })
    }

    pub(crate) fn null(ack: Doc) -> Self {
        WriteOp::Null(ack)
    }

    /// Issue the write. Boxed because composites recurse.
    pub fn perform(&mut self) -> BoxedFut<'_, Result<()>> {
        Box::pin(async move {
            match self {
                WriteOp::Failed(_) | WriteOp::Null(_) => Ok(()),
                WriteOp::Backend(b) => b.perform().await,
                WriteOp::Parallel(m) => m.perform_parallel().await,
                WriteOp::Sequential(m) => m.perform_sequential().await,
            }
        })
    }

    /// The acknowledgement for `concern`. The first call with a given
    /// concern talks to the backends; repeats return the cached document
    /// (any `wtimeout` disables the cache).
    pub fn acknowledge<'a>(&'a mut self, concern: &'a Doc) -> BoxedFut<'a, Result<Doc>> {
        Box::pin(async move {
            match self {
                WriteOp::Failed(err) => Ok(err.clone()),
                WriteOp::Null(ack) => Ok(ack.clone()),
                WriteOp::Backend(b) => b.acknowledge(concern).await,
                WriteOp::Parallel(m) | WriteOp::Sequential(m) => m.acknowledge(concern).await,
            }
        })
    }

    /// Acknowledgement of the last perform/acknowledge, for logging and
    /// the command forms
    pub fn last_status(&self) -> Doc {
        match self {
            WriteOp::Failed(err) => err.clone(),
            WriteOp::Null(ack) => ack.clone(),
            WriteOp::Backend(b) => b.last_status(),
            WriteOp::Parallel(m) | WriteOp::Sequential(m) => m.last_status(),
        }
    }

    /// Whether a later getLastError can still be served
    pub fn is_acknowledgable(&self) -> bool {
        match self {
            WriteOp::Failed(_) | WriteOp::Null(_) => true,
            WriteOp::Backend(b) => matches!(b.payload, Payload::Legacy(_)),
            WriteOp::Parallel(m) | WriteOp::Sequential(m) => m.is_acknowledgable(),
        }
    }

    /// Release held connections. Idempotent.
    pub fn finish(&mut self) {
        match self {
            WriteOp::Failed(_) | WriteOp::Null(_) => {}
            WriteOp::Backend(b) => b.finish(),
            WriteOp::Parallel(m) | WriteOp::Sequential(m) => {
                for op in &mut m.ops[..m.commenced] {
                    op.finish();
                }
            }
        }
    }
}

/// A backend ack must at least carry `ok` and `n`
fn validate_ack(ack: Doc) -> Result<Doc> {
    if !ack.contains("ok") || !ack.contains("n") {
        return Err(OpError::internal("bad write operation status"));
    }
    Ok(ack)
}

/// Compare two write concerns for the acknowledgement cache:
/// `getLastError` never matters, a missing `w` equals `w: 1`, any
/// `wtimeout` forces a refresh, every other key must match.
pub(crate) fn write_concerns_equal(w1: &Doc, w2: &Doc) -> bool {
    use std::collections::HashMap;

    let mut seen: HashMap<String, &Value> = HashMap::new();
    let mut c1: Option<&Value> = None;
    let mut c2: Option<&Value> = None;

    for (name, value) in w1.iter() {
        match name.to_lowercase().as_str() {
            "getlasterror" => {}
            "w" => c1 = Some(value),
            "wtimeout" => return false,
            other => {
                seen.insert(other.to_owned(), value);
            }
        }
    }
    for (name, value) in w2.iter() {
        match name.to_lowercase().as_str() {
            "getlasterror" => {}
            "w" => c2 = Some(value),
            "wtimeout" => return false,
            other => match seen.remove(other) {
                Some(prev) if prev == value => {}
                _ => return false,
            },
        }
    }
    if !seen.is_empty() {
        return false;
    }

    match (c1, c2) {
        (Some(Value::String(a)), Some(Value::String(b))) => a == b,
        (a, b) => {
            let as_int = |v: Option<&Value>| match v {
                None => Some(1),
                Some(v) => v.as_i64(),
            };
            matches!((as_int(a), as_int(b)), (Some(x), Some(y)) if x == y)
        }
    }
}

/// Merge N sub-acknowledgements into one
pub(crate) fn default_ack_merge(acks: &[Doc]) -> Doc {
    if acks.is_empty() {
        return Doc::new();
    }
    if acks.len() == 1 {
        return acks[0].clone();
    }

    let mut err: Option<&Value> = None;
    let mut code: Option<&Value> = None;
    let mut n: i64 = 0;
    let mut has_updated_existing = false;
    let mut updated_existing = false;
    let mut upserted: Option<&Value> = None;
    let mut wtimeout = false;
    let mut waited: i64 = 0;
    let mut wtime: i64 = 0;

    for ack in acks {
        for (name, value) in ack.iter() {
            match name {
                "err" if err.map_or(true, |e| e.is_null()) => err = Some(value),
                "code" if code.is_none() => code = Some(value),
                "n" => n += value.as_i64().unwrap_or(0),
                "updatedExisting" => {
                    has_updated_existing = true;
                    updated_existing |= value.as_bool().unwrap_or(false);
                }
                "upserted" if upserted.is_none() => upserted = Some(value),
                "wtimeout" => wtimeout |= value.as_bool().unwrap_or(false),
                "waited" => waited = waited.max(value.as_i64().unwrap_or(0)),
                "wtime" => wtime = wtime.max(value.as_i64().unwrap_or(0)),
                _ => {}
            }
        }
    }

    let mut out = Doc::new();
    out.push("ok", if err.is_some_and(|e| !e.is_null()) { 0 } else { 1 });
    if let Some(err) = err {
        out.push("err", err.clone());
    }
    if let Some(code) = code {
        out.push("code", code.clone());
    }
    if n > i32::MAX as i64 {
        out.push("n", n);
    } else {
        out.push("n", n as i32);
    }
    if has_updated_existing {
        out.push("updatedExisting", updated_existing);
    }
    if let Some(upserted) = upserted {
        out.push("upserted", upserted.clone());
    }
    if wtimeout {
        out.push("wtimeout", true);
    }
    if waited != 0 {
        out.push("waited", waited as i32);
    }
    if wtime != 0 {
        out.push("wtime", wtime as i32);
    }
    out
}

fn check_write_privileges(ns: &Namespace, privileges: &Privileges) -> Result<()> {
    if ns.collection() == "system.users" {
        privileges.require(ns.db(), Privilege::UserAdmin)?;
    }
    if ns.db() == "config" {
        privileges.require(ns.db(), Privilege::ClusterAdmin)?;
    }
    if ns.collection().starts_with("system.") {
        privileges.require(ns.db(), Privilege::DbAdmin)?;
    }
    privileges.require(ns.db(), Privilege::Write)?;
    Ok(())
}

/// Plan and perform one write batch, with the stale-config retry loop
/// and the overall write deadline
async fn perform_write(
    rt: &Runtime,
    privileges: &Privileges,
    ns: &Namespace,
    make_plan: impl Fn(&TopologyMap) -> Result<WriteOp>,
) -> Result<WriteOp> {
    if rt.env.options.read_only {
        return Err(OpError::bad_request(
            "writes through this server is forbidden",
        ));
    }
    check_write_privileges(ns, privileges)?;

    let mut last: Option<OpError> = None;
    for attempt in 0..3 {
        let map = rt.topology.get()?;

        // A collection we have never heard of in a partitioned database
        // is first treated as stale topology, then as truly absent
        let planned = if map.collection(ns).is_none()
            && map.database(ns.db()).map_or(true, Database::is_partitioned)
        {
            if attempt == 0 {
                Err(OpError::ShardConfigStale(format!(
                    "collection {ns} does not exist"
                )))
            } else {
                Err(OpError::NotImplemented(format!(
                    "collection {ns} does not exist"
                )))
            }
        } else {
            make_plan(&map)
        };

        let result = match planned {
            Ok(mut op) => {
                tracing::debug!(%ns, "performing the write operation");
                let performed = match rt.env.options.write_timeout.get() {
                    Some(d) => tokio::time::timeout(d, op.perform())
                        .await
                        .map_err(|_| OpError::internal("timeout"))?,
                    None => op.perform().await,
                };
                performed.map(|()| op)
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(op) => return Ok(op),
            Err(e @ OpError::ShardConfigStale(_)) => {
                tracing::info!(error = %e, "updating shard config");
                last = Some(e);
                rt.topology.update().await?;
            }
            Err(e) => return Err(e),
        }
    }
    Err(last.expect("retries imply a recorded error"))
}

/// Perform an insert batch
pub async fn insert(rt: &Runtime, msg: &Insert, privileges: &Privileges) -> Result<WriteOp> {
    perform_write(rt, privileges, &msg.ns, |map| plan::plan_insert(&rt.env, map, msg)).await
}

/// Perform an update batch
pub async fn update(rt: &Runtime, msg: &Update, privileges: &Privileges) -> Result<WriteOp> {
    perform_write(rt, privileges, &msg.ns, |map| plan::plan_update(&rt.env, map, msg)).await
}

/// Perform a delete batch
pub async fn remove(rt: &Runtime, msg: &Delete, privileges: &Privileges) -> Result<WriteOp> {
    perform_write(rt, privileges, &msg.ns, |map| plan::plan_delete(&rt.env, map, msg)).await
}

/// Perform a findAndModify command
pub async fn find_and_modify(
    rt: &Runtime,
    db: &str,
    cmd: &Doc,
    privileges: &Privileges,
) -> Result<WriteOp> {
    let coll = cmd
        .front()
        .and_then(|(_, v)| v.as_str())
        .ok_or_else(|| OpError::bad_request("findAndModify names no collection"))?;
    let ns = Namespace::new(db, coll);
    perform_write(rt, privileges, &ns, |map| {
        plan::plan_find_and_modify(&rt.env, map, &ns, cmd)
    })
    .await
}
