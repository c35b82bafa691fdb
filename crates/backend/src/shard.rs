//! Shards: replica sets, sync groups and singletons
//!
//! A shard hands out connections satisfying a read preference, tracks the
//! primary of a replica set, and reacts to backend failures. Everything
//! here is driven by the endpoints' ping loops; the selection caches
//! (primary, roundtrip order) recompute lazily after each update.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use keel_doc::{doc, Doc, Value};
use keel_protocol::Namespace;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use tokio::sync::watch;

use crate::backend::{resolve, Backend, SoftwareVersion};
use crate::conn::Connection;
use crate::env::ClusterEnv;
use crate::error::{OpError, Result};
use crate::lazy::Lazy;
use crate::monitor::HealthStatus;

/// Replica-set member states that can serve reads
const STATE_PRIMARY: i64 = 1;
const STATE_SECONDARY: i64 = 2;

/// A status probe run against every backend of the shard on each ping
#[derive(Debug, Clone)]
pub struct PingQuery {
    pub key: &'static str,
    pub ns: Namespace,
    pub criteria: Doc,
}

/// Query flag mirrored here to avoid dragging the whole decoder in
const FLAG_SLAVE_OK: u32 = 0x04;

#[derive(Debug, Clone, Default)]
struct MemberInfo {
    tags: Doc,
    /// Milliseconds; `i64::MAX` while unknown so an unprobed member is
    /// never filtered out by the lag check
    optime_ms: i64,
}

struct ReplicaSetState {
    name: String,
    primary: Lazy<Option<usize>>,
    info: RwLock<HashMap<usize, MemberInfo>>,
    /// `None` while a primary is known
    lost_primary_since: Mutex<Option<Instant>>,
    /// True while an emergency ping sweep is in flight
    ping_busy: watch::Sender<bool>,
}

enum ShardKind {
    /// Placeholder for an empty connection string
    Null,
    Single,
    Sync,
    ReplicaSet(ReplicaSetState),
}

/// One shard of the cluster
pub struct Shard {
    id: String,
    connstr: String,
    env: Arc<ClusterEnv>,
    backends: Vec<Arc<Backend>>,
    kind: ShardKind,
    by_roundtrip: Lazy<Vec<usize>>,
}

impl Shard {
    /// Parse a connection string and build the matching shard variant:
    /// `name/h1,h2` a replica set, `h1,h2` a sync group, `h` a singleton.
    pub fn make(id: &str, connstr: &str, env: Arc<ClusterEnv>) -> Result<Arc<Self>> {
        let (set_name, members_raw) = match connstr.split_once('/') {
            Some((name, rest)) => (Some(name), rest),
            None => (None, connstr),
        };
        let members: Vec<&str> = if connstr.is_empty() {
            Vec::new()
        } else {
            members_raw.split(',').collect()
        };

        let kind = if connstr.is_empty() {
            ShardKind::Null
        } else if let Some(name) = set_name {
            if name.is_empty() || members.iter().any(|m| m.is_empty()) {
                return Err(OpError::bad_request(format!(
                    "bad connection string: {connstr}"
                )));
            }
            ShardKind::ReplicaSet(ReplicaSetState {
                name: name.to_owned(),
                primary: Lazy::new(),
                info: RwLock::new(HashMap::new()),
                lost_primary_since: Mutex::new(Some(Instant::now())),
                ping_busy: watch::channel(false).0,
            })
        } else if members.len() == 1 {
            if members[0].is_empty() {
                return Err(OpError::bad_request(format!(
                    "bad connection string: {connstr}"
                )));
            }
            ShardKind::Single
        } else {
            ShardKind::Sync
        };

        // Resolve everything up front so construction is infallible once
        // the cyclic references come into play
        let mut resolved = Vec::with_capacity(members.len());
        for member in &members {
            resolved.push((member.to_string(), resolve(member)?));
        }

        let shard = Arc::new_cyclic(|weak| Self {
            id: id.to_owned(),
            connstr: connstr.to_owned(),
            env: Arc::clone(&env),
            backends: resolved
                .into_iter()
                .map(|(addr, sockets)| {
                    Backend::new(weak.clone(), Arc::clone(&env), addr, sockets)
                })
                .collect(),
            kind,
            by_roundtrip: Lazy::new(),
        });
        Ok(shard)
    }

    #[inline]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[inline]
    pub fn connection_string(&self) -> &str {
        &self.connstr
    }

    pub fn backends(&self) -> &[Arc<Backend>] {
        &self.backends
    }

    /// Name of the replica set, if this shard is one
    pub fn replica_set_name(&self) -> Option<&str> {
        match &self.kind {
            ShardKind::ReplicaSet(rs) => Some(&rs.name),
            _ => None,
        }
    }

    /// Highest version reported among probed backends
    pub fn software_version(&self) -> SoftwareVersion {
        let mut ret = SoftwareVersion::default();
        for b in &self.backends {
            let v = b.software_version();
            if !v.is_unknown() && (ret.is_unknown() || ret < v) {
                ret = v;
            }
        }
        ret
    }

    /// Whether the backends understand the command write forms
    pub fn supports_write_commands(&self) -> bool {
        self.software_version() >= SoftwareVersion::new([2, 6, 0])
    }

    /// Status probes the ping loop runs per backend
    pub fn ping_queries(&self) -> Vec<PingQuery> {
        match &self.kind {
            ShardKind::ReplicaSet(_) => vec![
                PingQuery {
                    key: "status",
                    ns: Namespace::new("admin", "$cmd"),
                    criteria: doc! { "replSetGetStatus" => 1 },
                },
                PingQuery {
                    key: "conf",
                    ns: Namespace::new("local", "system.replset"),
                    criteria: Doc::new(),
                },
            ],
            _ => Vec::new(),
        }
    }

    /// A connection suitable for a read with the given query flags and
    /// read preference, avoiding `exclude`. `None` when no backend fits.
    pub async fn read_op(
        &self,
        query_flags: u32,
        read_pref: Option<&Doc>,
        exclude: Option<&Arc<Backend>>,
    ) -> Option<Connection> {
        match &self.kind {
            ShardKind::Null => None,
            ShardKind::Single => {
                let b = &self.backends[0];
                if b.alive() && !same_backend(Some(b), exclude) {
                    Some(b.endpoint().get_primary())
                } else {
                    None
                }
            }
            ShardKind::Sync => {
                let idx = self.select_local(|i| {
                    !same_backend(Some(&self.backends[i]), exclude)
                })?;
                Some(self.backends[idx].endpoint().get_any())
            }
            ShardKind::ReplicaSet(rs) => {
                self.wait_for_pings(rs).await;
                self.replica_read_op(rs, query_flags, read_pref, exclude)
            }
        }
    }

    fn replica_read_op(
        &self,
        rs: &ReplicaSetState,
        query_flags: u32,
        read_pref: Option<&Doc>,
        exclude: Option<&Arc<Backend>>,
    ) -> Option<Connection> {
        let mode = match read_pref {
            Some(pref) => pref.get_str("mode").unwrap_or("primary"),
            None if query_flags & FLAG_SLAVE_OK != 0 => "nearest",
            None => "primary",
        };
        let tags: &[Value] = read_pref.and_then(|p| p.get_array("tags")).unwrap_or(&[]);

        if mode == "primary" || mode == "primaryPreferred" {
            let p = rs.primary.get(|| self.calc_primary(rs));
            match p {
                Some(idx) => tracing::debug!(
                    shard = %self.id, primary = %self.backends[idx].addr(),
                    "current primary"
                ),
                None => tracing::debug!(shard = %self.id, "no primary"),
            }

            let p_matches = p.is_some_and(|idx| {
                let b = &self.backends[idx];
                !same_backend(Some(b), exclude) && self.tags_match(rs, idx, tags)
            });

            if mode == "primary" || p_matches {
                // On `primary`, a re-election may have picked the same
                // node again after the emergency ping, so `exclude` is
                // deliberately ignored
                return p.map(|idx| self.backends[idx].endpoint().get_primary());
            }
        }

        // secondary / secondaryPreferred / nearest all select the same way
        let lag_filtered = self.env.options.max_repl_lag.is_finite() || !tags.is_empty();
        let info = if lag_filtered {
            rs.info.read().clone()
        } else {
            HashMap::new()
        };

        let optime_threshold = match self.env.options.max_repl_lag.get() {
            Some(lag) => {
                max_optime(&info).saturating_sub(lag.as_millis() as i64)
            }
            None => 0,
        };

        let idx = self.select_local(|i| {
            let b = &self.backends[i];
            if !Self::is_healthy(b) || same_backend(Some(b), exclude) {
                return false;
            }
            if info.is_empty() {
                return true;
            }
            match info.get(&i) {
                Some(m) => {
                    tags_match_doc(&m.tags, tags) && m.optime_ms >= optime_threshold
                }
                None => false,
            }
        })?;

        tracing::debug!(shard = %self.id, backend = %self.backends[idx].addr(), "selected");
        Some(self.backends[idx].endpoint().get_any())
    }

    /// A primary-capable connection for writes; `None` when no primary
    pub async fn primary(&self) -> Option<Connection> {
        match &self.kind {
            ShardKind::Null | ShardKind::Sync => None,
            ShardKind::Single => {
                let b = &self.backends[0];
                if b.alive() {
                    Some(b.endpoint().get_primary())
                } else {
                    None
                }
            }
            ShardKind::ReplicaSet(rs) => {
                self.wait_for_pings(rs).await;
                rs.primary
                    .get(|| self.calc_primary(rs))
                    .map(|idx| self.backends[idx].endpoint().get_primary())
            }
        }
    }

    /// Report a communication failure with one of our backends
    pub fn failed(&self, backend: &Arc<Backend>) {
        if let ShardKind::ReplicaSet(rs) = &self.kind {
            let lost = rs
                .primary
                .cached()
                .flatten()
                .is_some_and(|idx| Arc::ptr_eq(&self.backends[idx], backend));
            if lost {
                self.lost_master();
            }
        }
        self.by_roundtrip.clear();
        backend.failed();
    }

    /// A node we took for primary told us it is not: drop the cache,
    /// remember when, and ping everyone right away
    pub fn lost_master(&self) {
        let ShardKind::ReplicaSet(rs) = &self.kind else {
            return;
        };
        tracing::debug!(shard = %self.id, "lost primary; will re-ping");
        rs.primary.clear();
        {
            let mut since = rs.lost_primary_since.lock();
            if since.is_none() {
                *since = Some(Instant::now());
            }
        }
        self.ping_all_once(rs);
    }

    /// Feed one backend's fresh (or lost) ping status into the caches
    pub fn backend_updated(self: &Arc<Self>, backend: &Arc<Backend>) {
        self.by_roundtrip.clear();

        let ShardKind::ReplicaSet(rs) = &self.kind else {
            return;
        };
        let Some(idx) = self.index_of(backend) else {
            return;
        };

        if Self::is_primary_backend(backend) {
            rs.primary.assign(Some(idx));
            *rs.lost_primary_since.lock() = None;
        } else if rs.primary.cached().flatten() == Some(idx) {
            self.lost_master();
        }

        if backend.alive() {
            let status = backend.status();
            let member = status
                .get_doc("status")
                .and_then(|s| s.get_array("members"))
                .and_then(|members| {
                    members
                        .iter()
                        .filter_map(Value::as_doc)
                        .find(|m| m.contains("self"))
                });

            let name = member.and_then(|m| m.get_str("name")).unwrap_or("");
            let optime_ms = member
                .and_then(|m| m.get("optimeDate"))
                .and_then(|v| match v {
                    Value::DateTime(ms) => Some(*ms),
                    _ => None,
                })
                .unwrap_or(0);
            let tags = status
                .get_doc("conf")
                .and_then(|c| c.get_array("members"))
                .and_then(|members| find_by_field(members, "host", name))
                .and_then(|m| m.get_doc("tags"))
                .cloned()
                .unwrap_or_default();

            rs.info.write().insert(idx, MemberInfo { tags, optime_ms });
        }
    }

    /// User-readable health of one backend
    pub fn backend_status_str(&self, backend: &Arc<Backend>) -> String {
        match &self.kind {
            ShardKind::ReplicaSet(_) => {
                if !Self::is_healthy(backend) {
                    return "DEAD".to_owned();
                }
                backend
                    .status()
                    .get_doc("status")
                    .and_then(|s| s.get_array("members"))
                    .and_then(|members| {
                        members
                            .iter()
                            .filter_map(Value::as_doc)
                            .find(|m| m.contains("self"))
                    })
                    .and_then(|m| m.get_str("stateStr"))
                    .unwrap_or("UNKNOWN")
                    .to_owned()
            }
            _ => {
                if backend.alive() {
                    "alive".to_owned()
                } else {
                    "DEAD".to_owned()
                }
            }
        }
    }

    /// Lag between this member's data and the freshest member
    pub fn replication_lag(&self, backend: &Arc<Backend>) -> Option<Duration> {
        let ShardKind::ReplicaSet(rs) = &self.kind else {
            return None;
        };
        if !Self::is_healthy(backend) {
            return None;
        }
        let info = rs.info.read().clone();
        let max = max_optime(&info);
        let idx = self.index_of(backend)?;
        let mine = info.get(&idx)?.optime_ms;
        if mine == i64::MAX || max == i64::MAX {
            return None;
        }
        Some(Duration::from_millis(max.saturating_sub(mine) as u64))
    }

    /// Health of the whole shard for the monitoring surface
    pub fn health(&self) -> HealthStatus {
        match &self.kind {
            ShardKind::Null => HealthStatus::ok(),
            ShardKind::Single | ShardKind::Sync => {
                let mut ret = HealthStatus::ok();
                let mut any_alive = false;
                for b in &self.backends {
                    if b.alive() {
                        any_alive = true;
                    } else {
                        ret.merge(HealthStatus::warning(format!("{} is dead", b.addr())));
                    }
                }
                if !any_alive {
                    ret.merge(HealthStatus::critical_silent());
                }
                ret
            }
            ShardKind::ReplicaSet(rs) => self.replica_health(rs),
        }
    }

    fn replica_health(&self, rs: &ReplicaSetState) -> HealthStatus {
        let mut ret = HealthStatus::ok();
        let mut has_alive_member = false;
        let mut has_primary = false;

        let info = rs.info.read().clone();
        let optime_threshold = match self.env.options.max_repl_lag.get() {
            Some(lag) => max_optime(&info).saturating_sub(lag.as_millis() as i64),
            None => 0,
        };

        for (idx, b) in self.backends.iter().enumerate() {
            if !b.alive() || !Self::is_healthy(b) {
                ret.merge(HealthStatus::warning(format!("{} is dead", b.addr())));
            } else if let Some(errmsg) = b.permanent_errmsg() {
                ret.merge(HealthStatus::critical(format!(
                    "{} is permanently half-alive: {errmsg}",
                    b.addr()
                )));
            } else if info
                .get(&idx)
                .map(|m| m.optime_ms < optime_threshold)
                .unwrap_or(true)
            {
                ret.merge(HealthStatus::warning(format!(
                    "{}'s replication lag exceeds threshold",
                    b.addr()
                )));
            } else {
                has_alive_member = true;
                if Self::is_primary_backend(b) {
                    has_primary = true;
                }
            }
        }

        if !has_primary {
            let since = *rs.lost_primary_since.lock();
            let too_long = match (self.env.options.monitor_no_primary.get(), since) {
                (Some(limit), Some(t)) => t.elapsed() >= limit,
                _ => false,
            };
            if too_long {
                let minutes = since.map(|t| t.elapsed().as_secs() / 60).unwrap_or(0);
                ret.merge(HealthStatus::critical(format!(
                    "replica set {} has no primary member for {minutes} min",
                    self.id
                )));
            } else {
                ret.merge(HealthStatus::warning(format!(
                    "replica set {} has no primary member",
                    self.id
                )));
            }
        }

        if !has_alive_member {
            ret.merge(HealthStatus::critical_silent());
        }

        ret
    }

    // ---- selection internals ----

    fn index_of(&self, backend: &Arc<Backend>) -> Option<usize> {
        self.backends.iter().position(|b| Arc::ptr_eq(b, backend))
    }

    fn is_primary_backend(b: &Arc<Backend>) -> bool {
        b.alive() && member_state(b) == Some(STATE_PRIMARY)
    }

    fn is_healthy(b: &Arc<Backend>) -> bool {
        b.alive() && matches!(member_state(b), Some(STATE_PRIMARY) | Some(STATE_SECONDARY))
    }

    fn calc_primary(&self, rs: &ReplicaSetState) -> Option<usize> {
        let found = self
            .backends
            .iter()
            .position(Self::is_primary_backend);
        if found.is_some() {
            *rs.lost_primary_since.lock() = None;
        }
        found
    }

    fn tags_match(&self, rs: &ReplicaSetState, idx: usize, criteria: &[Value]) -> bool {
        if criteria.is_empty() {
            return true;
        }
        let info = rs.info.read();
        let tags = info.get(&idx).map(|m| m.tags.clone()).unwrap_or_default();
        drop(info);
        tags_match_doc(&tags, criteria)
    }

    /// Local-threshold selection: among candidates sorted by roundtrip,
    /// keep the prefix within `local_threshold` of the fastest and pick
    /// uniformly; a prefix of just the fastest widens to every candidate
    /// so a single outlier does not starve the rest.
    fn select_local(&self, pred: impl Fn(usize) -> bool) -> Option<usize> {
        let order = self.by_roundtrip.get(|| self.calc_by_roundtrip());
        let candidates: Vec<usize> = order.into_iter().filter(|&i| pred(i)).collect();
        if candidates.is_empty() {
            return None;
        }

        let rt = |i: usize| self.backends[i].roundtrip().unwrap_or(Duration::MAX);
        let threshold = rt(candidates[0]).saturating_add(self.env.options.local_threshold);
        let mut prefix = candidates
            .iter()
            .take_while(|&&i| rt(i) < threshold)
            .count();
        if prefix <= 1 {
            prefix = candidates.len();
        }

        let pick = rand::thread_rng().gen_range(0..prefix);
        Some(candidates[pick])
    }

    fn calc_by_roundtrip(&self) -> Vec<usize> {
        // Snapshot the roundtrips first; they move under us while sorting
        let mut order: Vec<(Duration, usize)> = self
            .backends
            .iter()
            .enumerate()
            .map(|(i, b)| (b.roundtrip().unwrap_or(Duration::MAX), i))
            .collect();
        order.sort();
        order.into_iter().map(|(_, i)| i).collect()
    }

    // ---- emergency ping plumbing ----

    /// Ping every backend once, shared across concurrent callers
    fn ping_all_once(&self, rs: &ReplicaSetState) {
        let started = rs.ping_busy.send_if_modified(|busy| {
            if *busy {
                false
            } else {
                *busy = true;
                true
            }
        });
        if !started {
            return;
        }

        let backends = self.backends.clone();
        let tx = rs.ping_busy.clone();
        tokio::spawn(async move {
            let mut set = tokio::task::JoinSet::new();
            for b in backends {
                set.spawn(async move { b.ping_now().await });
            }
            while set.join_next().await.is_some() {}
            tx.send_replace(false);
        });
    }

    async fn wait_for_pings(&self, rs: &ReplicaSetState) {
        let mut rx = rs.ping_busy.subscribe();
        if !*rx.borrow() {
            return;
        }
        tracing::debug!(shard = %self.id, "emergency ping in progress; waiting");
        while *rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }
}

/// Member state out of the composite status document
fn member_state(b: &Arc<Backend>) -> Option<i64> {
    b.status()
        .get_doc("status")
        .and_then(|s| s.get_i64("myState"))
}

fn same_backend(a: Option<&Arc<Backend>>, b: Option<&Arc<Backend>>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        _ => false,
    }
}

/// Highest optime across probed members; `i64::MAX` when any member is
/// still unprobed
fn max_optime(info: &HashMap<usize, MemberInfo>) -> i64 {
    info.values().map(|m| m.optime_ms).max().unwrap_or(i64::MAX)
}

/// A preference tag list is a disjunction of tag documents; a backend
/// matches when any of them is a subset of its tags
fn tags_match_doc(tags: &Doc, criteria: &[Value]) -> bool {
    if criteria.is_empty() {
        return true;
    }
    criteria.iter().filter_map(Value::as_doc).any(|wanted| {
        wanted
            .iter()
            .all(|(name, value)| tags.get(name) == Some(value))
    })
}

fn find_by_field<'a>(members: &'a [Value], key: &str, expected: &str) -> Option<&'a Doc> {
    members
        .iter()
        .filter_map(Value::as_doc)
        .find(|m| m.get_str(key) == Some(expected))
}

#[cfg(test)]
#[path = "shard_test.rs"]
mod shard_test;
