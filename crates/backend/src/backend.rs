//! A logical backend server
//!
//! One backend may resolve to several endpoints (IPv4/IPv6, multiple
//! interfaces); the backend aggregates their liveness, keeps the latest
//! status document from the ping loop, and surfaces the nearest live
//! endpoint for connection checkout.

use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::{Arc, Weak};
use std::time::Duration;

use keel_doc::Doc;
use parking_lot::RwLock;
use tokio::task::JoinSet;

use crate::endpoint::Endpoint;
use crate::env::ClusterEnv;
use crate::error::{OpError, Result};
use crate::lazy::Lazy;
use crate::shard::Shard;

/// Backend software version: the build-info version array, ordered
/// lexicographically
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct SoftwareVersion(Vec<u32>);

impl SoftwareVersion {
    pub fn new(parts: impl Into<Vec<u32>>) -> Self {
        Self(parts.into())
    }

    pub fn from_build_info(build_info: &Doc) -> Self {
        let parts = build_info
            .get_array("versionArray")
            .map(|arr| arr.iter().filter_map(|v| v.as_i64()).map(|v| v as u32).collect())
            .unwrap_or_default();
        Self(parts)
    }

    pub fn is_unknown(&self) -> bool {
        self.0.is_empty()
    }
}

struct BackendState {
    /// Composite status from the last successful ping (empty = dead)
    status: Doc,
    /// Set when the node proved permanently incapable of mastership;
    /// cleared when its process id changes
    permanent_errmsg: Option<String>,
}

/// A backend server composed of its resolved endpoints
pub struct Backend {
    shard: Weak<Shard>,
    env: Arc<ClusterEnv>,
    addr: String,
    endpoints: Vec<Arc<Endpoint>>,
    state: RwLock<BackendState>,
    nearest: Lazy<usize>,
}

/// Resolve `host:port` into socket addresses
pub fn resolve(addr: &str) -> Result<Vec<SocketAddr>> {
    let addrs: Vec<SocketAddr> = addr
        .to_socket_addrs()
        .map_err(|e| OpError::internal(format!("cannot resolve {addr}: {e}")))?
        .collect();
    if addrs.is_empty() {
        return Err(OpError::internal(format!("{addr} resolves to nothing")));
    }
    Ok(addrs)
}

impl Backend {
    /// Build from pre-resolved addresses and start the ping loops
    pub(crate) fn new(
        shard: Weak<Shard>,
        env: Arc<ClusterEnv>,
        addr: String,
        sockets: Vec<SocketAddr>,
    ) -> Arc<Self> {
        let backend = Arc::new_cyclic(|weak: &Weak<Backend>| Self {
            shard,
            env: Arc::clone(&env),
            addr,
            endpoints: sockets
                .into_iter()
                .map(|s| Arc::new(Endpoint::new(weak.clone(), Arc::clone(&env), s)))
                .collect(),
            state: RwLock::new(BackendState {
                status: Doc::new(),
                permanent_errmsg: None,
            }),
            nearest: Lazy::new(),
        });
        for ept in &backend.endpoints {
            ept.spawn_ping();
        }
        backend
    }

    /// A backend outside any shard (config servers before the topology
    /// exists)
    pub fn standalone(env: Arc<ClusterEnv>, addr: &str) -> Result<Arc<Self>> {
        let sockets = resolve(addr)?;
        Ok(Self::new(Weak::new(), env, addr.to_owned(), sockets))
    }

    #[inline]
    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn shard(&self) -> Option<Arc<Shard>> {
        self.shard.upgrade()
    }

    pub fn endpoints(&self) -> &[Arc<Endpoint>] {
        &self.endpoints
    }

    /// Latest composite ping status; empty while dead
    pub fn status(&self) -> Doc {
        self.state.read().status.clone()
    }

    pub fn permanent_errmsg(&self) -> Option<String> {
        self.state.read().permanent_errmsg.clone()
    }

    pub fn alive(&self) -> bool {
        !self.state.read().status.is_empty() && self.endpoint().alive()
    }

    /// Roundtrip of the nearest endpoint; `None` while dead
    pub fn roundtrip(&self) -> Option<Duration> {
        self.endpoint().roundtrip()
    }

    /// The endpoint with the lowest roundtrip estimate
    pub fn endpoint(&self) -> Arc<Endpoint> {
        let idx = self.nearest.get(|| self.calc_nearest());
        Arc::clone(&self.endpoints[idx])
    }

    fn calc_nearest(&self) -> usize {
        self.endpoints
            .iter()
            .enumerate()
            .min_by_key(|(_, e)| e.roundtrip().unwrap_or(Duration::MAX))
            .map(|(i, _)| i)
            .expect("backend has at least one endpoint")
    }

    pub fn software_version(&self) -> SoftwareVersion {
        let status = self.state.read().status.clone();
        status
            .get_doc("build_info")
            .map(SoftwareVersion::from_build_info)
            .unwrap_or_default()
    }

    /// Called on any failure while talking to this backend: drop the
    /// status, kill the pools, let the ping loops re-probe
    pub fn failed(&self) {
        tracing::debug!(backend = %self.addr, "backend failed");
        self.state.write().status = Doc::new();
        for ept in &self.endpoints {
            ept.failed();
        }
    }

    /// Flag the node half-dead: still probed, but called out in
    /// monitoring until its process id changes
    pub fn permanently_failed(&self, errmsg: &str) {
        self.state.write().permanent_errmsg = Some(errmsg.to_owned());
    }

    /// Ping every endpoint now, concurrently, and wait for all
    pub async fn ping_now(self: &Arc<Self>) {
        let mut set = JoinSet::new();
        for ept in &self.endpoints {
            let ept = Arc::clone(ept);
            set.spawn(async move {
                ept.ping_now().await;
            });
        }
        while set.join_next().await.is_some() {}
    }

    fn pid_of(status: &Doc) -> i64 {
        status
            .get_doc("server_status")
            .and_then(|s| s.get_i64("pid"))
            .unwrap_or(0)
    }

    pub(crate) fn endpoint_alive(self: &Arc<Self>, ept: &Arc<Endpoint>, status: Doc) {
        {
            let mut state = self.state.write();
            if Self::pid_of(&state.status) != Self::pid_of(&status) {
                state.permanent_errmsg = None;
            }
            state.status = status;
        }

        // A faster endpoint takes over as nearest without a full recompute
        let current = self.nearest.cached().map(|i| &self.endpoints[i]);
        let better = match current {
            Some(near) => {
                ept.roundtrip().unwrap_or(Duration::MAX)
                    < near.roundtrip().unwrap_or(Duration::MAX)
            }
            None => true,
        };
        if better {
            if let Some(idx) = self.endpoints.iter().position(|e| Arc::ptr_eq(e, ept)) {
                self.nearest.assign(idx);
            }
        }

        if let Some(shard) = self.shard.upgrade() {
            shard.backend_updated(self);
        }
    }

    pub(crate) fn endpoint_dead(self: &Arc<Self>, ept: &Arc<Endpoint>) {
        if !ept.was_alive() {
            return;
        }
        if self.endpoints.iter().all(|e| !e.alive()) {
            self.state.write().status = Doc::new();
        }
        self.nearest.clear();

        if let Some(shard) = self.shard.upgrade() {
            shard.backend_updated(self);
        }
    }
}
