//! A single network address of a backend server
//!
//! Each endpoint keeps two connection pools (primary-capable and
//! any-capable) and runs its own ping task for as long as it lives, so
//! `alive()` and `roundtrip()` are always current without anyone asking.

use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use keel_doc::{doc, Doc};
use keel_protocol::{Namespace, QueryBuilder};
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::backend::Backend;
use crate::conn::Connection;
use crate::env::ClusterEnv;
use crate::error::{OpError, Result};
use crate::shard::PingQuery;

const REQ_ID_PING: u32 = 0x474E_4950; // "PING"

#[derive(Default)]
struct EndpointState {
    roundtrip: Option<Duration>,
    prev_roundtrip: Option<Duration>,
    pinged: bool,
}

/// One address of a backend, with pools and a liveness estimate
pub struct Endpoint {
    backend: Weak<Backend>,
    env: Arc<ClusterEnv>,
    addr: SocketAddr,
    state: Mutex<EndpointState>,
    conns: Mutex<Vec<Connection>>,
    primaries: Mutex<Vec<Connection>>,
    /// Wakes the ping task out of its sleep for an immediate probe
    kick: Notify,
}

impl Endpoint {
    pub(crate) fn new(backend: Weak<Backend>, env: Arc<ClusterEnv>, addr: SocketAddr) -> Self {
        Self {
            backend,
            env,
            addr,
            state: Mutex::new(EndpointState::default()),
            conns: Mutex::new(Vec::new()),
            primaries: Mutex::new(Vec::new()),
            kick: Notify::new(),
        }
    }

    #[inline]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    #[inline]
    pub(crate) fn env(&self) -> &Arc<ClusterEnv> {
        &self.env
    }

    pub fn backend(&self) -> Option<Arc<Backend>> {
        self.backend.upgrade()
    }

    /// Parent backend's address, or the bare socket address when the
    /// backend is already gone
    pub fn backend_addr(&self) -> String {
        match self.backend.upgrade() {
            Some(b) => b.addr().to_owned(),
            None => self.addr.to_string(),
        }
    }

    /// Time to the first ping reply; `None` while dead
    pub fn roundtrip(&self) -> Option<Duration> {
        self.state.lock().roundtrip
    }

    pub fn alive(&self) -> bool {
        self.roundtrip().is_some()
    }

    pub(crate) fn was_alive(&self) -> bool {
        self.state.lock().prev_roundtrip.is_some()
    }

    /// A pooled any-capable connection, or a fresh one
    pub fn get_any(self: &Arc<Self>) -> Connection {
        self.get(false)
    }

    /// A pooled primary-capable connection (participates in the version
    /// handshake), or a fresh one
    pub fn get_primary(self: &Arc<Self>) -> Connection {
        self.get(true)
    }

    fn get(self: &Arc<Self>, primary: bool) -> Connection {
        let pool = if primary { &self.primaries } else { &self.conns };
        if let Some(conn) = pool.lock().pop() {
            tracing::trace!(endpoint = %self.addr, "using pooled connection");
            return conn;
        }
        tracing::trace!(endpoint = %self.addr, "creating new connection");
        Connection::new(Arc::clone(self), primary)
    }

    /// Put a connection back, unless the pool is at its cap
    pub(crate) fn release(&self, conn: Connection) {
        if !conn.has_stream() {
            return;
        }
        let pool = if conn.is_primary() {
            &self.primaries
        } else {
            &self.conns
        };
        let mut pool = pool.lock();
        if pool.len() < self.env.options.conn_pool_size {
            pool.push(conn);
        } else {
            tracing::trace!(endpoint = %self.addr, "pool full, closing connection");
        }
    }

    /// Drop every pooled connection; the next use reconnects
    pub fn flush(&self) {
        tracing::debug!(endpoint = %self.addr, "flushing pooled connections");
        self.conns.lock().clear();
        self.primaries.lock().clear();
    }

    /// Backend failure observed through this endpoint: go dead now, drop
    /// the pools, and let the ping task re-probe immediately
    pub fn failed(&self) {
        {
            let mut state = self.state.lock();
            state.prev_roundtrip = state.roundtrip.take();
        }
        self.flush();
        self.kick.notify_one();
    }

    /// One bounded ping round; updates liveness either way
    pub async fn ping_now(self: &Arc<Self>) -> bool {
        let queries = self.ping_queries();
        tracing::debug!(endpoint = %self.addr, "pinging");

        match tokio::time::timeout(self.env.options.ping_timeout, self.ping_round(&queries)).await
        {
            Ok(Ok((net, gross, status))) => {
                self.set_alive(net, gross, status);
                true
            }
            Ok(Err(e)) => {
                self.set_dead(&e.to_string());
                false
            }
            Err(_) => {
                self.set_dead("timeout");
                false
            }
        }
    }

    fn ping_queries(&self) -> Vec<PingQuery> {
        let mut queries = self
            .backend
            .upgrade()
            .and_then(|b| b.shard())
            .map(|s| s.ping_queries())
            .unwrap_or_default();
        queries.push(PingQuery {
            key: "build_info",
            ns: Namespace::new("local", "$cmd"),
            criteria: doc! { "buildinfo" => 1 },
        });
        queries.push(PingQuery {
            key: "server_status",
            ns: Namespace::new("admin", "$cmd"),
            criteria: doc! { "serverStatus" => 1 },
        });
        queries
    }

    /// The probe sequence: a timed ping, then the status queries. The
    /// *net* roundtrip is the time to the first ping reply; the *gross*
    /// one covers the whole conversation.
    async fn ping_round(
        self: &Arc<Self>,
        queries: &[PingQuery],
    ) -> Result<(Duration, Duration, Doc)> {
        let started = Instant::now();
        let mut conn = self.get_any();

        let ping = QueryBuilder::new(Namespace::new("local", "$cmd"), doc! { "ping" => 1 })
            .msg_id(REQ_ID_PING)
            .batch_size(1)
            .slave_ok()
            .build();
        conn.establish(None, &ping).await?;
        let ret = conn.read_reply_doc(REQ_ID_PING).await?;
        if !ret.is_ok() {
            return Err(OpError::internal("negative reply to ping command"));
        }
        let net = started.elapsed();

        let mut status = Doc::with_capacity(queries.len());
        let mut req_id = REQ_ID_PING;
        for q in queries {
            req_id += 1;
            let msg = QueryBuilder::new(q.ns.clone(), q.criteria.clone())
                .msg_id(req_id)
                .batch_size(1)
                .slave_ok()
                .build();
            conn.send(&msg).await?;
            status.push(q.key, conn.read_reply_doc(req_id).await?);
        }

        let gross = started.elapsed();
        conn.release();
        Ok((net, gross, status))
    }

    fn set_alive(self: &Arc<Self>, net: Duration, gross: Duration, status: Doc) {
        let came_alive = {
            let mut state = self.state.lock();
            let came_alive = state.roundtrip.is_none();
            state.pinged = true;
            state.prev_roundtrip = state.roundtrip;
            state.roundtrip = Some(net);
            came_alive
        };

        if came_alive {
            tracing::info!(
                backend = %self.backend_addr(), endpoint = %self.addr,
                net_ms = net.as_millis() as u64, gross_ms = gross.as_millis() as u64,
                "endpoint alive"
            );
        } else {
            tracing::debug!(
                endpoint = %self.addr,
                net_ms = net.as_millis() as u64, gross_ms = gross.as_millis() as u64,
                "endpoint still alive"
            );
        }

        if let Some(backend) = self.backend.upgrade() {
            backend.endpoint_alive(self, status);
        }
    }

    fn set_dead(self: &Arc<Self>, reason: &str) {
        let went_dead = {
            let mut state = self.state.lock();
            let went_dead = !state.pinged || state.roundtrip.is_some();
            state.pinged = true;
            state.prev_roundtrip = state.roundtrip.take();
            went_dead
        };

        if went_dead {
            tracing::warn!(
                backend = %self.backend_addr(), endpoint = %self.addr, reason,
                "endpoint dead"
            );
        } else {
            tracing::trace!(endpoint = %self.addr, reason, "endpoint still dead");
        }

        if let Some(backend) = self.backend.upgrade() {
            backend.endpoint_dead(self);
        }
        self.flush();
    }

    /// The endpoint's lifelong ping loop; exits when the parent backend
    /// is gone
    pub(crate) fn spawn_ping(self: &Arc<Self>) {
        let ept = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                if ept.backend.upgrade().is_none() {
                    break;
                }
                let ok = ept.ping_now().await;
                let interval = if ok {
                    ept.env.options.ping_interval
                } else {
                    ept.env.options.ping_fail_interval
                };
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = ept.kick.notified() => {}
                }
            }
        });
    }
}
