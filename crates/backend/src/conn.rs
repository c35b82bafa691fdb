//! Open connections to backend servers
//!
//! A connection belongs to its caller. The happy path ends with
//! `release()`, returning it to its endpoint's pool; any error path just
//! drops it, closing the socket, because its on-wire state is undefined.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use keel_auth::SYSTEM_USER;
use keel_doc::{doc, Doc, Value};
use keel_protocol::{
    ChunkVersion, Namespace, ProtocolError, QueryBuilder, RawMessage, Reply, HEADER_LEN,
    MAX_MESSAGE_SIZE,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;

use crate::endpoint::Endpoint;
use crate::error::{OpError, Result};

/// Fixed request ids for out-of-band conversations, handy in packet dumps
const REQ_ID_SET_VERSION: u32 = 0x5654_4553; // "SETV"
const REQ_ID_ACK: u32 = 0x0A4B_4341; // "ACK\n"

/// The code backends use for "not master" in query failures
const CODE_NOT_MASTER: i64 = 13435;

/// An open (or lazily opened) connection to one endpoint
pub struct Connection {
    endpoint: Arc<Endpoint>,
    is_primary: bool,
    authenticated: bool,
    stream: Option<BufStream<TcpStream>>,
    /// Which collection versions this connection has set on the wire
    versions: HashMap<String, ChunkVersion>,
}

impl Connection {
    pub(crate) fn new(endpoint: Arc<Endpoint>, is_primary: bool) -> Self {
        Self {
            endpoint,
            is_primary,
            authenticated: false,
            stream: None,
            versions: HashMap::new(),
        }
    }

    #[inline]
    pub fn endpoint(&self) -> &Arc<Endpoint> {
        &self.endpoint
    }

    #[inline]
    pub fn is_primary(&self) -> bool {
        self.is_primary
    }

    /// Address of the backend this connection talks to, for diagnostics
    pub fn backend_addr(&self) -> String {
        self.endpoint.backend_addr()
    }

    /// Return to the pool. Only call on the happy path.
    pub fn release(self) {
        let endpoint = Arc::clone(&self.endpoint);
        endpoint.release(self);
    }

    pub(crate) fn has_stream(&self) -> bool {
        self.stream.is_some()
    }

    /// Make sure the connection is usable, associate it with version `v`
    /// of collection `route` and send `msg`.
    ///
    /// Sending something in every case is the point: a stale pooled
    /// connection reveals itself on the write, and we silently reconnect
    /// once. Classified errors out of the handshakes (NotMaster, stale
    /// config, ...) propagate; only transport trouble triggers the retry.
    pub async fn establish(
        &mut self,
        route: Option<(&Namespace, ChunkVersion)>,
        msg: &[u8],
    ) -> Result<()> {
        if self.stream.is_some() {
            match self.prepare_and_send(route, msg).await {
                Ok(()) => return Ok(()),
                Err(OpError::Io(_)) | Err(OpError::Protocol(_)) => {
                    // Pooled stream has gone stale; everything pooled for
                    // this endpoint is suspect
                    self.endpoint.flush();
                }
                Err(other) => return Err(other),
            }
        }

        self.stream = None;
        self.versions.clear();
        self.authenticated = false;

        let tcp = TcpStream::connect(self.endpoint.addr()).await.map_err(|e| {
            OpError::internal(format!(
                "cannot communicate with {} ({}): {e}",
                self.backend_addr(),
                self.endpoint.addr()
            ))
        })?;
        let _ = tcp.set_nodelay(true);
        {
            // Keepalive catches silently dead peers between operations
            let sock = socket2::SockRef::from(&tcp);
            let keepalive = socket2::TcpKeepalive::new().with_time(Duration::from_secs(60));
            if let Err(e) = sock.set_tcp_keepalive(&keepalive) {
                tracing::debug!(endpoint = %self.endpoint.addr(), error = %e, "cannot set keepalive");
            }
        }
        self.stream = Some(BufStream::new(tcp));

        self.prepare_and_send(route, msg).await
    }

    async fn prepare_and_send(
        &mut self,
        route: Option<(&Namespace, ChunkVersion)>,
        msg: &[u8],
    ) -> Result<()> {
        self.authenticate().await?;
        if let Some((ns, version)) = route {
            if self.is_primary && version.stamp() != 0 {
                self.try_set_version(ns, version).await?;
            }
        }
        let stream = self.stream.as_mut().expect("stream present");
        stream.write_all(msg).await?;
        stream.flush().await?;
        Ok(())
    }

    /// Read one reply frame and classify it.
    ///
    /// Backend-internal anomalies (short/long frames, id mismatch) come
    /// back as `Internal`; flagged errors as their classified kinds.
    pub async fn read_reply(&mut self, req_id: u32) -> Result<Reply> {
        let addr = self.backend_addr();
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| OpError::internal("read on unopened connection"))?;

        let mut len_raw = [0u8; 4];
        stream.read_exact(&mut len_raw).await?;
        let len = u32::from_le_bytes(len_raw) as usize;
        if len < HEADER_LEN + 20 {
            return Err(OpError::internal(format!("{addr}: response too short")));
        }
        if len > MAX_MESSAGE_SIZE {
            return Err(OpError::internal(format!("{addr}: response too long")));
        }

        let mut frame = BytesMut::with_capacity(len);
        frame.extend_from_slice(&len_raw);
        frame.resize(len, 0);
        stream.read_exact(&mut frame[4..]).await?;

        let msg = RawMessage::parse(frame.freeze())?;
        if msg.header.response_to != req_id {
            return Err(OpError::Protocol(ProtocolError::IdMismatch {
                expected: req_id,
                got: msg.header.response_to,
            }));
        }

        let reply = Reply::parse(&msg)?;
        if reply.flags & Reply::CURSOR_NOT_FOUND != 0 {
            return Err(OpError::CursorNotFound(format!(
                "{addr} reports cursor not found"
            )));
        }
        if reply.flags & Reply::SHARD_CONFIG_STALE != 0 {
            return Err(OpError::ShardConfigStale(format!(
                "{addr} reports stale shard config"
            )));
        }
        if reply.flags & Reply::QUERY_FAILURE != 0 {
            let doc = reply.documents.first();
            if doc.and_then(|d| d.get_i64("code")) == Some(CODE_NOT_MASTER) {
                return Err(OpError::NotMaster);
            }
            let msg = doc
                .and_then(|d| d.get_str("$err"))
                .unwrap_or("query failure")
                .to_owned();
            return Err(OpError::QueryFailure(msg));
        }

        Ok(reply)
    }

    /// Single-document convenience for command conversations
    pub async fn read_reply_doc(&mut self, req_id: u32) -> Result<Doc> {
        let reply = self.read_reply(req_id).await?;
        reply
            .documents
            .into_iter()
            .next()
            .ok_or_else(|| OpError::internal("empty command reply"))
    }

    /// Send a command document and read its single reply document
    pub async fn command(&mut self, ns: Namespace, cmd: Doc, req_id: u32) -> Result<Doc> {
        let msg = QueryBuilder::new(ns, cmd).msg_id(req_id).batch_size(1).build();
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| OpError::internal("command on unopened connection"))?;
        stream.write_all(&msg).await?;
        stream.flush().await?;
        self.read_reply_doc(req_id).await
    }

    /// The nonce handshake against the backend, once per connection
    async fn authenticate(&mut self) -> Result<()> {
        let Some(secret) = self.endpoint.env().shared_secret.clone() else {
            return Ok(());
        };
        if self.authenticated {
            return Ok(());
        }

        tracing::debug!(endpoint = %self.endpoint.addr(), "authenticating");

        let local_cmd = Namespace::new("local", "$cmd");
        let ret = self
            .command(local_cmd.clone(), doc! { "getnonce" => 1 }, 0)
            .await?;
        if !ret.is_ok() {
            return Err(OpError::internal(format!(
                "{}: {}",
                self.backend_addr(),
                ret.get_str("err").unwrap_or("unknown error")
            )));
        }
        let nonce = ret.get_str("nonce").unwrap_or_default().to_owned();

        let ret = self
            .command(
                local_cmd,
                doc! {
                    "authenticate" => 1,
                    "user" => SYSTEM_USER,
                    "nonce" => nonce.as_str(),
                    "key" => keel_auth::make_auth_key(&nonce, SYSTEM_USER, &secret),
                },
                0,
            )
            .await?;
        if !ret.is_ok() {
            return Err(OpError::internal(format!(
                "{}: {}",
                self.backend_addr(),
                ret.get_str("errmsg").unwrap_or("unknown error")
            )));
        }

        self.authenticated = true;
        Ok(())
    }

    /// The per-namespace version handshake. A connection remembers what it
    /// has set; only a changed version goes back on the wire.
    async fn try_set_version(&mut self, ns: &Namespace, v: ChunkVersion) -> Result<()> {
        if self.versions.get(ns.full()) == Some(&v) {
            return Ok(());
        }

        tracing::debug!(
            ns = %ns, version = %v, endpoint = %self.endpoint.addr(),
            "updating shard version"
        );

        let backend = self.endpoint.backend();
        let (shard_id, shard_connstr) = match backend.as_ref().and_then(|b| b.shard()) {
            Some(shard) => (shard.id().to_owned(), shard.connection_string().to_owned()),
            None => return Ok(()),
        };
        let env = Arc::clone(self.endpoint.env());

        for _attempt in 0..2 {
            let cmd = doc! {
                "setShardVersion" => ns.full(),
                "configdb" => env.config_connstr.as_str(),
                "version" => Value::Timestamp(v.stamp()),
                "versionEpoch" => v.epoch(),
                "serverID" => env.server_id,
                "shard" => shard_id.as_str(),
                "shardHost" => shard_connstr.as_str(),
                "authoritative" => true,
            };

            let ret = self
                .command(Namespace::new("admin", "$cmd"), cmd, REQ_ID_SET_VERSION)
                .await?;
            if ret.is_ok() {
                self.versions.insert(ns.full().to_owned(), v);
                return Ok(());
            }

            let errmsg = ret.get_str("errmsg").unwrap_or_default().to_owned();
            let addr = self.backend_addr();
            if errmsg == "not master" {
                return Err(OpError::NotMaster);
            } else if errmsg.contains("all servers down") {
                tracing::debug!(backend = %addr, "backend confused, retrying version handshake");
                continue;
            } else if errmsg.contains("metadata manager failed to initialize") {
                tracing::error!(backend = %addr, "permanently incapable of operating as primary");
                if let Some(b) = &backend {
                    b.permanently_failed(&errmsg);
                }
                if let Err(e) = self.step_down(3600).await {
                    tracing::warn!(backend = %addr, error = %e, "step-down failed");
                }
                return Err(OpError::PermanentFailure { addr, msg: errmsg });
            } else if errmsg.contains("None of the hosts") {
                return Err(OpError::Connectivity { addr, msg: errmsg });
            } else {
                return Err(OpError::ShardConfigStale(format!("{addr}: {errmsg}")));
            }
        }
        Ok(())
    }

    /// Ask a broken primary to step aside for a while
    async fn step_down(&mut self, seconds: i64) -> Result<()> {
        self.command(
            Namespace::new("admin", "$cmd"),
            doc! { "replSetStepDown" => seconds, "force" => true },
            0,
        )
        .await?;
        Ok(())
    }

    /// Send raw bytes on an already-established stream
    pub async fn send(&mut self, msg: &Bytes) -> Result<()> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| OpError::internal("send on unopened connection"))?;
        stream.write_all(msg).await?;
        stream.flush().await?;
        Ok(())
    }

    /// Issue a getLastError-style acknowledgement conversation
    pub async fn acknowledge(&mut self, db: &str, write_concern: &Doc) -> Result<Doc> {
        self.command(
            Namespace::new(db, "$cmd"),
            write_concern.clone(),
            REQ_ID_ACK,
        )
        .await
    }
}
