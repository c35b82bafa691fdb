//! One client connection
//!
//! Requests are strictly ordered within a session: the next message is
//! read only after the previous one has produced its reply bytes. A
//! frame whose "length" spells `GET ` hands the connection to the HTTP
//! status surface instead.

use std::sync::Arc;

use bytes::BytesMut;
use keel_auth::Privileges;
use keel_doc::encoded_len;
use keel_engine::{DataSource, Runtime, WriteOp};
use keel_protocol::{
    Delete, GetMore, Insert, KillCursors, Opcode, Query, RawMessage, Reply, ReplyBuilder, Update,
    HEADER_LEN, HTTP_GET_MAGIC, MAX_MESSAGE_SIZE,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;

use keel_backend::{OpError, Result};

use crate::cursors::CursorScope;
use crate::http;

/// Internal cap on writes retried over stale topology
const WRITE_PROTECT_ATTEMPTS: usize = 8;

pub(crate) enum WriteMsg {
    Insert(Insert),
    Update(Update),
    Delete(Delete),
    FindAndModify { db: String, cmd: keel_doc::Doc },
}

/// A connected client
pub struct Session {
    rt: Arc<Runtime>,
    stream: BufStream<TcpStream>,
    peer: String,
    cursors: CursorScope,
    pub(crate) privileges: Privileges,
    pub(crate) nonce: Option<String>,
    last_write: Option<WriteOp>,
}

impl Session {
    pub fn new(rt: Arc<Runtime>, stream: TcpStream, cursors: CursorScope) -> Self {
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "<unknown>".to_owned());
        let privileges = if rt.env.options.auth {
            Privileges::anonymous()
        } else {
            Privileges::root()
        };
        Self {
            rt,
            stream: BufStream::new(stream),
            peer,
            cursors,
            privileges,
            nonce: None,
            last_write: None,
        }
    }

    pub(crate) fn runtime(&self) -> &Arc<Runtime> {
        &self.rt
    }

    /// Serve until the client hangs up or sends something unframeable
    pub async fn run(&mut self) -> Result<()> {
        loop {
            let Some(msg) = self.read_msg().await? else {
                return Ok(());
            };

            let started = std::time::Instant::now();
            match msg.opcode() {
                Opcode::Update => {
                    let upd = Update::parse(&msg)?;
                    let op = self.run_write(&WriteMsg::Update(upd)).await;
                    self.log_write(&msg, &op, started);
                    self.set_write_op(Some(op));
                }
                Opcode::Insert => {
                    let ins = Insert::parse(&msg)?;
                    let op = self.run_write(&WriteMsg::Insert(ins)).await;
                    self.log_write(&msg, &op, started);
                    self.set_write_op(Some(op));
                }
                Opcode::Delete => {
                    let del = Delete::parse(&msg)?;
                    let op = self.run_write(&WriteMsg::Delete(del)).await;
                    self.log_write(&msg, &op, started);
                    self.set_write_op(Some(op));
                }
                Opcode::Query => {
                    let q = Query::parse(&msg)?;
                    self.run_query(&msg, q, started).await?;
                }
                Opcode::GetMore => {
                    let more = GetMore::parse(&msg)?;
                    let ds = self.cursors.map().take(more.cursor_id);
                    if ds.is_none() {
                        tracing::info!(
                            client = %self.peer, cursor = more.cursor_id,
                            "get-more on unknown cursor"
                        );
                    }
                    if let Some(kept) = self.feed(msg.req_id(), ds, more.n_to_return).await? {
                        self.cursors.map().insert(kept);
                    }
                }
                Opcode::KillCursors => {
                    let kill = KillCursors::parse(&msg)?;
                    tracing::info!(
                        client = %self.peer, cursors = ?kill.cursor_ids,
                        "kill cursors"
                    );
                    for id in kill.cursor_ids {
                        if let Some(mut ds) = self.cursors.map().take(id) {
                            ds.close().await;
                        }
                    }
                }
                Opcode::Reply => {
                    return Err(OpError::bad_request("unexpected REPLY from client"));
                }
            }
        }
    }

    /// Read one frame; `None` on clean EOF. A `GET ` opener serves HTTP
    /// and ends the session.
    async fn read_msg(&mut self) -> Result<Option<RawMessage>> {
        let mut len_raw = [0u8; 4];
        match self.stream.read_exact(&mut len_raw).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        let len = u32::from_le_bytes(len_raw);
        if len as usize > MAX_MESSAGE_SIZE {
            if len == HTTP_GET_MAGIC {
                http::serve(&mut self.stream, &self.rt).await?;
            } else {
                tracing::warn!(client = %self.peer, len, "message length too big");
            }
            return Ok(None);
        }
        if (len as usize) < HEADER_LEN {
            tracing::warn!(client = %self.peer, len, "message too short");
            return Ok(None);
        }

        let mut frame = BytesMut::with_capacity(len as usize);
        frame.extend_from_slice(&len_raw);
        frame.resize(len as usize, 0);
        self.stream.read_exact(&mut frame[4..]).await?;

        Ok(Some(RawMessage::parse(frame.freeze())?))
    }

    async fn run_query(
        &mut self,
        msg: &RawMessage,
        q: Query,
        started: std::time::Instant,
    ) -> Result<()> {
        let is_cmd = q.ns.is_command();

        let built: Result<DataSource> = async {
            let mut ds = if is_cmd {
                if q.query.is_empty() {
                    return Err(OpError::bad_request("query object empty"));
                }
                DataSource::fixed(crate::command::dispatch(self, &q).await?)
            } else {
                keel_engine::query(&self.rt, &q, &self.privileges).await?
            };

            for _ in 0..q.n_to_skip {
                if ds.at_end() {
                    break;
                }
                ds.advance().await?;
            }
            Ok(ds)
        }
        .await;

        let (ds, errmsg) = match built {
            Ok(ds) => (ds, None),
            Err(e) => {
                let public = match &e {
                    OpError::Io(_) | OpError::Internal(_) | OpError::Protocol(_) => {
                        "internal error; see the proxy log".to_owned()
                    }
                    other => other.to_string(),
                };
                let ds = if is_cmd {
                    DataSource::cmd_error(8, public)
                } else {
                    DataSource::query_error(public)
                };
                (ds, Some(e))
            }
        };

        let descr = ds.describe();
        let kept = self.feed(msg.req_id(), Some(ds), q.n_to_return).await?;

        match &errmsg {
            None => tracing::info!(
                client = %self.peer, req = msg.req_id(), ns = %q.ns,
                result = %descr, took_ms = started.elapsed().as_millis() as u64,
                "query"
            ),
            Some(e) => tracing::warn!(
                client = %self.peer, req = msg.req_id(), ns = %q.ns,
                error = %e, took_ms = started.elapsed().as_millis() as u64,
                "query failed"
            ),
        }

        if let Some(kept) = kept {
            self.cursors.map().insert(kept);
        }
        Ok(())
    }

    /// Run a write batch, protecting the session against stale topology:
    /// up to eight retries with refresh; any other failure becomes a
    /// FailedOperation whose ack carries the error.
    pub(crate) async fn run_write(&self, msg: &WriteMsg) -> WriteOp {
        let mut stale: Option<WriteOp> = None;
        for _ in 0..WRITE_PROTECT_ATTEMPTS {
            let result = match msg {
                WriteMsg::Insert(m) => keel_engine::insert(&self.rt, m, &self.privileges).await,
                WriteMsg::Update(m) => keel_engine::update(&self.rt, m, &self.privileges).await,
                WriteMsg::Delete(m) => keel_engine::remove(&self.rt, m, &self.privileges).await,
                WriteMsg::FindAndModify { db, cmd } => {
                    keel_engine::find_and_modify(&self.rt, db, cmd, &self.privileges).await
                }
            };
            match result {
                Ok(op) => return op,
                Err(e @ OpError::ShardConfigStale(_)) => {
                    stale = Some(WriteOp::failed(e.to_string()));
                    if let Err(e) = self.rt.topology.update().await {
                        tracing::warn!(error = %e, "cannot update shard config");
                    }
                }
                Err(e) => return WriteOp::failed(e.to_string()),
            }
        }
        stale.expect("retries imply a stale failure")
    }

    fn log_write(&self, msg: &RawMessage, op: &WriteOp, started: std::time::Instant) {
        tracing::info!(
            client = %self.peer, req = msg.req_id(), opcode = ?msg.opcode(),
            status = %op.last_status(), took_ms = started.elapsed().as_millis() as u64,
            "write"
        );
    }

    /// Replace the retained last write. Only acknowledgeable operations
    /// are kept for a later getLastError; the rest finish right away.
    pub(crate) fn set_write_op(&mut self, op: Option<WriteOp>) {
        if let Some(mut previous) = self.last_write.take() {
            previous.finish();
        }
        let Some(mut op) = op else { return };
        if op.is_acknowledgable() {
            self.last_write = Some(op);
        } else {
            op.finish();
        }
    }

    pub(crate) fn last_write_mut(&mut self) -> Option<&mut WriteOp> {
        self.last_write.as_mut()
    }

    /// Send one batch off `ds` and return the datasource to retain under
    /// its cursor id, if it is not exhausted. A fetch failure after
    /// documents were already emitted is stashed as an error source under
    /// the same id, so the next get-more surfaces it.
    async fn feed(
        &mut self,
        req_id: u32,
        ds: Option<DataSource>,
        count: i32,
    ) -> Result<Option<DataSource>> {
        let mut rb = ReplyBuilder::new(req_id);

        let Some(mut ds) = ds else {
            rb.set_flags(Reply::CURSOR_NOT_FOUND);
            self.send(rb).await?;
            return Ok(None);
        };

        rb.set_flags(ds.flags());
        rb.set_starting_from(ds.pos() as u32);

        let auto_close = count == 1 || count < 0;
        let mut remaining: Option<u64> = match count.unsigned_abs() as u64 {
            0 => None,
            n => Some(n),
        };

        loop {
            if remaining == Some(0) || ds.at_end() {
                break;
            }
            let Some(doc) = ds.get().cloned() else { break };
            if rb.len() + encoded_len(&doc) >= MAX_MESSAGE_SIZE {
                break;
            }

            match ds.advance().await {
                Ok(()) => {
                    rb.push_doc(&doc);
                    if let Some(r) = &mut remaining {
                        *r -= 1;
                    }
                }
                Err(e) => {
                    tracing::debug!(
                        cursor = ds.id(), error = %e,
                        "fetch failed mid-cursor"
                    );
                    let mut err_ds = DataSource::query_error(e.to_string());
                    err_ds.set_id(ds.id());
                    if rb.doc_count() != 0 {
                        // Ship what we have; the stashed error answers
                        // the next get-more on this cursor
                        ds = err_ds;
                        break;
                    }
                    rb.or_flags(err_ds.flags());
                    ds = err_ds;
                }
            }
        }

        tracing::debug!(returned = rb.doc_count(), "sending batch");

        let keep = !auto_close && !ds.at_end();
        if keep {
            rb.set_cursor_id(ds.id());
        } else {
            ds.close().await;
        }
        self.send(rb).await?;

        Ok(if keep { Some(ds) } else { None })
    }

    async fn send(&mut self, rb: ReplyBuilder) -> Result<()> {
        let bytes = rb.finish();
        self.stream.write_all(&bytes).await?;
        self.stream.flush().await?;
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(mut op) = self.last_write.take() {
            op.finish();
        }
    }
}
