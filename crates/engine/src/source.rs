//! The datasource contract
//!
//! A datasource is a lazy, restartable stream of documents behind a
//! generated cursor id. Four shapes cover every read: `Null` (no shards),
//! `Fixed` (one synthesized document, also used for stashed errors),
//! `Backend` (one remote cursor) and `Merge` (ordered merge across
//! remote cursors).

use std::sync::atomic::{AtomicU64, Ordering};

use keel_doc::{doc, Doc, Value};
use keel_protocol::Reply;

use crate::read::{BackendSource, MergeSource};
use crate::Result;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn generate_id() -> u64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

pub(crate) enum SourceKind {
    Null,
    Fixed(FixedSource),
    Backend(BackendSource),
    Merge(MergeSource),
}

pub(crate) struct FixedSource {
    doc: Doc,
    consumed: bool,
    flags: u32,
}

/// One read operation's stream of documents
pub struct DataSource {
    id: u64,
    pos: u64,
    closed: bool,
    kind: SourceKind,
}

impl DataSource {
    pub(crate) fn new(kind: SourceKind) -> Self {
        Self {
            id: generate_id(),
            pos: 0,
            closed: false,
            kind,
        }
    }

    /// The empty source: ends immediately
    pub fn null() -> Self {
        Self::new(SourceKind::Null)
    }

    /// A single in-memory document
    pub fn fixed(doc: Doc) -> Self {
        Self::new(SourceKind::Fixed(FixedSource {
            doc,
            consumed: false,
            flags: 0,
        }))
    }

    /// A `{$err: ...}` document carrying the query-failure reply flag
    pub fn query_error(msg: impl Into<String>) -> Self {
        Self::new(SourceKind::Fixed(FixedSource {
            doc: doc! { "$err" => msg.into() },
            consumed: false,
            flags: Reply::QUERY_FAILURE,
        }))
    }

    /// A failed command reply document
    pub fn cmd_error(code: i64, msg: impl Into<String>) -> Self {
        Self::new(SourceKind::Fixed(FixedSource {
            doc: doc! { "ok" => 0, "code" => code, "errmsg" => msg.into() },
            consumed: false,
            flags: 0,
        }))
    }

    /// Cursor id handed to the client
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Reuse another cursor's id (stashing an error under it)
    pub fn set_id(&mut self, id: u64) {
        self.id = id;
    }

    /// Documents handed out so far
    #[inline]
    pub fn pos(&self) -> u64 {
        self.pos
    }

    /// Reply flags this source wants set on its batches
    pub fn flags(&self) -> u32 {
        match &self.kind {
            SourceKind::Fixed(f) => f.flags,
            _ => 0,
        }
    }

    pub fn at_end(&self) -> bool {
        match &self.kind {
            SourceKind::Null => true,
            SourceKind::Fixed(f) => f.consumed,
            SourceKind::Backend(b) => b.at_end(),
            SourceKind::Merge(m) => m.at_end(),
        }
    }

    /// The current document; `None` at the end
    pub fn get(&self) -> Option<&Doc> {
        if self.at_end() {
            return None;
        }
        match &self.kind {
            SourceKind::Null => None,
            SourceKind::Fixed(f) => Some(&f.doc),
            SourceKind::Backend(b) => b.get(),
            SourceKind::Merge(m) => m.get(),
        }
    }

    /// Step to the next document, fetching more from the backends when
    /// the local batch runs out
    pub async fn advance(&mut self) -> Result<()> {
        if self.at_end() {
            return Ok(());
        }
        self.pos += 1;
        match &mut self.kind {
            SourceKind::Null => Ok(()),
            SourceKind::Fixed(f) => {
                f.consumed = true;
                Ok(())
            }
            SourceKind::Backend(b) => b.advance().await,
            SourceKind::Merge(m) => m.advance().await,
        }
    }

    /// Release everything gently (remote cursors killed, connections
    /// pooled). Idempotent; after this no `get`/`advance` is issued.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        match &mut self.kind {
            SourceKind::Null | SourceKind::Fixed(_) => {}
            SourceKind::Backend(b) => b.close().await,
            SourceKind::Merge(m) => m.close().await,
        }
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Endpoints whose connections this source currently holds
    pub fn used_endpoints(&self) -> Vec<Doc> {
        match &self.kind {
            SourceKind::Null | SourceKind::Fixed(_) => Vec::new(),
            SourceKind::Backend(b) => b.used_endpoints(),
            SourceKind::Merge(m) => m.used_endpoints(),
        }
    }

    /// One-line description for the session log
    pub fn describe(&self) -> String {
        match &self.kind {
            SourceKind::Fixed(f) => f.doc.to_string(),
            _ => {
                if self.at_end() {
                    format!("at pos {}, EOF", self.pos)
                } else {
                    format!("at pos {}, cursor {}", self.pos, self.id)
                }
            }
        }
    }
}

/// Order two documents under a `$orderby` specification: field by field,
/// each direction given by the sign of its value; missing fields compare
/// as nulls.
pub(crate) fn cmp_order(a: &Doc, b: &Doc, order_by: &Doc) -> std::cmp::Ordering {
    use std::cmp::Ordering;

    for (field, dir) in order_by.iter() {
        let va = a.get(field).unwrap_or(&Value::Null);
        let vb = b.get(field).unwrap_or(&Value::Null);
        let ord = va.cmp(vb);
        if ord != Ordering::Equal {
            let descending = dir.as_i64().unwrap_or(1) < 0;
            return if descending { ord.reverse() } else { ord };
        }
    }
    Ordering::Equal
}
