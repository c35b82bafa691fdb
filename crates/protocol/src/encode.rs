//! Message building
//!
//! `MsgBuilder` is the raw assembler: a length placeholder followed by
//! whatever the caller pushes, patched on `finish`. `QueryBuilder` and
//! `ReplyBuilder` cover the two message shapes built in many places; the
//! `wire_*` helpers pack legacy single-sub-operation write messages.

use bytes::{BufMut, Bytes, BytesMut};
use keel_doc::{encode_doc, Doc};

use crate::decode::{Delete, DeleteSub, UpdateSub};
use crate::message::Opcode;
use crate::namespace::Namespace;

/// Raw message assembler with deferred length patching
pub struct MsgBuilder {
    buf: BytesMut,
}

impl Default for MsgBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl MsgBuilder {
    #[must_use]
    pub fn new() -> Self {
        let mut buf = BytesMut::with_capacity(128);
        buf.put_u32_le(0); // length, patched in finish()
        Self { buf }
    }

    /// Start a message with the standard header
    #[must_use]
    pub fn with_header(req_id: u32, response_to: u32, opcode: Opcode) -> Self {
        let mut b = Self::new();
        b.put_u32(req_id);
        b.put_u32(response_to);
        b.put_u32(opcode as u32);
        b
    }

    pub fn put_u32(&mut self, v: u32) -> &mut Self {
        self.buf.put_u32_le(v);
        self
    }

    pub fn put_i32(&mut self, v: i32) -> &mut Self {
        self.buf.put_i32_le(v);
        self
    }

    pub fn put_u64(&mut self, v: u64) -> &mut Self {
        self.buf.put_u64_le(v);
        self
    }

    pub fn put_cstring(&mut self, s: &str) -> &mut Self {
        self.buf.put_slice(s.as_bytes());
        self.buf.put_u8(0);
        self
    }

    pub fn put_doc(&mut self, doc: &Doc) -> &mut Self {
        encode_doc(doc, &mut self.buf);
        self
    }

    /// Raw pre-encoded bytes (already-encoded documents)
    pub fn put_raw(&mut self, raw: &[u8]) -> &mut Self {
        self.buf.put_slice(raw);
        self
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.len() == 4
    }

    /// Patch the length word and take the message
    pub fn finish(mut self) -> Bytes {
        let len = self.buf.len() as u32;
        self.buf[0..4].copy_from_slice(&len.to_le_bytes());
        self.buf.freeze()
    }
}

/// Composes QUERY messages toward backends
pub struct QueryBuilder {
    msg_id: u32,
    flags: u32,
    ns: Namespace,
    skip: i32,
    batch_size: i32,
    query: Doc,
    field_selector: Option<Doc>,
}

impl QueryBuilder {
    #[must_use]
    pub fn new(ns: Namespace, query: Doc) -> Self {
        Self {
            msg_id: 0,
            flags: 0,
            ns,
            skip: 0,
            batch_size: 0,
            query,
            field_selector: None,
        }
    }

    #[must_use]
    pub fn msg_id(mut self, id: u32) -> Self {
        self.msg_id = id;
        self
    }

    #[must_use]
    pub fn skip(mut self, skip: i32) -> Self {
        self.skip = skip;
        self
    }

    #[must_use]
    pub fn batch_size(mut self, n: i32) -> Self {
        self.batch_size = n;
        self
    }

    #[must_use]
    pub fn field_selector(mut self, sel: Option<Doc>) -> Self {
        self.field_selector = sel;
        self
    }

    #[must_use]
    pub fn slave_ok(mut self) -> Self {
        self.flags |= crate::decode::Query::SLAVE_OK;
        self
    }

    pub fn build(self) -> Bytes {
        // Commands want exactly one reply document
        let batch_size = if self.batch_size == 0 && self.ns.is_command() {
            1
        } else {
            self.batch_size
        };

        let mut b = MsgBuilder::with_header(self.msg_id, 0, Opcode::Query);
        b.put_u32(self.flags);
        b.put_cstring(self.ns.full());
        b.put_i32(self.skip);
        b.put_i32(batch_size);
        b.put_doc(&self.query);
        if let Some(sel) = &self.field_selector {
            if !sel.is_empty() {
                b.put_doc(sel);
            }
        }
        b.finish()
    }
}

/// Composes REPLY messages toward clients
pub struct ReplyBuilder {
    builder: MsgBuilder,
    count: u32,
    flags_at: usize,
    cursor_at: usize,
}

impl ReplyBuilder {
    #[must_use]
    pub fn new(response_to: u32) -> Self {
        let mut builder = MsgBuilder::with_header(0, response_to, Opcode::Reply);
        let flags_at = builder.len();
        builder.put_u32(0); // flags
        let cursor_at = builder.len();
        builder.put_u64(0); // cursor id
        builder.put_u32(0); // starting from
        builder.put_u32(0); // count, patched in finish
        Self {
            builder,
            count: 0,
            flags_at,
            cursor_at,
        }
    }

    pub fn set_flags(&mut self, flags: u32) {
        let at = self.flags_at;
        self.patch_u32(at, flags);
    }

    pub fn or_flags(&mut self, flags: u32) {
        let at = self.flags_at;
        let current = u32::from_le_bytes(self.builder.buf[at..at + 4].try_into().unwrap());
        self.patch_u32(at, current | flags);
    }

    pub fn set_cursor_id(&mut self, id: u64) {
        let at = self.cursor_at;
        self.builder.buf[at..at + 8].copy_from_slice(&id.to_le_bytes());
    }

    pub fn set_starting_from(&mut self, pos: u32) {
        let at = self.cursor_at + 8;
        self.patch_u32(at, pos);
    }

    pub fn push_doc(&mut self, doc: &Doc) {
        self.builder.put_doc(doc);
        self.count += 1;
    }

    /// Current total size, for enforcing the reply cap before pushing
    pub fn len(&self) -> usize {
        self.builder.len()
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn doc_count(&self) -> u32 {
        self.count
    }

    pub fn finish(mut self) -> Bytes {
        let at = self.cursor_at + 12;
        let count = self.count;
        self.patch_u32(at, count);
        self.builder.finish()
    }

    fn patch_u32(&mut self, at: usize, v: u32) {
        self.builder.buf[at..at + 4].copy_from_slice(&v.to_le_bytes());
    }
}

/// GET_MORE toward a backend
pub fn wire_get_more(req_id: u32, ns: &Namespace, cursor_id: u64) -> Bytes {
    let mut b = MsgBuilder::with_header(req_id, 0, Opcode::GetMore);
    b.put_u32(0);
    b.put_cstring(ns.full());
    b.put_i32(0); // batch size: backend default
    b.put_u64(cursor_id);
    b.finish()
}

/// KILL_CURSORS toward a backend
pub fn wire_kill_cursors(cursor_ids: &[u64]) -> Bytes {
    let mut b = MsgBuilder::with_header(0, 0, Opcode::KillCursors);
    b.put_u32(0);
    b.put_u32(cursor_ids.len() as u32);
    for id in cursor_ids {
        b.put_u64(*id);
    }
    b.finish()
}

/// Legacy single-document INSERT toward a backend
pub fn wire_insert(ns: &Namespace, docs: &[Doc]) -> Bytes {
    let mut b = MsgBuilder::with_header(0, 0, Opcode::Insert);
    b.put_u32(0);
    b.put_cstring(ns.full());
    for doc in docs {
        b.put_doc(doc);
    }
    b.finish()
}

/// Legacy UPDATE toward a backend
pub fn wire_update(ns: &Namespace, sub: &UpdateSub) -> Bytes {
    let mut flags = 0;
    if sub.upsert {
        flags |= crate::decode::Update::UPSERT;
    }
    if sub.multi {
        flags |= crate::decode::Update::MULTI;
    }

    let mut b = MsgBuilder::with_header(0, 0, Opcode::Update);
    b.put_u32(0);
    b.put_cstring(ns.full());
    b.put_u32(flags);
    b.put_doc(&sub.selector);
    b.put_doc(&sub.update);
    b.finish()
}

/// Legacy DELETE toward a backend
pub fn wire_delete(ns: &Namespace, sub: &DeleteSub) -> Bytes {
    let mut b = MsgBuilder::with_header(0, 0, Opcode::Delete);
    b.put_u32(0);
    b.put_cstring(ns.full());
    b.put_u32(if sub.limit == 1 { Delete::SINGLE } else { 0 });
    b.put_doc(&sub.selector);
    b.finish()
}
