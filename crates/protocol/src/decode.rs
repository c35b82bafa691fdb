//! Typed message parsing
//!
//! One parser per opcode, all working through a bounds-checked cursor over
//! the message body. Write messages additionally parse from their command
//! form (`{update: "coll", updates: [...]}`), which shares sub-operation
//! shapes with the wire form.

use keel_doc::{decode_doc, peek_doc_len, Doc, Value};

use crate::message::RawMessage;
use crate::namespace::Namespace;
use crate::{ProtocolError, Result};

/// Bounds-checked cursor over a message body
struct BodyReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> BodyReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn at_end(&self) -> bool {
        self.pos == self.buf.len()
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4, "u32")?.try_into().unwrap()))
    }

    fn i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.take(4, "i32")?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8, "u64")?.try_into().unwrap()))
    }

    fn cstring(&mut self) -> Result<&'a str> {
        let rest = &self.buf[self.pos..];
        let nul = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or(ProtocolError::truncated("cstring"))?;
        let s = std::str::from_utf8(&rest[..nul])
            .map_err(|_| ProtocolError::BadMessage("cstring is not UTF-8"))?;
        self.pos += nul + 1;
        Ok(s)
    }

    fn namespace(&mut self) -> Result<Namespace> {
        Namespace::parse(self.cstring()?)
    }

    fn doc(&mut self) -> Result<Doc> {
        let rest = &self.buf[self.pos..];
        let len = peek_doc_len(rest).ok_or(ProtocolError::truncated("document"))?;
        if rest.len() < len {
            return Err(ProtocolError::truncated("document"));
        }
        let doc = decode_doc(&rest[..len])?;
        self.pos += len;
        Ok(doc)
    }

    fn take(&mut self, n: usize, what: &'static str) -> Result<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(ProtocolError::Truncated { what });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }
}

/// The default write concern patched onto batches that do not carry one
fn patch_write_concern(concern: Option<&Doc>) -> Doc {
    match concern {
        None => Doc::new().field("w", 1),
        Some(c) if c.contains("w") => c.clone(),
        Some(c) => {
            let mut out = Doc::with_capacity(c.len() + 1);
            out.push("w", 1);
            for (name, value) in c.iter() {
                out.push(name, value.clone());
            }
            out
        }
    }
}

/// A query as received from a client (or composed toward a backend)
#[derive(Debug, Clone)]
pub struct Query {
    pub flags: u32,
    pub ns: Namespace,
    pub n_to_skip: u32,
    pub n_to_return: i32,
    pub query: Doc,
    pub field_selector: Option<Doc>,
    /// The selector part: either the whole query document, or its wrapped
    /// `query`/`$query` field
    pub criteria: Doc,
    /// The wrapper document carrying `$orderby`, `$readPreference`, ...;
    /// empty when the query was not wrapped
    pub properties: Doc,
}

impl Query {
    pub const TAILABLE: u32 = 0x02;
    pub const SLAVE_OK: u32 = 0x04;
    pub const NO_TIMEOUT: u32 = 0x10;
    pub const AWAIT_DATA: u32 = 0x20;
    pub const EXHAUST: u32 = 0x40;
    pub const PARTIAL: u32 = 0x80;

    pub fn parse(msg: &RawMessage) -> Result<Self> {
        let mut r = BodyReader::new(&msg.body);
        let flags = r.u32()?;
        let ns = r.namespace()?;
        let n_to_skip = r.u32()?;
        let n_to_return = r.i32()?;
        let query = r.doc()?;
        let field_selector = if r.at_end() { None } else { Some(r.doc()?) };
        Ok(Self::assemble(flags, ns, n_to_skip, n_to_return, query, field_selector))
    }

    /// Compose a query that did not come off the wire (internal commands,
    /// aggregations)
    pub fn synthetic(ns: Namespace, query: Doc) -> Self {
        Self::assemble(0, ns, 0, 0, query, None)
    }

    fn assemble(
        flags: u32,
        ns: Namespace,
        n_to_skip: u32,
        n_to_return: i32,
        query: Doc,
        field_selector: Option<Doc>,
    ) -> Self {
        let wrapped = matches!(query.front(), Some((name, _)) if name == "query" || name == "$query");
        let (criteria, properties) = if wrapped {
            let criteria = query
                .front()
                .and_then(|(_, v)| v.as_doc())
                .cloned()
                .unwrap_or_default();
            (criteria, query.clone())
        } else {
            (query.clone(), Doc::new())
        };

        Self {
            flags,
            ns,
            n_to_skip,
            n_to_return,
            query,
            field_selector,
            criteria,
            properties,
        }
    }

    pub fn read_preference(&self) -> Option<&Doc> {
        self.properties.get_doc("$readPreference")
    }

    pub fn order_by(&self) -> Option<&Doc> {
        self.properties.get_doc("$orderby")
    }

    /// Read preference asks for something other than the primary
    pub fn wants_secondary(&self) -> bool {
        match self.read_preference() {
            Some(pref) => pref.get_str("mode").unwrap_or("primary") != "primary",
            None => self.flags & Self::SLAVE_OK != 0,
        }
    }
}

/// One update sub-operation
#[derive(Debug, Clone)]
pub struct UpdateSub {
    pub selector: Doc,
    pub update: Doc,
    pub upsert: bool,
    pub multi: bool,
}

/// An update batch
#[derive(Debug, Clone)]
pub struct Update {
    pub ns: Namespace,
    pub subops: Vec<UpdateSub>,
    pub ordered: bool,
    pub write_concern: Doc,
}

impl Update {
    /// Wire flag: insert the document if no match
    pub const UPSERT: u32 = 0x01;
    /// Wire flag: update every match, not just the first
    pub const MULTI: u32 = 0x02;

    pub fn parse(msg: &RawMessage) -> Result<Self> {
        let mut r = BodyReader::new(&msg.body);
        let _zero = r.u32()?;
        let ns = r.namespace()?;
        let flags = r.u32()?;
        let selector = r.doc()?;
        let update = r.doc()?;
        Ok(Self {
            ns,
            subops: vec![UpdateSub {
                selector,
                update,
                upsert: flags & Self::UPSERT != 0,
                multi: flags & Self::MULTI != 0,
            }],
            ordered: false,
            write_concern: Doc::new(),
        })
    }

    /// Command form: `{update: <coll>, updates: [{q, u, upsert, multi}], ...}`
    pub fn from_command(db: &str, cmd: &Doc) -> Result<Self> {
        let coll = cmd
            .get_str("update")
            .ok_or(ProtocolError::BadMessage("update command without collection"))?;
        let mut subops = Vec::new();
        for entry in cmd.get_array("updates").unwrap_or(&[]) {
            let obj = entry
                .as_doc()
                .ok_or(ProtocolError::BadMessage("update entry is not a document"))?;
            subops.push(UpdateSub {
                selector: obj.get_doc("q").cloned().unwrap_or_default(),
                update: obj.get_doc("u").cloned().unwrap_or_default(),
                upsert: obj.get_bool("upsert").unwrap_or(false),
                multi: obj.get_bool("multi").unwrap_or(false),
            });
        }
        Ok(Self {
            ns: Namespace::new(db, coll),
            subops,
            ordered: cmd.get_bool("ordered").unwrap_or(true),
            write_concern: patch_write_concern(cmd.get_doc("writeConcern")),
        })
    }
}

/// An insert batch; sub-operations are the documents themselves
#[derive(Debug, Clone)]
pub struct Insert {
    pub ns: Namespace,
    pub subops: Vec<Doc>,
    pub ordered: bool,
    pub write_concern: Doc,
}

impl Insert {
    pub const CONTINUE_ON_ERROR: u32 = 0x01;

    pub fn parse(msg: &RawMessage) -> Result<Self> {
        let mut r = BodyReader::new(&msg.body);
        let flags = r.u32()?;
        let ns = r.namespace()?;
        let mut subops = Vec::new();
        while !r.at_end() {
            subops.push(r.doc()?);
        }
        if subops.is_empty() {
            return Err(ProtocolError::BadMessage("insert without documents"));
        }
        Ok(Self {
            ns,
            subops,
            ordered: flags & Self::CONTINUE_ON_ERROR != 0,
            write_concern: Doc::new(),
        })
    }

    /// Command form: `{insert: <coll>, documents: [...], ...}`
    pub fn from_command(db: &str, cmd: &Doc) -> Result<Self> {
        let coll = cmd
            .get_str("insert")
            .ok_or(ProtocolError::BadMessage("insert command without collection"))?;
        let mut subops = Vec::new();
        for entry in cmd.get_array("documents").unwrap_or(&[]) {
            match entry {
                Value::Doc(d) => subops.push(d.clone()),
                _ => return Err(ProtocolError::BadMessage("insert entry is not a document")),
            }
        }
        Ok(Self {
            ns: Namespace::new(db, coll),
            subops,
            ordered: cmd.get_bool("ordered").unwrap_or(true),
            write_concern: patch_write_concern(cmd.get_doc("writeConcern")),
        })
    }
}

/// One delete sub-operation; `limit` is 0 (all matches) or 1
#[derive(Debug, Clone)]
pub struct DeleteSub {
    pub selector: Doc,
    pub limit: u32,
}

/// A delete batch
#[derive(Debug, Clone)]
pub struct Delete {
    pub ns: Namespace,
    pub subops: Vec<DeleteSub>,
    pub ordered: bool,
    pub write_concern: Doc,
}

impl Delete {
    /// Wire flag: remove only the first match
    pub const SINGLE: u32 = 0x01;

    pub fn parse(msg: &RawMessage) -> Result<Self> {
        let mut r = BodyReader::new(&msg.body);
        let _zero = r.u32()?;
        let ns = r.namespace()?;
        let flags = r.u32()?;
        let selector = r.doc()?;
        Ok(Self {
            ns,
            subops: vec![DeleteSub {
                selector,
                limit: if flags & Self::SINGLE != 0 { 1 } else { 0 },
            }],
            ordered: false,
            write_concern: Doc::new(),
        })
    }

    /// Command form: `{delete: <coll>, deletes: [{q, limit}], ...}`
    pub fn from_command(db: &str, cmd: &Doc) -> Result<Self> {
        let coll = cmd
            .get_str("delete")
            .ok_or(ProtocolError::BadMessage("delete command without collection"))?;
        let mut subops = Vec::new();
        for entry in cmd.get_array("deletes").unwrap_or(&[]) {
            let obj = entry
                .as_doc()
                .ok_or(ProtocolError::BadMessage("delete entry is not a document"))?;
            subops.push(DeleteSub {
                selector: obj.get_doc("q").cloned().unwrap_or_default(),
                limit: obj.get_i64("limit").unwrap_or(0) as u32,
            });
        }
        Ok(Self {
            ns: Namespace::new(db, coll),
            subops,
            ordered: cmd.get_bool("ordered").unwrap_or(true),
            write_concern: patch_write_concern(cmd.get_doc("writeConcern")),
        })
    }
}

/// Cursor continuation
#[derive(Debug, Clone)]
pub struct GetMore {
    pub ns: Namespace,
    pub n_to_return: i32,
    pub cursor_id: u64,
}

impl GetMore {
    pub fn parse(msg: &RawMessage) -> Result<Self> {
        let mut r = BodyReader::new(&msg.body);
        let _zero = r.u32()?;
        let ns = r.namespace()?;
        let n_to_return = r.i32()?;
        let cursor_id = r.u64()?;
        Ok(Self {
            ns,
            n_to_return,
            cursor_id,
        })
    }
}

/// Cursor disposal
#[derive(Debug, Clone)]
pub struct KillCursors {
    pub cursor_ids: Vec<u64>,
}

impl KillCursors {
    pub fn parse(msg: &RawMessage) -> Result<Self> {
        let mut r = BodyReader::new(&msg.body);
        let _zero = r.u32()?;
        let count = r.u32()?;
        let mut cursor_ids = Vec::with_capacity(count.min(1024) as usize);
        for _ in 0..count {
            cursor_ids.push(r.u64()?);
        }
        Ok(Self { cursor_ids })
    }
}

/// A reply as read off a backend stream
#[derive(Debug, Clone)]
pub struct Reply {
    pub flags: u32,
    pub cursor_id: u64,
    pub starting_from: u32,
    pub documents: Vec<Doc>,
}

impl Reply {
    pub const CURSOR_NOT_FOUND: u32 = 0x01;
    pub const QUERY_FAILURE: u32 = 0x02;
    pub const SHARD_CONFIG_STALE: u32 = 0x04;
    pub const AWAIT_CAPABLE: u32 = 0x08;

    pub fn parse(msg: &RawMessage) -> Result<Self> {
        let mut r = BodyReader::new(&msg.body);
        let flags = r.u32()?;
        let cursor_id = r.u64()?;
        let starting_from = r.u32()?;
        let count = r.u32()?;
        let mut documents = Vec::with_capacity(count.min(4096) as usize);
        for _ in 0..count {
            documents.push(r.doc()?);
        }
        Ok(Self {
            flags,
            cursor_id,
            starting_from,
            documents,
        })
    }
}
