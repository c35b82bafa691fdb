//! Binary document codec
//!
//! Layout: `i32` total length (little-endian, includes itself), a sequence
//! of elements `[type tag u8][cstring name][payload]`, and a terminating
//! zero byte. Arrays encode as documents with `"0"`, `"1"`, ... names.
//!
//! All reads are bounds-checked; malformed input yields `DocError`, never a
//! panic or an out-of-bounds access.

use bytes::{BufMut, BytesMut};

use crate::document::Doc;
use crate::error::DocError;
use crate::oid::ObjectId;
use crate::value::Value;
use crate::{Result, MAX_DOC_SIZE};

const TAG_DOUBLE: u8 = 0x01;
const TAG_STRING: u8 = 0x02;
const TAG_DOC: u8 = 0x03;
const TAG_ARRAY: u8 = 0x04;
const TAG_BINARY: u8 = 0x05;
const TAG_OBJECT_ID: u8 = 0x07;
const TAG_BOOL: u8 = 0x08;
const TAG_DATE_TIME: u8 = 0x09;
const TAG_NULL: u8 = 0x0A;
const TAG_INT32: u8 = 0x10;
const TAG_TIMESTAMP: u8 = 0x11;
const TAG_INT64: u8 = 0x12;
const TAG_MAX_KEY: u8 = 0x7F;
const TAG_MIN_KEY: u8 = 0xFF;

/// Smallest legal document: length word + terminator
const MIN_DOC_LEN: usize = 5;

/// Declared length of the document at the head of `buf`, once 4 bytes are
/// available. Does not validate the body.
pub fn peek_doc_len(buf: &[u8]) -> Option<usize> {
    if buf.len() < 4 {
        return None;
    }
    Some(u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize)
}

/// Total encoded size of `doc` in bytes
pub fn encoded_len(doc: &Doc) -> usize {
    4 + doc
        .iter()
        .map(|(name, value)| 1 + name.len() + 1 + payload_len(value))
        .sum::<usize>()
        + 1
}

fn payload_len(value: &Value) -> usize {
    match value {
        Value::Double(_) | Value::Int64(_) | Value::DateTime(_) | Value::Timestamp(_) => 8,
        Value::Int32(_) => 4,
        Value::String(s) => 4 + s.len() + 1,
        Value::Doc(d) => encoded_len(d),
        Value::Array(a) => encoded_array_len(a),
        Value::Binary(b) => 4 + 1 + b.len(),
        Value::ObjectId(_) => 12,
        Value::Bool(_) => 1,
        Value::Null | Value::MinKey | Value::MaxKey => 0,
    }
}

fn encoded_array_len(values: &[Value]) -> usize {
    4 + values
        .iter()
        .enumerate()
        .map(|(i, v)| 1 + index_name_len(i) + 1 + payload_len(v))
        .sum::<usize>()
        + 1
}

fn index_name_len(i: usize) -> usize {
    let mut len = 1;
    let mut i = i / 10;
    while i != 0 {
        len += 1;
        i /= 10;
    }
    len
}

/// Encode `doc` onto the end of `buf`
pub fn encode_doc(doc: &Doc, buf: &mut BytesMut) {
    buf.put_u32_le(encoded_len(doc) as u32);
    for (name, value) in doc.iter() {
        put_element(buf, name, value);
    }
    buf.put_u8(0);
}

fn put_element(buf: &mut BytesMut, name: &str, value: &Value) {
    buf.put_u8(type_tag(value));
    buf.put_slice(name.as_bytes());
    buf.put_u8(0);
    put_payload(buf, value);
}

fn type_tag(value: &Value) -> u8 {
    match value {
        Value::Double(_) => TAG_DOUBLE,
        Value::String(_) => TAG_STRING,
        Value::Doc(_) => TAG_DOC,
        Value::Array(_) => TAG_ARRAY,
        Value::Binary(_) => TAG_BINARY,
        Value::ObjectId(_) => TAG_OBJECT_ID,
        Value::Bool(_) => TAG_BOOL,
        Value::DateTime(_) => TAG_DATE_TIME,
        Value::Null => TAG_NULL,
        Value::Int32(_) => TAG_INT32,
        Value::Timestamp(_) => TAG_TIMESTAMP,
        Value::Int64(_) => TAG_INT64,
        Value::MaxKey => TAG_MAX_KEY,
        Value::MinKey => TAG_MIN_KEY,
    }
}

/// Value payload without tag or name. Shared with the key digest, which
/// hashes exactly these bytes for non-numeric values.
pub(crate) fn put_payload(buf: &mut BytesMut, value: &Value) {
    match value {
        Value::Double(v) => buf.put_f64_le(*v),
        Value::Int32(v) => buf.put_i32_le(*v),
        Value::Int64(v) => buf.put_i64_le(*v),
        Value::DateTime(v) => buf.put_i64_le(*v),
        Value::Timestamp(v) => buf.put_u64_le(*v),
        Value::String(s) => {
            buf.put_u32_le(s.len() as u32 + 1);
            buf.put_slice(s.as_bytes());
            buf.put_u8(0);
        }
        Value::Doc(d) => encode_doc(d, buf),
        Value::Array(a) => {
            buf.put_u32_le(encoded_array_len(a) as u32);
            for (i, v) in a.iter().enumerate() {
                buf.put_u8(type_tag(v));
                buf.put_slice(i.to_string().as_bytes());
                buf.put_u8(0);
                put_payload(buf, v);
            }
            buf.put_u8(0);
        }
        Value::Binary(b) => {
            buf.put_u32_le(b.len() as u32);
            buf.put_u8(0);
            buf.put_slice(b);
        }
        Value::ObjectId(id) => buf.put_slice(id.bytes()),
        Value::Bool(b) => buf.put_u8(*b as u8),
        Value::Null | Value::MinKey | Value::MaxKey => {}
    }
}

/// Decode one document from `buf`, which must contain the whole declared
/// length. Trailing bytes beyond the declared length are ignored.
pub fn decode_doc(buf: &[u8]) -> Result<Doc> {
    let mut r = Reader::over(buf)?;
    r.read_doc_body()
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn over(buf: &'a [u8]) -> Result<Self> {
        let len = peek_doc_len(buf).ok_or(DocError::truncated(4, buf.len()))?;
        if len < MIN_DOC_LEN {
            return Err(DocError::TooSmall(len));
        }
        if len > MAX_DOC_SIZE {
            return Err(DocError::TooLarge {
                size: len,
                limit: MAX_DOC_SIZE,
            });
        }
        if buf.len() < len {
            return Err(DocError::truncated(len, buf.len()));
        }
        Ok(Self {
            buf: &buf[..len],
            pos: 4,
        })
    }

    fn read_doc_body(&mut self) -> Result<Doc> {
        let mut doc = Doc::new();
        loop {
            let tag = self.u8()?;
            if tag == 0 {
                break;
            }
            let name = self.cstring()?;
            let value = self.value(tag)?;
            doc.push(name, value);
        }
        Ok(doc)
    }

    fn value(&mut self, tag: u8) -> Result<Value> {
        Ok(match tag {
            TAG_DOUBLE => Value::Double(f64::from_le_bytes(self.array()?)),
            TAG_INT32 => Value::Int32(i32::from_le_bytes(self.array()?)),
            TAG_INT64 => Value::Int64(i64::from_le_bytes(self.array()?)),
            TAG_DATE_TIME => Value::DateTime(i64::from_le_bytes(self.array()?)),
            TAG_TIMESTAMP => Value::Timestamp(u64::from_le_bytes(self.array()?)),
            TAG_STRING => {
                let len = self.u32()? as usize;
                if len == 0 {
                    return Err(DocError::TooSmall(0));
                }
                let raw = self.bytes(len)?;
                let s = std::str::from_utf8(&raw[..len - 1])
                    .map_err(|_| DocError::BadUtf8("string payload"))?;
                Value::String(s.to_owned())
            }
            TAG_DOC => Value::Doc(self.nested()?),
            TAG_ARRAY => {
                let nested = self.nested()?;
                Value::Array(nested.into_fields().into_iter().map(|(_, v)| v).collect())
            }
            TAG_BINARY => {
                let len = self.u32()? as usize;
                self.u8()?; // subtype, unused
                Value::Binary(self.bytes(len)?.to_vec())
            }
            TAG_OBJECT_ID => Value::ObjectId(ObjectId::from_bytes(self.array()?)),
            TAG_BOOL => Value::Bool(self.u8()? != 0),
            TAG_NULL => Value::Null,
            TAG_MIN_KEY => Value::MinKey,
            TAG_MAX_KEY => Value::MaxKey,
            other => return Err(DocError::BadTypeTag(other)),
        })
    }

    fn nested(&mut self) -> Result<Doc> {
        let remaining = &self.buf[self.pos..];
        let len = peek_doc_len(remaining).ok_or(DocError::truncated(4, remaining.len()))?;
        let mut inner = Reader::over(remaining)?;
        let doc = inner.read_doc_body()?;
        self.pos += len;
        Ok(doc)
    }

    fn u8(&mut self) -> Result<u8> {
        let b = *self
            .buf
            .get(self.pos)
            .ok_or(DocError::MissingTerminator)?;
        self.pos += 1;
        Ok(b)
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.pos + len > self.buf.len() {
            return Err(DocError::truncated(len, self.buf.len() - self.pos));
        }
        let out = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let raw = self.bytes(N)?;
        Ok(raw.try_into().expect("length checked"))
    }

    fn cstring(&mut self) -> Result<String> {
        let start = self.pos;
        let end = self.buf[start..]
            .iter()
            .position(|&b| b == 0)
            .map(|i| start + i)
            .ok_or(DocError::MissingTerminator)?;
        let s = std::str::from_utf8(&self.buf[start..end])
            .map_err(|_| DocError::BadUtf8("field name"))?
            .to_owned();
        self.pos = end + 1;
        Ok(s)
    }
}
