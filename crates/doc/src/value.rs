//! Dynamic values with one canonical total order
//!
//! Every pair of values compares, including across types, by canonical type
//! rank first: MinKey < Null < numbers < String < Doc < Array < Binary <
//! ObjectId < Bool < DateTime < Timestamp < MaxKey. Int32/Int64/Double
//! compare numerically against each other. NaN sorts below every other
//! number and equals itself, keeping the order total.

use std::cmp::Ordering;
use std::fmt;

use crate::document::Doc;
use crate::oid::ObjectId;

/// A dynamically typed document value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Sorts below everything; used as an open lower chunk bound
    MinKey,
    Null,
    Double(f64),
    Int32(i32),
    Int64(i64),
    String(String),
    Doc(Doc),
    Array(Vec<Value>),
    Binary(Vec<u8>),
    ObjectId(ObjectId),
    Bool(bool),
    /// Milliseconds since the unix epoch
    DateTime(i64),
    /// An opaque 64-bit sequence (replication optimes, chunk stamps)
    Timestamp(u64),
    /// Sorts above everything; used as an open upper chunk bound
    MaxKey,
}

impl Value {
    /// Canonical cross-type rank; all numeric variants share one rank
    pub fn type_rank(&self) -> u8 {
        match self {
            Value::MinKey => 0,
            Value::Null => 1,
            Value::Double(_) | Value::Int32(_) | Value::Int64(_) => 2,
            Value::String(_) => 3,
            Value::Doc(_) => 4,
            Value::Array(_) => 5,
            Value::Binary(_) => 6,
            Value::ObjectId(_) => 7,
            Value::Bool(_) => 8,
            Value::DateTime(_) => 9,
            Value::Timestamp(_) => 10,
            Value::MaxKey => 11,
        }
    }

    /// Short type name for diagnostics
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::MinKey => "minKey",
            Value::Null => "null",
            Value::Double(_) => "double",
            Value::Int32(_) => "int32",
            Value::Int64(_) => "int64",
            Value::String(_) => "string",
            Value::Doc(_) => "document",
            Value::Array(_) => "array",
            Value::Binary(_) => "binary",
            Value::ObjectId(_) => "objectId",
            Value::Bool(_) => "bool",
            Value::DateTime(_) => "dateTime",
            Value::Timestamp(_) => "timestamp",
            Value::MaxKey => "maxKey",
        }
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    #[inline]
    pub fn is_number(&self) -> bool {
        matches!(self, Value::Double(_) | Value::Int32(_) | Value::Int64(_))
    }

    /// Integer view; accepts Int32, Int64, Bool and fraction-free Doubles
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Value::Int32(v) => Some(v as i64),
            Value::Int64(v) => Some(v),
            Value::Bool(v) => Some(v as i64),
            Value::Double(v) if v.fract() == 0.0 && v >= i64::MIN as f64 && v <= i64::MAX as f64 => {
                Some(v as i64)
            }
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Value::Double(v) => Some(v),
            Value::Int32(v) => Some(v as f64),
            Value::Int64(v) => Some(v as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_doc(&self) -> Option<&Doc> {
        match self {
            Value::Doc(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match *self {
            Value::Bool(b) => Some(b),
            _ => None,
        }
    }
}

impl Eq for Value {}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        let (ra, rb) = (self.type_rank(), other.type_rank());
        if ra != rb {
            return ra.cmp(&rb);
        }

        match (self, other) {
            (Value::MinKey, Value::MinKey)
            | (Value::Null, Value::Null)
            | (Value::MaxKey, Value::MaxKey) => Ordering::Equal,

            (a, b) if a.is_number() && b.is_number() => cmp_numbers(a, b),

            (Value::String(a), Value::String(b)) => a.cmp(b),
            (Value::Doc(a), Value::Doc(b)) => cmp_docs(a, b),
            (Value::Array(a), Value::Array(b)) => cmp_slices(a, b),
            (Value::Binary(a), Value::Binary(b)) => a.len().cmp(&b.len()).then_with(|| a.cmp(b)),
            (Value::ObjectId(a), Value::ObjectId(b)) => a.cmp(b),
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::DateTime(a), Value::DateTime(b)) => a.cmp(b),
            (Value::Timestamp(a), Value::Timestamp(b)) => a.cmp(b),

            _ => unreachable!("equal ranks imply equal shapes"),
        }
    }
}

impl PartialOrd for Value {
    #[inline]
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Numeric comparison across Int32/Int64/Double. Integer pairs compare
/// exactly; anything involving a Double goes through f64, with NaN below
/// every other number and equal to itself.
fn cmp_numbers(a: &Value, b: &Value) -> Ordering {
    if let (Value::Double(x), y) = (a, b) {
        return cmp_f64(*x, y.as_f64().unwrap());
    }
    if let (x, Value::Double(y)) = (a, b) {
        return cmp_f64(x.as_f64().unwrap(), *y);
    }
    a.as_i64().unwrap().cmp(&b.as_i64().unwrap())
}

fn cmp_f64(a: f64, b: f64) -> Ordering {
    a.partial_cmp(&b).unwrap_or_else(|| match (a.is_nan(), b.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => unreachable!(),
    })
}

pub(crate) fn cmp_docs(a: &Doc, b: &Doc) -> Ordering {
    for ((na, va), (nb, vb)) in a.iter().zip(b.iter()) {
        let ord = va
            .type_rank()
            .cmp(&vb.type_rank())
            .then_with(|| na.cmp(nb))
            .then_with(|| va.cmp(vb));
        if ord != Ordering::Equal {
            return ord;
        }
    }
    a.len().cmp(&b.len())
}

fn cmp_slices(a: &[Value], b: &[Value]) -> Ordering {
    for (va, vb) in a.iter().zip(b.iter()) {
        let ord = va.cmp(vb);
        if ord != Ordering::Equal {
            return ord;
        }
    }
    a.len().cmp(&b.len())
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::MinKey => f.write_str("MinKey"),
            Value::Null => f.write_str("null"),
            Value::Double(v) => write!(f, "{v}"),
            Value::Int32(v) => write!(f, "{v}"),
            Value::Int64(v) => write!(f, "{v}"),
            Value::String(s) => write!(f, "{s:?}"),
            Value::Doc(d) => write!(f, "{d}"),
            Value::Array(a) => {
                f.write_str("[")?;
                for (i, v) in a.iter().enumerate() {
                    if i != 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{v}")?;
                }
                f.write_str("]")
            }
            Value::Binary(b) => write!(f, "Binary({} bytes)", b.len()),
            Value::ObjectId(id) => write!(f, "ObjectId({id})"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::DateTime(ms) => write!(f, "Date({ms})"),
            Value::Timestamp(ts) => write!(f, "Timestamp({ts})"),
            Value::MaxKey => f.write_str("MaxKey"),
        }
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int64(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<Doc> for Value {
    fn from(v: Doc) -> Self {
        Value::Doc(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::Array(v)
    }
}

impl From<ObjectId> for Value {
    fn from(v: ObjectId) -> Self {
        Value::ObjectId(v)
    }
}
