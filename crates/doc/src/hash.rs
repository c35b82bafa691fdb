//! Canonical key digest for hashed sharding
//!
//! The router hashes a key value before range lookup when a collection uses
//! a hashed sharding key. The digest must be stable across releases and
//! identical for numerically equal values regardless of representation, so
//! Int32/Int64/Double collapse into a single 64-bit integer path: NaN
//! hashes as 0, fractions truncate, out-of-range doubles saturate at the
//! i64 bounds. Everything else hashes its encoded payload bytes.

use bytes::BytesMut;
use sha2::{Digest, Sha256};

use crate::codec;
use crate::document::Doc;
use crate::value::Value;

/// Digest a key value down to a signed 64-bit hash
pub fn hashed_key(value: &Value) -> i64 {
    let mut ctx = Sha256::new();
    ctx.update(0i32.to_le_bytes()); // seed
    hash_type(&mut ctx, value);
    hash_value(&mut ctx, value);

    let digest = ctx.finalize();
    i64::from_le_bytes(digest[..8].try_into().expect("digest is 32 bytes"))
}

/// Type code folded into the digest ahead of every value, so values of
/// different types never collide by payload alone
fn hash_type(ctx: &mut Sha256, value: &Value) {
    let code: i32 = match value {
        Value::MinKey => -1,
        Value::MaxKey => 127,
        Value::Null => 5,
        Value::Double(_) | Value::Int32(_) | Value::Int64(_) => 10,
        Value::String(_) => 15,
        Value::Doc(_) => 20,
        Value::Array(_) => 25,
        Value::Binary(_) => 30,
        Value::ObjectId(_) => 35,
        Value::Bool(_) => 40,
        Value::DateTime(_) => 45,
        Value::Timestamp(_) => 47,
    };
    ctx.update(code.to_le_bytes());
}

fn hash_value(ctx: &mut Sha256, value: &Value) {
    match value {
        Value::Doc(d) => hash_doc(ctx, d),
        Value::Array(a) => {
            for (i, v) in a.iter().enumerate() {
                hash_type(ctx, v);
                ctx.update(i.to_string().as_bytes());
                ctx.update([0u8]);
                hash_value(ctx, v);
            }
            ctx.update(0i32.to_le_bytes());
        }
        Value::Double(v) => ctx.update(collapse_double(*v).to_le_bytes()),
        Value::Int32(v) => ctx.update((*v as i64).to_le_bytes()),
        Value::Int64(v) => ctx.update(v.to_le_bytes()),
        other => {
            let mut payload = BytesMut::new();
            codec::put_payload(&mut payload, other);
            ctx.update(&payload);
        }
    }
}

fn hash_doc(ctx: &mut Sha256, doc: &Doc) {
    for (name, v) in doc.iter() {
        hash_type(ctx, v);
        ctx.update(name.as_bytes());
        ctx.update([0u8]);
        hash_value(ctx, v);
    }
    ctx.update(0i32.to_le_bytes());
}

fn collapse_double(v: f64) -> i64 {
    if v.is_nan() {
        0
    } else if v < i64::MIN as f64 {
        i64::MIN
    } else if v > i64::MAX as f64 {
        i64::MAX
    } else {
        v as i64
    }
}
