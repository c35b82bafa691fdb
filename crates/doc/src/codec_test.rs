use bytes::BytesMut;

use crate::{array, decode_doc, doc, encode_doc, encoded_len, peek_doc_len, Doc, DocError, ObjectId, Value};

fn round_trip(d: &Doc) -> Doc {
    let mut buf = BytesMut::new();
    encode_doc(d, &mut buf);
    assert_eq!(buf.len(), encoded_len(d));
    assert_eq!(peek_doc_len(&buf), Some(buf.len()));
    decode_doc(&buf).unwrap()
}

#[test]
fn empty_doc() {
    let d = Doc::new();
    assert_eq!(round_trip(&d), d);
    assert_eq!(encoded_len(&d), 5);
}

#[test]
fn every_value_kind() {
    let d = doc! {
        "double" => 3.25,
        "i32" => 7,
        "i64" => 7_000_000_000i64,
        "str" => "héllo",
        "doc" => doc! { "nested" => doc! { "deep" => 1 } },
        "arr" => array![1, "two", doc! { "three" => 3 }],
        "bin" => Value::Binary(vec![0, 1, 2, 255]),
        "oid" => ObjectId::from_bytes(*b"abcdefghijkl"),
        "bool" => false,
        "date" => Value::DateTime(1_700_000_000_000),
        "ts" => Value::Timestamp(42),
        "null" => Value::Null,
        "min" => Value::MinKey,
        "max" => Value::MaxKey,
    };
    assert_eq!(round_trip(&d), d);
}

#[test]
fn array_of_eleven_elements_survives() {
    // Index names go two-digit past "9"
    let values: Vec<Value> = (0..11).map(Value::Int32).collect();
    let d = doc! { "a" => values };
    assert_eq!(round_trip(&d), d);
}

#[test]
fn truncated_input_is_an_error() {
    let mut buf = BytesMut::new();
    encode_doc(&doc! { "a" => 1, "b" => "text" }, &mut buf);
    for cut in 0..buf.len() - 1 {
        assert!(
            decode_doc(&buf[..cut]).is_err(),
            "decode of {cut}-byte prefix should fail"
        );
    }
}

#[test]
fn bad_type_tag_is_an_error() {
    let mut buf = BytesMut::new();
    encode_doc(&doc! { "a" => 1 }, &mut buf);
    buf[4] = 0x6E;
    assert!(matches!(decode_doc(&buf), Err(DocError::BadTypeTag(0x6E))));
}

#[test]
fn declared_length_below_minimum() {
    let buf = [3u8, 0, 0, 0, 0];
    assert!(matches!(decode_doc(&buf), Err(DocError::TooSmall(3))));
}

#[test]
fn oversized_declared_length() {
    let buf = [255u8, 255, 255, 255, 0];
    assert!(matches!(decode_doc(&buf), Err(DocError::TooLarge { .. })));
}

#[test]
fn trailing_bytes_are_ignored() {
    let mut buf = BytesMut::new();
    let d = doc! { "a" => 1 };
    encode_doc(&d, &mut buf);
    buf.extend_from_slice(b"junk");
    assert_eq!(decode_doc(&buf).unwrap(), d);
}
