use bytes::Bytes;
use keel_doc::{doc, Doc};

use crate::{
    Delete, GetMore, Insert, MsgBuilder, MsgHeader, Opcode, ProtocolError, Query, RawMessage,
    Update, HEADER_LEN, MAX_MESSAGE_SIZE,
};

fn frame(req_id: u32, opcode: Opcode, body: impl FnOnce(&mut MsgBuilder)) -> RawMessage {
    let mut b = MsgBuilder::with_header(req_id, 0, opcode);
    body(&mut b);
    RawMessage::parse(b.finish()).unwrap()
}

#[test]
fn header_rejects_undersized_and_oversized() {
    let mut raw = [0u8; HEADER_LEN];
    raw[0..4].copy_from_slice(&8u32.to_le_bytes());
    assert!(matches!(
        MsgHeader::parse(&raw),
        Err(ProtocolError::TooShort { size: 8 })
    ));

    raw[0..4].copy_from_slice(&((MAX_MESSAGE_SIZE as u32) + 1).to_le_bytes());
    raw[12..16].copy_from_slice(&2004u32.to_le_bytes());
    assert!(matches!(
        MsgHeader::parse(&raw),
        Err(ProtocolError::TooLong { .. })
    ));
}

#[test]
fn header_rejects_unknown_opcode() {
    let mut raw = [0u8; HEADER_LEN];
    raw[0..4].copy_from_slice(&(HEADER_LEN as u32).to_le_bytes());
    raw[12..16].copy_from_slice(&1234u32.to_le_bytes());
    assert!(matches!(
        MsgHeader::parse(&raw),
        Err(ProtocolError::BadOpcode(1234))
    ));
}

#[test]
fn query_bare_criteria() {
    let msg = frame(7, Opcode::Query, |b| {
        b.put_u32(Query::SLAVE_OK);
        b.put_cstring("app.users");
        b.put_u32(5);
        b.put_i32(-20);
        b.put_doc(&doc! { "userId" => 42 });
    });
    let q = Query::parse(&msg).unwrap();
    assert_eq!(q.flags, Query::SLAVE_OK);
    assert_eq!(q.ns.full(), "app.users");
    assert_eq!(q.n_to_skip, 5);
    assert_eq!(q.n_to_return, -20);
    assert_eq!(q.criteria, doc! { "userId" => 42 });
    assert!(q.properties.is_empty());
    assert!(q.field_selector.is_none());
    assert!(q.wants_secondary());
}

#[test]
fn query_wrapped_criteria_and_properties() {
    let wrapped = doc! {
        "$query" => doc! { "age" => 30 },
        "$orderby" => doc! { "userId" => 1 },
        "$readPreference" => doc! { "mode" => "secondaryPreferred" },
    };
    let msg = frame(8, Opcode::Query, |b| {
        b.put_u32(0);
        b.put_cstring("app.users");
        b.put_u32(0);
        b.put_i32(0);
        b.put_doc(&wrapped);
        b.put_doc(&doc! { "name" => 1 });
    });
    let q = Query::parse(&msg).unwrap();
    assert_eq!(q.criteria, doc! { "age" => 30 });
    assert_eq!(q.order_by(), Some(&doc! { "userId" => 1 }));
    assert_eq!(
        q.read_preference().unwrap().get_str("mode"),
        Some("secondaryPreferred")
    );
    assert_eq!(q.field_selector, Some(doc! { "name" => 1 }));
    assert!(q.wants_secondary());
}

#[test]
fn update_wire_flags() {
    let msg = frame(9, Opcode::Update, |b| {
        b.put_u32(0);
        b.put_cstring("app.users");
        b.put_u32(Update::UPSERT | Update::MULTI);
        b.put_doc(&doc! { "userId" => 1 });
        b.put_doc(&doc! { "$set" => doc! { "x" => 1 } });
    });
    let upd = Update::parse(&msg).unwrap();
    assert_eq!(upd.subops.len(), 1);
    assert!(upd.subops[0].upsert);
    assert!(upd.subops[0].multi);
}

#[test]
fn update_command_patches_write_concern() {
    let cmd = doc! {
        "update" => "users",
        "updates" => vec![keel_doc::Value::Doc(doc! {
            "q" => doc! { "userId" => 1 },
            "u" => doc! { "$set" => doc! { "x" => 1 } },
        })],
        "writeConcern" => doc! { "j" => true },
    };
    let upd = Update::from_command("app", &cmd).unwrap();
    assert_eq!(upd.ns.full(), "app.users");
    assert!(upd.ordered);
    // Missing `w` defaults in, ahead of the other keys
    assert_eq!(upd.write_concern.front().unwrap().0, "w");
    assert_eq!(upd.write_concern.get_bool("j"), Some(true));
}

#[test]
fn insert_reads_documents_to_end() {
    let msg = frame(10, Opcode::Insert, |b| {
        b.put_u32(0);
        b.put_cstring("app.users");
        b.put_doc(&doc! { "a" => 1 });
        b.put_doc(&doc! { "b" => 2 });
        b.put_doc(&doc! { "c" => 3 });
    });
    let ins = Insert::parse(&msg).unwrap();
    assert_eq!(ins.subops.len(), 3);
    assert_eq!(ins.subops[2], doc! { "c" => 3 });
}

#[test]
fn insert_without_documents_is_bad() {
    let msg = frame(11, Opcode::Insert, |b| {
        b.put_u32(0);
        b.put_cstring("app.users");
    });
    assert!(Insert::parse(&msg).is_err());
}

#[test]
fn delete_single_flag_is_limit_one() {
    let msg = frame(12, Opcode::Delete, |b| {
        b.put_u32(0);
        b.put_cstring("app.users");
        b.put_u32(Delete::SINGLE);
        b.put_doc(&doc! { "userId" => 1 });
    });
    let del = Delete::parse(&msg).unwrap();
    assert_eq!(del.subops[0].limit, 1);
}

#[test]
fn get_more_fields() {
    let msg = frame(13, Opcode::GetMore, |b| {
        b.put_u32(0);
        b.put_cstring("app.users");
        b.put_i32(50);
        b.put_u64(0xDEAD_BEEF);
    });
    let more = GetMore::parse(&msg).unwrap();
    assert_eq!(more.n_to_return, 50);
    assert_eq!(more.cursor_id, 0xDEAD_BEEF);
}

#[test]
fn truncated_body_is_an_error() {
    let mut b = MsgBuilder::with_header(14, 0, Opcode::Query);
    b.put_u32(0);
    b.put_cstring("app.users");
    b.put_u32(0);
    b.put_i32(0);
    b.put_doc(&doc! { "k" => "value" });
    let bytes = b.finish();

    // Frame shorter than its declared length
    let cut = Bytes::copy_from_slice(&bytes[..bytes.len() - 3]);
    assert!(RawMessage::parse(cut).is_err());
}

#[test]
fn synthetic_query_has_no_wire_fields() {
    let q = Query::synthetic(
        crate::Namespace::new("local", "$cmd"),
        doc! { "ping" => 1 },
    );
    assert_eq!(q.n_to_return, 0);
    assert_eq!(q.criteria, doc! { "ping" => 1 });
    let _: &Doc = &q.query;
}
