use std::sync::Arc;

use keel_backend::{ClusterEnv, OpError, ShardPool};
use keel_config::Options;
use keel_doc::{array, doc, Doc, ObjectId, Value};
use keel_protocol::{Delete, DeleteSub, Insert, Namespace, RawMessage, Update, UpdateSub};
use keel_topology::TopologyMap;

use crate::plan::{plan_delete, plan_find_and_modify, plan_insert, plan_update};
use crate::write::{
    default_ack_merge, write_concerns_equal, MergeRule, Payload, StopRule, WriteOp,
};

// ---- write-concern equality ----

#[test]
fn get_last_error_and_missing_w_do_not_matter() {
    assert!(write_concerns_equal(
        &doc! { "getLastError" => 1 },
        &doc! { "w" => 1 }
    ));
    assert!(write_concerns_equal(&Doc::new(), &doc! { "w" => 1 }));
    assert!(write_concerns_equal(
        &doc! { "w" => 2, "j" => true },
        &doc! { "j" => true, "w" => 2, "getLastError" => 1 }
    ));
}

#[test]
fn differing_concerns_are_not_equal() {
    assert!(!write_concerns_equal(&doc! { "w" => 1 }, &doc! { "w" => 2 }));
    assert!(!write_concerns_equal(
        &doc! { "j" => true },
        &doc! { "j" => false }
    ));
    assert!(!write_concerns_equal(&doc! { "j" => true }, &Doc::new()));
    assert!(!write_concerns_equal(
        &doc! { "w" => "majority" },
        &doc! { "w" => 1 }
    ));
    assert!(write_concerns_equal(
        &doc! { "w" => "majority" },
        &doc! { "w" => "majority" }
    ));
}

#[test]
fn wtimeout_always_forces_a_refresh() {
    assert!(!write_concerns_equal(
        &doc! { "w" => 1, "wtimeout" => 100 },
        &doc! { "w" => 1, "wtimeout" => 100 }
    ));
}

// ---- acknowledgement merging ----

#[test]
fn merge_of_one_is_identity_and_of_none_is_empty() {
    let a = doc! { "ok" => 1, "n" => 3, "updatedExisting" => true };
    assert_eq!(default_ack_merge(std::slice::from_ref(&a)), a);
    assert_eq!(default_ack_merge(&[]), Doc::new());
}

#[test]
fn merge_sums_n_and_combines_flags() {
    let merged = default_ack_merge(&[
        doc! { "ok" => 1, "err" => Value::Null, "n" => 2, "updatedExisting" => false, "waited" => 5 },
        doc! { "ok" => 1, "err" => Value::Null, "n" => 3, "updatedExisting" => true, "waited" => 9, "wtime" => 2 },
    ]);
    assert!(merged.is_ok());
    assert_eq!(merged.get_i64("n"), Some(5));
    assert_eq!(merged.get_bool("updatedExisting"), Some(true));
    assert_eq!(merged.get_i64("waited"), Some(9));
    assert_eq!(merged.get_i64("wtime"), Some(2));
    assert!(merged.get("err").unwrap().is_null());
}

#[test]
fn merge_reports_first_error() {
    let merged = default_ack_merge(&[
        doc! { "ok" => 1, "err" => Value::Null, "n" => 1 },
        doc! { "ok" => 0, "err" => "boom", "code" => 42, "n" => 0 },
        doc! { "ok" => 0, "err" => "later", "code" => 43, "n" => 0 },
    ]);
    assert_eq!(merged.get_i64("ok"), Some(0));
    assert_eq!(merged.get_str("err"), Some("boom"));
    assert_eq!(merged.get_i64("code"), Some(42));
    assert_eq!(merged.get_i64("n"), Some(1));
}

#[test]
fn merge_promotes_overflowing_n_to_64_bits() {
    let merged = default_ack_merge(&[
        doc! { "ok" => 1, "n" => i64::from(i32::MAX) },
        doc! { "ok" => 1, "n" => 10i64 },
    ]);
    assert!(matches!(merged.get("n"), Some(Value::Int64(_))));
    assert_eq!(merged.get_i64("n"), Some(i64::from(i32::MAX) + 10));
}

#[test]
fn merge_keeps_first_upserted() {
    let merged = default_ack_merge(&[
        doc! { "ok" => 1, "n" => 1, "upserted" => "id-1" },
        doc! { "ok" => 1, "n" => 1, "upserted" => "id-2" },
    ]);
    assert_eq!(merged.get_str("upserted"), Some("id-1"));
}

#[test]
fn last_value_merge_demands_null_misses() {
    let rule = MergeRule::LastValue;
    let good = rule
        .apply(&[
            doc! { "value" => Value::Null, "ok" => 1 },
            doc! { "value" => doc! { "x" => 1 }, "ok" => 1 },
        ])
        .unwrap();
    assert!(good.get("value").is_some_and(|v| !v.is_null()));

    // A hit before the final ack violates the walk's contract
    let bad = rule.apply(&[
        doc! { "value" => doc! { "x" => 1 }, "ok" => 1 },
        doc! { "value" => Value::Null, "ok" => 1 },
    ]);
    assert!(matches!(bad, Err(OpError::Internal(_))));

    let empty = rule.apply(&[]).unwrap();
    assert!(empty.get("value").unwrap().is_null());
}

#[test]
fn stop_rules() {
    assert!(StopRule::NonZeroN.stops(&doc! { "ok" => 1, "n" => 1 }));
    assert!(!StopRule::NonZeroN.stops(&doc! { "ok" => 1, "n" => 0 }));
    assert!(StopRule::NonNullValue.stops(&doc! { "value" => doc! {} }));
    assert!(!StopRule::NonNullValue.stops(&doc! { "value" => Value::Null }));
    assert!(!StopRule::NonNullValue.stops(&doc! { "ok" => 1 }));
}

// ---- planning against a two-shard topology ----

fn fixture() -> (Arc<ClusterEnv>, TopologyMap) {
    let env = Arc::new(ClusterEnv::new(
        Options::default(),
        "localhost:4700".into(),
        None,
    ));
    let pool = ShardPool::new(Arc::clone(&env));
    let config = pool.get("config", "localhost:4700").unwrap();

    let epoch = ObjectId::from_bytes([7; 12]);
    let chunk = |shard: &str, stamp: u64, min: Value, max: Value| {
        Value::Doc(doc! {
            "ns" => "app.users",
            "shard" => shard,
            "lastmodEpoch" => epoch,
            "lastmod" => Value::Timestamp(stamp),
            "min" => doc! { "userId" => min },
            "max" => doc! { "userId" => max },
        })
    };
    let raw = doc! {
        "shards" => array![
            doc! { "_id" => "alpha", "host" => "localhost:4711" },
            doc! { "_id" => "beta", "host" => "localhost:4712" },
        ],
        "databases" => array![
            doc! { "_id" => "app", "partitioned" => true, "primary" => "alpha" },
        ],
        "collections" => array![
            doc! { "_id" => "app.users", "dropped" => false, "key" => doc! { "userId" => 1 } },
        ],
        "chunks" => array![
            chunk("alpha", 5, Value::MinKey, Value::Int32(500)),
            chunk("beta", 6, Value::Int32(500), Value::MaxKey),
        ],
    };
    let map = TopologyMap::parse(config, raw, &pool).unwrap();
    (env, map)
}

fn users() -> Namespace {
    Namespace::new("app", "users")
}

fn update_msg(subops: Vec<UpdateSub>, ordered: bool) -> Update {
    Update {
        ns: users(),
        subops,
        ordered,
        write_concern: Doc::new(),
    }
}

fn multi_update(selector: Doc) -> UpdateSub {
    UpdateSub {
        selector,
        update: doc! { "$set" => doc! { "x" => 1 } },
        upsert: false,
        multi: true,
    }
}

#[tokio::test]
async fn single_shard_insert_groups_into_one_backend_write() {
    let (env, map) = fixture();
    let msg = Insert {
        ns: users(),
        subops: vec![doc! { "userId" => 1 }, doc! { "userId" => 2 }],
        ordered: false,
        write_concern: Doc::new(),
    };
    // Unpinged backends report no version, so the legacy wire form wins
    let op = plan_insert(&env, &map, &msg).unwrap();
    let WriteOp::Backend(b) = op else {
        panic!("expected a single backend write");
    };
    assert_eq!(b.shard.id(), "alpha");
    assert_eq!(b.version.stamp(), 5);
    let Payload::Legacy(msg) = &b.payload else {
        panic!("expected the legacy wire form");
    };
    let parsed = Insert::parse(&RawMessage::parse(msg.clone()).unwrap()).unwrap();
    assert_eq!(parsed.subops.len(), 2);
}

#[tokio::test]
async fn insert_without_sharding_key_is_rejected() {
    let (env, map) = fixture();
    let msg = Insert {
        ns: Namespace::new("nowhere", "c"),
        subops: vec![doc! { "x" => 1 }],
        ordered: false,
        write_concern: Doc::new(),
    };
    // Routing an unknown database yields no shards at all
    assert!(matches!(
        plan_insert(&env, &map, &msg),
        Err(OpError::BadRequest(_))
    ));
}

#[tokio::test]
async fn multi_update_fans_out_in_parallel() {
    let (env, map) = fixture();
    let msg = update_msg(
        vec![multi_update(
            doc! { "userId" => doc! { "$in" => array![1, 1000] } },
        )],
        false,
    );
    let op = plan_update(&env, &map, &msg).unwrap();
    let WriteOp::Parallel(par) = op else {
        panic!("expected a parallel fan-out");
    };
    assert_eq!(par.ops.len(), 2);
    for child in &par.ops {
        assert!(matches!(child, WriteOp::Backend(_)));
    }
}

#[tokio::test]
async fn cross_shard_upsert_is_rejected() {
    let (env, map) = fixture();
    let msg = update_msg(
        vec![UpdateSub {
            selector: doc! { "age" => 30 }, // no sharding key
            update: doc! { "$set" => doc! { "x" => 1 } },
            upsert: true,
            multi: true,
        }],
        false,
    );
    assert!(matches!(
        plan_update(&env, &map, &msg),
        Err(OpError::BadRequest(_))
    ));
}

#[tokio::test]
async fn single_match_update_walks_shards_sequentially() {
    let (env, map) = fixture();
    let msg = update_msg(
        vec![UpdateSub {
            selector: doc! { "age" => 30 },
            update: doc! { "$set" => doc! { "x" => 1 } },
            upsert: false,
            multi: false,
        }],
        false,
    );
    let op = plan_update(&env, &map, &msg).unwrap();
    let WriteOp::Sequential(seq) = op else {
        panic!("expected a sequential walk");
    };
    assert_eq!(seq.ops.len(), 2);
    assert!(matches!(seq.stop, Some(StopRule::NonZeroN)));
}

#[tokio::test]
async fn ordered_batch_chains_sub_operations() {
    let (env, map) = fixture();
    let msg = update_msg(
        vec![
            multi_update(doc! { "userId" => 1 }),
            multi_update(doc! { "userId" => 1000 }),
        ],
        true,
    );
    let op = plan_update(&env, &map, &msg).unwrap();
    let WriteOp::Sequential(seq) = op else {
        panic!("expected an ordered chain");
    };
    assert_eq!(seq.ops.len(), 2);
    assert!(seq.stop.is_none());
}

#[tokio::test]
async fn unordered_same_shard_subs_share_a_bucket() {
    let (env, map) = fixture();
    let msg = update_msg(
        vec![
            multi_update(doc! { "userId" => 1 }),
            multi_update(doc! { "userId" => 2 }),
        ],
        false,
    );
    // Both route to alpha; without a write concern the legacy form splits
    // them into parallel singles
    let op = plan_update(&env, &map, &msg).unwrap();
    let WriteOp::Parallel(par) = op else {
        panic!("expected parallel legacy singles");
    };
    assert_eq!(par.ops.len(), 2);
}

#[tokio::test]
async fn delete_without_limit_fans_out() {
    let (env, map) = fixture();
    let msg = Delete {
        ns: users(),
        subops: vec![DeleteSub {
            selector: doc! { "age" => 30 },
            limit: 0,
        }],
        ordered: false,
        write_concern: Doc::new(),
    };
    assert!(matches!(
        plan_delete(&env, &map, &msg).unwrap(),
        WriteOp::Parallel(_)
    ));
}

#[tokio::test]
async fn delete_with_odd_limit_is_not_implemented() {
    let (env, map) = fixture();
    let msg = Delete {
        ns: users(),
        subops: vec![DeleteSub {
            selector: doc! { "age" => 30 },
            limit: 5,
        }],
        ordered: false,
        write_concern: Doc::new(),
    };
    assert!(matches!(
        plan_delete(&env, &map, &msg),
        Err(OpError::NotImplemented(_))
    ));
}

#[tokio::test]
async fn null_route_without_upsert_is_a_noop_ack() {
    let (env, map) = fixture();
    let msg = Delete {
        ns: Namespace::new("nowhere", "c"),
        subops: vec![DeleteSub {
            selector: doc! { "x" => 1 },
            limit: 0,
        }],
        ordered: false,
        write_concern: Doc::new(),
    };
    let op = plan_delete(&env, &map, &msg).unwrap();
    let WriteOp::Null(ack) = op else {
        panic!("expected a null write");
    };
    assert!(ack.is_ok());
    assert_eq!(ack.get_i64("n"), Some(0));
}

#[tokio::test]
async fn find_and_modify_planning() {
    let (env, map) = fixture();
    let ns = users();

    // Pinned key: direct
    let direct = plan_find_and_modify(
        &env,
        &map,
        &ns,
        &doc! { "findAndModify" => "users", "query" => doc! { "userId" => 7 } },
    )
    .unwrap();
    let WriteOp::Backend(b) = direct else {
        panic!("expected a direct findAndModify");
    };
    assert!(matches!(b.payload, Payload::FindAndModify(_)));

    // Unpinned: first-hit walk
    let walk = plan_find_and_modify(
        &env,
        &map,
        &ns,
        &doc! { "findAndModify" => "users", "query" => doc! { "age" => 30 } },
    )
    .unwrap();
    let WriteOp::Sequential(seq) = walk else {
        panic!("expected a sequential walk");
    };
    assert_eq!(seq.ops.len(), 2);
    assert!(matches!(seq.stop, Some(StopRule::NonNullValue)));

    // Unpinned upsert cannot place the new document
    let upsert = plan_find_and_modify(
        &env,
        &map,
        &ns,
        &doc! {
            "findAndModify" => "users",
            "query" => doc! { "age" => 30 },
            "upsert" => true,
        },
    );
    assert!(matches!(upsert, Err(OpError::BadRequest(_))));
}

#[tokio::test]
async fn empty_batch_is_a_bad_request() {
    let (env, map) = fixture();
    let msg = update_msg(Vec::new(), false);
    assert!(matches!(
        plan_update(&env, &map, &msg),
        Err(OpError::BadRequest(_))
    ));
}

#[tokio::test]
async fn failed_op_reports_through_acknowledge() {
    let mut op = WriteOp::failed("boom");
    op.perform().await.unwrap();
    let ack = op.acknowledge(&doc! { "getLastError" => 1 }).await.unwrap();
    assert_eq!(ack.get_i64("ok"), Some(0));
    assert_eq!(ack.get_str("err"), Some("boom"));
    assert!(op.is_acknowledgable());
    op.finish();
}
