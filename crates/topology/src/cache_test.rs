//! Startup behavior of the topology cache, config servers unreachable

use std::sync::Arc;

use keel_backend::{ClusterEnv, OpError, ShardPool};
use keel_config::Options;
use keel_doc::{array, doc, Doc, ObjectId, Value};
use keel_protocol::Namespace;

use crate::{SnapshotStore, TopologyCache, SNAPSHOT_TOPOLOGY};

// Nothing listens on these ports; every fetch fails fast
const DEAD_CONFIG: &str = "127.0.0.1:4790,127.0.0.1:4791";

fn raw_topology() -> Doc {
    let epoch = ObjectId::from_bytes([3; 12]);
    doc! {
        "shards" => array![
            doc! { "_id" => "alpha", "host" => "localhost:4711" },
        ],
        "databases" => array![
            doc! { "_id" => "app", "partitioned" => true, "primary" => "alpha" },
        ],
        "collections" => array![
            doc! { "_id" => "app.users", "dropped" => false, "key" => doc! { "userId" => 1 } },
        ],
        "chunks" => array![Value::Doc(doc! {
            "ns" => "app.users",
            "shard" => "alpha",
            "lastmodEpoch" => epoch,
            "lastmod" => Value::Timestamp(4),
            "min" => doc! { "userId" => Value::MinKey },
            "max" => doc! { "userId" => Value::MaxKey },
        })],
    }
}

fn setup(snapshot: Option<Doc>) -> TopologyCache {
    let mut options = Options::default();
    options.conf_timeout = std::time::Duration::from_millis(200);
    options.conf_retransmit = std::time::Duration::from_millis(20);

    let env = Arc::new(ClusterEnv::new(options, DEAD_CONFIG.into(), None));
    let pool = Arc::new(ShardPool::new(Arc::clone(&env)));
    let store = Arc::new(SnapshotStore::open(None));
    if let Some(raw) = snapshot {
        store.put(SNAPSHOT_TOPOLOGY, raw);
    }
    TopologyCache::new(DEAD_CONFIG, env, pool, store).unwrap()
}

#[tokio::test]
async fn without_a_snapshot_there_is_no_config() {
    let cache = setup(None);
    assert!(!cache.exists());
    assert!(matches!(cache.get(), Err(OpError::NoShardConfig)));
}

#[tokio::test]
async fn snapshot_makes_the_proxy_immediately_usable() {
    let cache = setup(Some(raw_topology()));
    assert!(cache.exists());

    // Routing works off the cached snapshot alone
    let map = cache.get().unwrap();
    let shards = map
        .find(&Namespace::new("app", "users"), &doc! { "userId" => 7 })
        .unwrap();
    assert_eq!(shards.len(), 1);
    assert_eq!(shards[0].shard.id(), "alpha");
}

#[tokio::test]
async fn refresh_failure_keeps_the_cached_snapshot() {
    let cache = setup(Some(raw_topology()));
    let before = cache.get().unwrap();

    // Both config servers are down; the update must fail without
    // touching the adopted snapshot
    assert!(cache.update().await.is_err());

    let after = cache.get().unwrap();
    assert_eq!(before.created_at(), after.created_at());
}

#[tokio::test]
async fn a_broken_snapshot_is_rejected_but_startup_survives() {
    // A chunk referring to an unknown shard poisons the snapshot; the
    // cache starts empty instead of failing startup
    let mut raw = raw_topology();
    raw = doc! {
        "shards" => array![],
        "databases" => raw.get("databases").unwrap().clone(),
        "collections" => raw.get("collections").unwrap().clone(),
        "chunks" => raw.get("chunks").unwrap().clone(),
    };
    let cache = setup(Some(raw));
    assert!(!cache.exists());
    assert!(matches!(cache.get(), Err(OpError::NoShardConfig)));
}

#[tokio::test]
async fn empty_connstr_is_fatal() {
    let env = Arc::new(ClusterEnv::new(Options::default(), String::new(), None));
    let pool = Arc::new(ShardPool::new(Arc::clone(&env)));
    let store = Arc::new(SnapshotStore::open(None));
    assert!(TopologyCache::new("", env, pool, store).is_err());
}
