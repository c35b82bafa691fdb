//! End-to-end reads against in-process mock backends
//!
//! Each mock speaks just enough of the wire dialect to get pinged alive
//! and serve queries: ping/buildinfo/serverStatus/setShardVersion answer
//! positively, data queries serve a canned table (optionally stalled or
//! flagged stale). The engine underneath is the real thing.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use keel_auth::Privileges;
use keel_backend::{ClusterEnv, OpError, Shard, ShardPool};
use keel_config::Options;
use keel_doc::{array, doc, Doc, ObjectId, Value};
use keel_engine::Runtime;
use keel_protocol::{Namespace, Opcode, Query, RawMessage, Reply, ReplyBuilder};
use keel_topology::{SnapshotStore, TopologyCache, SNAPSHOT_TOPOLOGY};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// One mock backend's behavior and counters
#[derive(Default)]
struct MockState {
    /// Documents served per namespace
    tables: HashMap<String, Vec<Doc>>,
    /// Reply to queries on this namespace with the stale-config flag
    stale_ns: Option<String>,
    /// When armed, the next data query (on any server sharing the gate)
    /// sleeps before answering
    stall: Option<Arc<StallGate>>,
    /// Data queries served (commands and probes not counted)
    data_queries: AtomicUsize,
    /// Legacy wire writes received
    writes: AtomicUsize,
}

struct StallGate {
    armed: AtomicBool,
    delay: Duration,
}

impl StallGate {
    fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            armed: AtomicBool::new(true),
            delay,
        })
    }
}

async fn spawn_mock(state: Arc<MockState>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let state = Arc::clone(&state);
            tokio::spawn(async move {
                let _ = serve_conn(stream, state).await;
            });
        }
    });
    addr
}

async fn serve_conn(mut stream: TcpStream, state: Arc<MockState>) -> std::io::Result<()> {
    loop {
        let mut len_raw = [0u8; 4];
        if stream.read_exact(&mut len_raw).await.is_err() {
            return Ok(());
        }
        let len = u32::from_le_bytes(len_raw) as usize;
        let mut frame = BytesMut::with_capacity(len);
        frame.extend_from_slice(&len_raw);
        frame.resize(len, 0);
        stream.read_exact(&mut frame[4..]).await?;

        let Ok(msg) = RawMessage::parse(frame.freeze()) else {
            return Ok(());
        };
        match msg.opcode() {
            Opcode::Query => {
                let q = Query::parse(&msg).expect("mock got a malformed query");
                let reply = answer(&state, &q).await;
                let mut rb = ReplyBuilder::new(msg.req_id());
                rb.set_flags(reply.0);
                for doc in reply.1 {
                    rb.push_doc(&doc);
                }
                stream.write_all(&rb.finish()).await?;
                stream.flush().await?;
            }
            // Fire-and-forget writes; the client follows up with a
            // getLastError conversation
            Opcode::Update | Opcode::Insert | Opcode::Delete => {
                state.writes.fetch_add(1, Ordering::SeqCst);
            }
            Opcode::KillCursors => {} // nothing to kill; batches are whole
            _ => return Ok(()),
        }
    }
}

async fn answer(state: &MockState, q: &Query) -> (u32, Vec<Doc>) {
    if q.ns.is_command() {
        let verb = q
            .query
            .front()
            .map(|(name, _)| name.to_lowercase())
            .unwrap_or_default();
        let doc = match verb.as_str() {
            "buildinfo" => doc! { "ok" => 1, "versionArray" => array![2, 4, 0] },
            "serverstatus" => doc! { "ok" => 1, "pid" => 7 },
            "getlasterror" => doc! { "ok" => 1, "err" => Value::Null, "n" => 1 },
            // ping, setShardVersion, ...
            _ => doc! { "ok" => 1 },
        };
        return (0, vec![doc]);
    }

    state.data_queries.fetch_add(1, Ordering::SeqCst);

    if let Some(gate) = &state.stall {
        if gate.armed.swap(false, Ordering::SeqCst) {
            tokio::time::sleep(gate.delay).await;
        }
    }

    if state.stale_ns.as_deref() == Some(q.ns.full()) {
        return (Reply::SHARD_CONFIG_STALE, Vec::new());
    }

    let docs = state.tables.get(q.ns.full()).cloned().unwrap_or_default();
    (0, docs)
}

fn user_chunks(split: i32, epoch: ObjectId) -> Value {
    array![
        Value::Doc(doc! {
            "ns" => "app.users", "shard" => "alpha",
            "lastmodEpoch" => epoch, "lastmod" => Value::Timestamp(4),
            "min" => doc! { "userId" => Value::MinKey },
            "max" => doc! { "userId" => split },
        }),
        Value::Doc(doc! {
            "ns" => "app.users", "shard" => "beta",
            "lastmodEpoch" => epoch, "lastmod" => Value::Timestamp(5),
            "min" => doc! { "userId" => split },
            "max" => doc! { "userId" => Value::MaxKey },
        }),
    ]
}

fn two_shard_topology(alpha: &str, beta: &str) -> Doc {
    doc! {
        "shards" => array![
            doc! { "_id" => "alpha", "host" => alpha },
            doc! { "_id" => "beta", "host" => beta },
        ],
        "databases" => array![
            doc! { "_id" => "app", "partitioned" => true, "primary" => "alpha" },
        ],
        "collections" => array![
            doc! { "_id" => "app.users", "dropped" => false, "key" => doc! { "userId" => 1 } },
        ],
        "chunks" => user_chunks(1000, ObjectId::from_bytes([5; 12])),
    }
}

/// Build a runtime whose topology comes from a snapshot (config servers
/// are a dead port)
fn runtime_from_snapshot(raw: Doc) -> Arc<Runtime> {
    let mut options = Options::default();
    options.conf_timeout = Duration::from_millis(200);
    options.ping_timeout = Duration::from_millis(500);

    let env = Arc::new(ClusterEnv::new(options, "127.0.0.1:4799".into(), None));
    let pool = Arc::new(ShardPool::new(Arc::clone(&env)));
    let store = Arc::new(SnapshotStore::open(None));
    store.put(SNAPSHOT_TOPOLOGY, raw);
    let topology = Arc::new(
        TopologyCache::new("127.0.0.1:4799", Arc::clone(&env), Arc::clone(&pool), Arc::clone(&store))
            .unwrap(),
    );
    Arc::new(Runtime::new(env, topology, pool, store))
}

async fn wait_alive(shard: &Arc<Shard>) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if shard.backends().iter().all(|b| b.alive()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("backends never came alive");
}

async fn collect(ds: &mut keel_engine::DataSource) -> Vec<Doc> {
    let mut out = Vec::new();
    while let Some(doc) = ds.get().cloned() {
        out.push(doc);
        ds.advance().await.unwrap();
    }
    out
}

#[tokio::test]
async fn single_shard_key_hit_touches_one_backend() {
    let alpha_state = Arc::new(MockState {
        tables: HashMap::from([(
            "app.users".to_owned(),
            vec![doc! { "userId" => 42, "name" => "ann" }],
        )]),
        ..Default::default()
    });
    let beta_state = Arc::new(MockState::default());

    let alpha = spawn_mock(Arc::clone(&alpha_state)).await;
    let beta = spawn_mock(Arc::clone(&beta_state)).await;
    let rt = runtime_from_snapshot(two_shard_topology(
        &alpha.to_string(),
        &beta.to_string(),
    ));

    let map = rt.topology.get().unwrap();
    wait_alive(&map.shard("alpha").unwrap()).await;
    wait_alive(&map.shard("beta").unwrap()).await;

    let q = Query::synthetic(Namespace::new("app", "users"), doc! { "userId" => 42 });
    let mut ds = keel_engine::query(&rt, &q, &Privileges::root())
        .await
        .unwrap();

    // Exactly one remote connection, on the shard holding the key
    let used = ds.used_endpoints();
    assert_eq!(used.len(), 1);
    assert_eq!(used[0].get_str("shard"), Some("alpha"));
    assert_eq!(used[0].get_str("backend"), Some(alpha.to_string().as_str()));

    let docs = collect(&mut ds).await;
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0].get_str("name"), Some("ann"));
    ds.close().await;

    assert_eq!(alpha_state.data_queries.load(Ordering::SeqCst), 1);
    assert_eq!(beta_state.data_queries.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn fan_out_merges_in_order() {
    let alpha_state = Arc::new(MockState {
        tables: HashMap::from([(
            "app.users".to_owned(),
            vec![
                doc! { "userId" => 10 },
                doc! { "userId" => 500 },
            ],
        )]),
        ..Default::default()
    });
    let beta_state = Arc::new(MockState {
        tables: HashMap::from([(
            "app.users".to_owned(),
            vec![
                doc! { "userId" => 1005 },
                doc! { "userId" => 2000 },
            ],
        )]),
        ..Default::default()
    });

    let alpha = spawn_mock(Arc::clone(&alpha_state)).await;
    let beta = spawn_mock(Arc::clone(&beta_state)).await;
    let rt = runtime_from_snapshot(two_shard_topology(
        &alpha.to_string(),
        &beta.to_string(),
    ));

    let map = rt.topology.get().unwrap();
    wait_alive(&map.shard("alpha").unwrap()).await;
    wait_alive(&map.shard("beta").unwrap()).await;

    // No sharding key in the criteria: both shards serve, merged by the
    // order-by document
    let q = Query::synthetic(
        Namespace::new("app", "users"),
        doc! {
            "$query" => doc! { "age" => doc! { "$gt" => 0 } },
            "$orderby" => doc! { "userId" => 1 },
        },
    );
    let mut ds = keel_engine::query(&rt, &q, &Privileges::root())
        .await
        .unwrap();
    assert_eq!(ds.used_endpoints().len(), 2);

    let ids: Vec<i64> = collect(&mut ds)
        .await
        .iter()
        .map(|d| d.get_i64("userId").unwrap())
        .collect();
    assert_eq!(ids, [10, 500, 1005, 2000]);
    ds.close().await;

    assert_eq!(alpha_state.data_queries.load(Ordering::SeqCst), 1);
    assert_eq!(beta_state.data_queries.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn hedged_read_wins_over_a_stalled_backend() {
    // One sync-group shard over two servers sharing a stall gate: the
    // first data query anywhere sleeps well past the deadline margin
    let gate = StallGate::new(Duration::from_millis(1500));
    let table = HashMap::from([(
        "app.items".to_owned(),
        vec![doc! { "sku" => "k-1" }],
    )]);
    let n1_state = Arc::new(MockState {
        tables: table.clone(),
        stall: Some(Arc::clone(&gate)),
        ..Default::default()
    });
    let n2_state = Arc::new(MockState {
        tables: table,
        stall: Some(Arc::clone(&gate)),
        ..Default::default()
    });

    let n1 = spawn_mock(Arc::clone(&n1_state)).await;
    let n2 = spawn_mock(Arc::clone(&n2_state)).await;

    let raw = doc! {
        "shards" => array![
            doc! { "_id" => "s", "host" => format!("{n1},{n2}") },
        ],
        "databases" => array![
            doc! { "_id" => "app", "partitioned" => true, "primary" => "s" },
        ],
        "collections" => array![],
        "chunks" => array![],
    };
    let rt = runtime_from_snapshot(raw);
    let map = rt.topology.get().unwrap();
    wait_alive(&map.shard("s").unwrap()).await;

    let q = Query::synthetic(
        Namespace::new("app", "items"),
        doc! {
            "$query" => doc! {},
            "$readPreference" => doc! {
                "mode" => "nearest",
                "retransmitMs" => 50,
                "timeoutMs" => 5000,
            },
        },
    );

    let started = Instant::now();
    let mut ds = keel_engine::query(&rt, &q, &Privileges::root())
        .await
        .unwrap();
    let elapsed = started.elapsed();

    // The retransmit answered long before the stalled first attempt
    assert!(
        elapsed < Duration::from_millis(1000),
        "hedged read took {elapsed:?}"
    );
    let docs = collect(&mut ds).await;
    assert_eq!(docs.len(), 1);
    ds.close().await;

    // Both servers saw the query: the original and its hedge
    let total = n1_state.data_queries.load(Ordering::SeqCst)
        + n2_state.data_queries.load(Ordering::SeqCst);
    assert_eq!(total, 2);
}

#[tokio::test]
async fn persistent_stale_config_propagates_after_retries() {
    let alpha_state = Arc::new(MockState {
        stale_ns: Some("app.users".to_owned()),
        ..Default::default()
    });
    let beta_state = Arc::new(MockState::default());

    let alpha = spawn_mock(Arc::clone(&alpha_state)).await;
    let beta = spawn_mock(Arc::clone(&beta_state)).await;

    // A live config server keeps serving the same topology, so every
    // stale-driven refresh succeeds and the query keeps failing
    let topology_raw = two_shard_topology(&alpha.to_string(), &beta.to_string());
    let config_state = Arc::new(MockState {
        tables: HashMap::from([
            (
                "config.shards".to_owned(),
                table_docs(&topology_raw, "shards"),
            ),
            (
                "config.databases".to_owned(),
                table_docs(&topology_raw, "databases"),
            ),
            (
                "config.collections".to_owned(),
                table_docs(&topology_raw, "collections"),
            ),
            (
                "config.chunks".to_owned(),
                table_docs(&topology_raw, "chunks"),
            ),
        ]),
        ..Default::default()
    });
    let config = spawn_mock(Arc::clone(&config_state)).await;

    let mut options = Options::default();
    options.conf_timeout = Duration::from_millis(500);
    let env = Arc::new(ClusterEnv::new(options, config.to_string(), None));
    let pool = Arc::new(ShardPool::new(Arc::clone(&env)));
    let store = Arc::new(SnapshotStore::open(None));
    let topology = Arc::new(
        TopologyCache::new(&config.to_string(), Arc::clone(&env), Arc::clone(&pool), Arc::clone(&store))
            .unwrap(),
    );
    topology.update().await.unwrap();
    let rt = Arc::new(Runtime::new(env, topology, pool, store));

    let map = rt.topology.get().unwrap();
    wait_alive(&map.shard("alpha").unwrap()).await;

    let q = Query::synthetic(Namespace::new("app", "users"), doc! { "userId" => 1 });
    let result = keel_engine::query(&rt, &q, &Privileges::root()).await;
    assert!(matches!(result, Err(OpError::ShardConfigStale(_))));

    // One query per retry attempt
    assert_eq!(alpha_state.data_queries.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn parallel_multi_shard_update_merges_acks() {
    let alpha_state = Arc::new(MockState::default());
    let beta_state = Arc::new(MockState::default());

    let alpha = spawn_mock(Arc::clone(&alpha_state)).await;
    let beta = spawn_mock(Arc::clone(&beta_state)).await;
    let rt = runtime_from_snapshot(two_shard_topology(
        &alpha.to_string(),
        &beta.to_string(),
    ));

    let map = rt.topology.get().unwrap();
    wait_alive(&map.shard("alpha").unwrap()).await;
    wait_alive(&map.shard("beta").unwrap()).await;

    // A multi-update keyed into both chunks fans out in parallel; each
    // shard acknowledges n=1, the merged ack sums them
    let msg = keel_protocol::Update {
        ns: Namespace::new("app", "users"),
        subops: vec![keel_protocol::UpdateSub {
            selector: doc! { "userId" => doc! { "$in" => array![1, 2000] } },
            update: doc! { "$set" => doc! { "x" => 1 } },
            upsert: false,
            multi: true,
        }],
        ordered: false,
        write_concern: Doc::new(),
    };

    let mut op = keel_engine::update(&rt, &msg, &Privileges::root())
        .await
        .unwrap();
    let ack = op.last_status();
    assert!(ack.is_ok());
    assert_eq!(ack.get_i64("n"), Some(2));
    op.finish();

    assert_eq!(alpha_state.writes.load(Ordering::SeqCst), 1);
    assert_eq!(beta_state.writes.load(Ordering::SeqCst), 1);
}

fn table_docs(raw: &Doc, field: &str) -> Vec<Doc> {
    raw.get_array(field)
        .unwrap_or(&[])
        .iter()
        .filter_map(|v| v.as_doc().cloned())
        .collect()
}
