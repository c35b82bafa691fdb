//! Write planning
//!
//! A batch decomposes against the current topology: each sub-operation
//! routes by its selector, lands in a per-shard bucket (parallel) or a
//! cross-shard sequential entry, and the buckets pick a wire form by
//! backend capability. Ordered batches chain one plan per sub-operation.

use std::sync::Arc;

use keel_backend::{ClusterEnv, Shard};
use keel_doc::{doc, Doc, Value};
use keel_protocol::{
    wire_delete, wire_insert, wire_update, ChunkVersion, Delete, DeleteSub, Insert, Namespace,
    Update, UpdateSub,
};
use keel_topology::{TopologyMap, VersionedShard};

use crate::write::{BackendWrite, MergeRule, MultiWrite, Payload, StopRule, WriteOp};
use crate::{OpError, Result};

/// One batch type's planning rules
trait BatchRules {
    type Sub: Clone;

    /// The document that routes this sub-operation
    fn selector(sub: &Self::Sub) -> &Doc;

    /// May this sub-operation fan out to several shards in parallel?
    /// Errs when the shape requires a sharding key it does not have.
    fn parallelizable(sub: &Self::Sub) -> Result<bool>;

    /// Called when routing matched no shard at all
    fn null_route(sub: &Self::Sub) -> Result<()>;

    /// Limit-style constraint checked before a cross-shard walk
    fn check_sequential(sub: &Self::Sub) -> Result<()>;

    /// Does the sub-operation stop a cross-shard walk at the first hit?
    fn stop_rule(sub: &Self::Sub) -> Option<StopRule>;

    /// Command form of one sub-operation
    fn pack_command(sub: &Self::Sub) -> Value;

    /// Legacy wire form of one sub-operation batch
    fn pack_legacy(ns: &Namespace, subs: &[Self::Sub]) -> Vec<bytes::Bytes>;

    fn command_name() -> &'static str;
    fn subops_key() -> &'static str;
}

struct InsertRules;

impl BatchRules for InsertRules {
    type Sub = Doc;

    fn selector(sub: &Doc) -> &Doc {
        sub
    }

    fn parallelizable(_sub: &Doc) -> Result<bool> {
        Ok(false)
    }

    fn null_route(_sub: &Doc) -> Result<()> {
        Err(OpError::bad_request("insert operation requires sharding key"))
    }

    fn check_sequential(_sub: &Doc) -> Result<()> {
        Err(OpError::bad_request("insert operation requires sharding key"))
    }

    fn stop_rule(_sub: &Doc) -> Option<StopRule> {
        None
    }

    fn pack_command(sub: &Doc) -> Value {
        Value::Doc(sub.clone())
    }

    fn pack_legacy(ns: &Namespace, subs: &[Doc]) -> Vec<bytes::Bytes> {
        // Every document fits one legacy insert message
        vec![wire_insert(ns, subs)]
    }

    fn command_name() -> &'static str {
        "insert"
    }

    fn subops_key() -> &'static str {
        "documents"
    }
}

struct UpdateRules;

impl BatchRules for UpdateRules {
    type Sub = UpdateSub;

    fn selector(sub: &UpdateSub) -> &Doc {
        &sub.selector
    }

    fn parallelizable(sub: &UpdateSub) -> Result<bool> {
        if sub.upsert {
            return Err(OpError::bad_request("upsert requires sharding key"));
        }
        Ok(sub.multi)
    }

    fn null_route(sub: &UpdateSub) -> Result<()> {
        if sub.upsert {
            return Err(OpError::bad_request("upsert requires sharding key"));
        }
        Ok(())
    }

    fn check_sequential(_sub: &UpdateSub) -> Result<()> {
        Ok(())
    }

    fn stop_rule(sub: &UpdateSub) -> Option<StopRule> {
        // A single-match update stops at the first shard that changed a
        // document
        (!sub.multi).then_some(StopRule::NonZeroN)
    }

    fn pack_command(sub: &UpdateSub) -> Value {
        Value::Doc(doc! {
            "q" => sub.selector.clone(),
            "u" => sub.update.clone(),
            "upsert" => sub.upsert,
            "multi" => sub.multi,
        })
    }

    fn pack_legacy(ns: &Namespace, subs: &[UpdateSub]) -> Vec<bytes::Bytes> {
        subs.iter().map(|sub| wire_update(ns, sub)).collect()
    }

    fn command_name() -> &'static str {
        "update"
    }

    fn subops_key() -> &'static str {
        "updates"
    }
}

struct DeleteRules;

impl BatchRules for DeleteRules {
    type Sub = DeleteSub;

    fn selector(sub: &DeleteSub) -> &Doc {
        &sub.selector
    }

    fn parallelizable(sub: &DeleteSub) -> Result<bool> {
        Ok(sub.limit == 0)
    }

    fn null_route(_sub: &DeleteSub) -> Result<()> {
        Ok(())
    }

    fn check_sequential(sub: &DeleteSub) -> Result<()> {
        if sub.limit != 0 && sub.limit != 1 {
            return Err(OpError::NotImplemented(
                "limit greater than one is not implemented".into(),
            ));
        }
        Ok(())
    }

    fn stop_rule(sub: &DeleteSub) -> Option<StopRule> {
        (sub.limit != 0).then_some(StopRule::NonZeroN)
    }

    fn pack_command(sub: &DeleteSub) -> Value {
        Value::Doc(doc! {
            "q" => sub.selector.clone(),
            "limit" => sub.limit as i32,
        })
    }

    fn pack_legacy(ns: &Namespace, subs: &[DeleteSub]) -> Vec<bytes::Bytes> {
        subs.iter().map(|sub| wire_delete(ns, sub)).collect()
    }

    fn command_name() -> &'static str {
        "delete"
    }

    fn subops_key() -> &'static str {
        "deletes"
    }
}

/// Plan an insert batch against `map`
pub fn plan_insert(env: &Arc<ClusterEnv>, map: &TopologyMap, msg: &Insert) -> Result<WriteOp> {
    plan_batch::<InsertRules>(
        env,
        map,
        &msg.ns,
        &msg.subops,
        msg.ordered,
        &msg.write_concern,
    )
}

/// Plan an update batch against `map`
pub fn plan_update(env: &Arc<ClusterEnv>, map: &TopologyMap, msg: &Update) -> Result<WriteOp> {
    plan_batch::<UpdateRules>(
        env,
        map,
        &msg.ns,
        &msg.subops,
        msg.ordered,
        &msg.write_concern,
    )
}

/// Plan a delete batch against `map`
pub fn plan_delete(env: &Arc<ClusterEnv>, map: &TopologyMap, msg: &Delete) -> Result<WriteOp> {
    plan_batch::<DeleteRules>(
        env,
        map,
        &msg.ns,
        &msg.subops,
        msg.ordered,
        &msg.write_concern,
    )
}

fn plan_batch<K: BatchRules>(
    env: &Arc<ClusterEnv>,
    map: &TopologyMap,
    ns: &Namespace,
    subs: &[K::Sub],
    ordered: bool,
    write_concern: &Doc,
) -> Result<WriteOp> {
    if subs.is_empty() {
        return Err(OpError::bad_request("no operations given"));
    }

    if ordered && subs.len() > 1 {
        // Ordered batches run one plan per sub-operation, strictly in
        // sequence
        let mut seq = MultiWrite::new(write_concern.clone(), None, MergeRule::Default);
        for sub in subs {
            seq.add(plan_subops::<K>(
                env,
                map,
                ns,
                std::slice::from_ref(sub),
                write_concern,
            )?);
        }
        return Ok(WriteOp::Sequential(seq));
    }

    plan_subops::<K>(env, map, ns, subs, write_concern)
}

struct Bucket<S> {
    shard: Arc<Shard>,
    version: ChunkVersion,
    subs: Vec<S>,
}

fn plan_subops<K: BatchRules>(
    env: &Arc<ClusterEnv>,
    map: &TopologyMap,
    ns: &Namespace,
    subs: &[K::Sub],
    write_concern: &Doc,
) -> Result<WriteOp> {
    let mut buckets: Vec<Bucket<K::Sub>> = Vec::new();
    let mut sequential: Vec<(K::Sub, Vec<VersionedShard>)> = Vec::new();

    for sub in subs {
        let shards = map.find(ns, K::selector(sub))?;
        match shards.len() {
            0 => K::null_route(sub)?,
            1 => add_to_bucket(&mut buckets, &shards[0], sub)?,
            _ => {
                if K::parallelizable(sub)? {
                    for vs in &shards {
                        add_to_bucket(&mut buckets, vs, sub)?;
                    }
                } else {
                    sequential.push((sub.clone(), shards));
                }
            }
        }
    }

    match (buckets.len(), sequential.len()) {
        (0, 0) => Ok(WriteOp::null(doc! { "ok" => 1, "n" => 0 })),
        (1, 0) => {
            let bucket = buckets.pop().expect("one bucket");
            Ok(make_local::<K>(env, bucket, ns, write_concern))
        }
        (0, 1) => {
            let (sub, shards) = sequential.pop().expect("one entry");
            make_cross_shard::<K>(env, shards, ns, sub, write_concern)
        }
        _ => {
            let mut par = MultiWrite::new(write_concern.clone(), None, MergeRule::Default);
            for bucket in buckets {
                par.add(make_local::<K>(env, bucket, ns, write_concern));
            }
            for (sub, shards) in sequential {
                par.add(make_cross_shard::<K>(env, shards, ns, sub, write_concern)?);
            }
            Ok(WriteOp::Parallel(par))
        }
    }
}

fn add_to_bucket<S: Clone>(
    buckets: &mut Vec<Bucket<S>>,
    vs: &VersionedShard,
    sub: &S,
) -> Result<()> {
    match buckets
        .iter_mut()
        .find(|b| Arc::ptr_eq(&b.shard, &vs.shard))
    {
        Some(bucket) => {
            if bucket.version != vs.version {
                return Err(OpError::internal(
                    "write targets disagree on a shard's chunk version",
                ));
            }
            bucket.subs.push(sub.clone());
        }
        None => buckets.push(Bucket {
            shard: Arc::clone(&vs.shard),
            version: vs.version,
            subs: vec![sub.clone()],
        }),
    }
    Ok(())
}

/// All sub-operations of one bucket against one shard: command form when
/// the backend supports it and a write concern is set, else the legacy
/// wire form (several sub-operations become a parallel of singles)
fn make_local<K: BatchRules>(
    env: &Arc<ClusterEnv>,
    bucket: Bucket<K::Sub>,
    ns: &Namespace,
    write_concern: &Doc,
) -> WriteOp {
    let Bucket {
        shard,
        version,
        subs,
    } = bucket;

    if shard.supports_write_commands() && !write_concern.is_empty() {
        let cmd = pack_command_batch::<K>(ns, &subs, write_concern);
        return WriteOp::Backend(Box::new(BackendWrite::new(
            Arc::clone(env),
            shard,
            version,
            ns.clone(),
            Payload::Command(cmd),
        )));
    }

    let mut msgs = K::pack_legacy(ns, &subs);
    if msgs.len() == 1 {
        return WriteOp::Backend(Box::new(BackendWrite::new(
            Arc::clone(env),
            shard,
            version,
            ns.clone(),
            Payload::Legacy(msgs.pop().expect("one message")),
        )));
    }

    let mut par = MultiWrite::new(write_concern.clone(), None, MergeRule::Default);
    for msg in msgs {
        par.add(WriteOp::Backend(Box::new(BackendWrite::new(
            Arc::clone(env),
            Arc::clone(&shard),
            version,
            ns.clone(),
            Payload::Legacy(msg),
        ))));
    }
    WriteOp::Parallel(par)
}

/// One sub-operation visiting several shards in order, stopping at the
/// first acknowledgement that satisfies its limit
fn make_cross_shard<K: BatchRules>(
    env: &Arc<ClusterEnv>,
    shards: Vec<VersionedShard>,
    ns: &Namespace,
    sub: K::Sub,
    write_concern: &Doc,
) -> Result<WriteOp> {
    K::check_sequential(&sub)?;

    let make_single = |vs: &VersionedShard| -> WriteOp {
        make_local::<K>(
            env,
            Bucket {
                shard: Arc::clone(&vs.shard),
                version: vs.version,
                subs: vec![sub.clone()],
            },
            ns,
            write_concern,
        )
    };

    if shards.len() == 1 {
        return Ok(make_single(&shards[0]));
    }

    let mut seq = MultiWrite::new(write_concern.clone(), K::stop_rule(&sub), MergeRule::Default);
    for vs in &shards {
        seq.add(make_single(vs));
    }
    Ok(WriteOp::Sequential(seq))
}

fn pack_command_batch<K: BatchRules>(
    ns: &Namespace,
    subs: &[K::Sub],
    write_concern: &Doc,
) -> Doc {
    let packed: Vec<Value> = subs.iter().map(K::pack_command).collect();
    doc! {
        K::command_name() => ns.collection(),
        K::subops_key() => packed,
        "ordered" => false,
        "writeConcern" => write_concern.clone(),
    }
}

/// Plan a findAndModify: direct when one shard holds the key, a
/// first-hit sequential walk when several might, rejected with upsert
/// (the new document needs a definite home)
pub fn plan_find_and_modify(
    env: &Arc<ClusterEnv>,
    map: &TopologyMap,
    ns: &Namespace,
    cmd: &Doc,
) -> Result<WriteOp> {
    let criteria = cmd.get_doc("query").cloned().unwrap_or_default();
    let upsert = cmd.get_bool("upsert").unwrap_or(false);
    let shards = map.find(ns, &criteria)?;

    if shards.is_empty() && !upsert {
        return Ok(WriteOp::null(doc! { "value" => Value::Null, "ok" => 1 }));
    }
    if shards.len() == 1 {
        let vs = &shards[0];
        return Ok(WriteOp::Backend(Box::new(BackendWrite::new(
            Arc::clone(env),
            Arc::clone(&vs.shard),
            vs.version,
            ns.clone(),
            Payload::FindAndModify(cmd.clone()),
        ))));
    }
    if upsert {
        return Err(OpError::bad_request(
            "findAndModify() with upsert flag requires sharding key",
        ));
    }

    let mut seq = MultiWrite::new(Doc::new(), Some(StopRule::NonNullValue), MergeRule::LastValue);
    for vs in &shards {
        seq.add(WriteOp::Backend(Box::new(BackendWrite::new(
            Arc::clone(env),
            Arc::clone(&vs.shard),
            vs.version,
            ns.clone(),
            Payload::FindAndModify(cmd.clone()),
        ))));
    }
    Ok(WriteOp::Sequential(seq))
}
