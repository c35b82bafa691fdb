//! The parsed cluster map and the router
//!
//! A map is built from the raw composite document fetched off a config
//! server (or loaded from the snapshot file), validated, linked against
//! the shard registry, and then never mutated.

use std::sync::Arc;
use std::time::Instant;

use keel_backend::{OpError, Result, Shard, ShardPool};
use keel_doc::{doc, hashed_key, Doc, ObjectId, Value};
use keel_protocol::{ChunkVersion, Namespace};

/// A shard together with the collection version it holds
#[derive(Clone)]
pub struct VersionedShard {
    pub shard: Arc<Shard>,
    pub version: ChunkVersion,
}

/// A contiguous range of the sharding-key space assigned to one shard
pub struct Chunk {
    ns: Namespace,
    version: ChunkVersion,
    /// Empty bound = open end of the key space
    min: Doc,
    max: Doc,
    shard: Arc<Shard>,
}

impl Chunk {
    fn parse(obj: &Doc, map: &ParseCtx<'_>) -> Result<Self> {
        let ns = parse_ns(obj, "ns")?;
        let epoch = match obj.get("lastmodEpoch") {
            Some(Value::ObjectId(id)) => *id,
            _ => ObjectId::ZERO,
        };
        let stamp = match obj.get("lastmod") {
            Some(Value::Timestamp(ts)) => *ts,
            _ => return Err(broken(format!("chunk of {ns} has no version"))),
        };

        let strip_open = |bound: Option<&Doc>| -> Doc {
            let bound = bound.cloned().unwrap_or_default();
            match bound.front() {
                Some((name, _)) if name == "$minkey" || name == "$maxkey" => Doc::new(),
                _ => bound,
            }
        };

        let shard_id = obj
            .get_str("shard")
            .ok_or_else(|| broken(format!("chunk of {ns} has no shard")))?;

        Ok(Self {
            ns,
            version: ChunkVersion::new(epoch, stamp),
            min: strip_open(obj.get_doc("min")),
            max: strip_open(obj.get_doc("max")),
            shard: map.shard(shard_id)?,
        })
    }

    #[inline]
    pub fn ns(&self) -> &Namespace {
        &self.ns
    }

    #[inline]
    pub fn version(&self) -> ChunkVersion {
        self.version
    }

    #[inline]
    pub fn shard(&self) -> &Arc<Shard> {
        &self.shard
    }

    #[inline]
    pub fn lower_bound(&self) -> &Doc {
        &self.min
    }

    #[inline]
    pub fn upper_bound(&self) -> &Doc {
        &self.max
    }

    pub fn contains(&self, key: &Doc) -> bool {
        (self.min.is_empty() || *key >= self.min) && (self.max.is_empty() || *key < self.max)
    }
}

/// A sharded collection and its slice of the chunk table
pub struct Collection {
    ns: Namespace,
    dropped: bool,
    sharding_key: Doc,
    /// Index range into the map's sorted chunk table
    chunks: std::ops::Range<usize>,
}

impl Collection {
    fn parse(obj: &Doc) -> Result<Self> {
        let ns = parse_ns(obj, "_id")?;
        Ok(Self {
            ns,
            dropped: obj.get_bool("dropped").unwrap_or(false),
            sharding_key: obj
                .get_doc("key")
                .cloned()
                .ok_or_else(|| broken("collection has no sharding key"))?,
            chunks: 0..0,
        })
    }

    #[inline]
    pub fn ns(&self) -> &Namespace {
        &self.ns
    }

    #[inline]
    pub fn is_dropped(&self) -> bool {
        self.dropped
    }

    /// The ordered field list documents are routed by
    #[inline]
    pub fn sharding_key(&self) -> &Doc {
        &self.sharding_key
    }

    /// The field name, when the key asks for hashed routing
    /// (a single field valued `"hashed"`)
    pub fn hashed_field(&self) -> Option<&str> {
        match self.sharding_key.front() {
            Some((name, Value::String(kind))) if self.sharding_key.len() == 1 && kind == "hashed" => {
                Some(name)
            }
            _ => None,
        }
    }
}

/// A database and where its unsharded collections live
pub struct Database {
    name: String,
    partitioned: bool,
    primary: Arc<Shard>,
}

impl Database {
    fn parse(obj: &Doc, map: &ParseCtx<'_>) -> Result<Self> {
        let name = obj
            .get_str("_id")
            .ok_or_else(|| broken("database has no name"))?;
        let primary_id = obj
            .get_str("primary")
            .ok_or_else(|| broken(format!("database {name} has no primary shard")))?;
        Ok(Self {
            name: name.to_owned(),
            partitioned: obj.get_bool("partitioned").unwrap_or(false),
            primary: map.shard(primary_id)?,
        })
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn is_partitioned(&self) -> bool {
        self.partitioned
    }

    #[inline]
    pub fn primary_shard(&self) -> &Arc<Shard> {
        &self.primary
    }
}

/// Shard lookup context while parsing
struct ParseCtx<'a> {
    config_shard: &'a Arc<Shard>,
    shards: &'a [(String, Arc<Shard>)],
}

impl ParseCtx<'_> {
    fn shard(&self, id: &str) -> Result<Arc<Shard>> {
        if id == "config" {
            return Ok(Arc::clone(self.config_shard));
        }
        self.shards
            .binary_search_by(|(name, _)| name.as_str().cmp(id))
            .map(|i| Arc::clone(&self.shards[i].1))
            .map_err(|_| broken(format!("unknown shard {id}")))
    }
}

/// One immutable snapshot of the whole cluster map
pub struct TopologyMap {
    raw: Doc,
    config_shard: Arc<Shard>,
    shards: Vec<(String, Arc<Shard>)>,
    chunks: Vec<Chunk>,
    collections: Vec<Collection>,
    databases: Vec<Database>,
    created_at: Instant,
}

impl TopologyMap {
    /// Parse and validate a raw composite document
    /// `{shards, databases, collections, chunks}`.
    pub fn parse(config_shard: Arc<Shard>, raw: Doc, pool: &ShardPool) -> Result<Self> {
        let mut shards: Vec<(String, Arc<Shard>)> = Vec::new();
        for obj in doc_array(&raw, "shards") {
            let id = obj
                .get_str("_id")
                .ok_or_else(|| broken("shard entry has no id"))?;
            let host = obj
                .get_str("host")
                .ok_or_else(|| broken(format!("shard {id} has no connection string")))?;
            shards.push((id.to_owned(), pool.get(id, host)?));
        }
        shards.sort_by(|a, b| a.0.cmp(&b.0));

        let ctx = ParseCtx {
            config_shard: &config_shard,
            shards: &shards,
        };

        let mut chunks = Vec::new();
        for obj in doc_array(&raw, "chunks") {
            chunks.push(Chunk::parse(obj, &ctx)?);
        }
        chunks.sort_by(|a, b| {
            (a.ns.full(), &a.min).cmp(&(b.ns.full(), &b.min))
        });

        let mut collections = Vec::new();
        for obj in doc_array(&raw, "collections") {
            let mut coll = Collection::parse(obj)?;
            if coll.is_dropped() {
                continue;
            }
            coll.chunks = chunk_range(&chunks, &coll.ns);
            check_cover(&chunks[coll.chunks.clone()], &coll.ns)?;
            collections.push(coll);
        }
        collections.sort_by(|a, b| a.ns.full().cmp(b.ns.full()));

        let mut databases = Vec::new();
        for obj in doc_array(&raw, "databases") {
            databases.push(Database::parse(obj, &ctx)?);
        }
        databases.sort_by(|a, b| a.name.cmp(&b.name));

        normalize_versions(&mut chunks)?;

        Ok(Self {
            raw,
            config_shard,
            shards,
            chunks,
            collections,
            databases,
            created_at: Instant::now(),
        })
    }

    /// The raw document this map was parsed from; refreshes compare and
    /// snapshot it
    #[inline]
    pub fn raw(&self) -> &Doc {
        &self.raw
    }

    #[inline]
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn shard(&self, name: &str) -> Option<Arc<Shard>> {
        if name == "config" {
            return Some(Arc::clone(&self.config_shard));
        }
        self.shards
            .binary_search_by(|(id, _)| id.as_str().cmp(name))
            .ok()
            .map(|i| Arc::clone(&self.shards[i].1))
    }

    /// Every shard, the config shard first
    pub fn shards(&self) -> Vec<Arc<Shard>> {
        let mut ret = Vec::with_capacity(self.shards.len() + 1);
        ret.push(Arc::clone(&self.config_shard));
        ret.extend(self.shards.iter().map(|(_, s)| Arc::clone(s)));
        ret
    }

    pub fn database(&self, name: &str) -> Option<&Database> {
        self.databases
            .binary_search_by(|db| db.name.as_str().cmp(name))
            .ok()
            .map(|i| &self.databases[i])
    }

    pub fn databases(&self) -> &[Database] {
        &self.databases
    }

    pub fn collection(&self, ns: &Namespace) -> Option<&Collection> {
        self.collections
            .binary_search_by(|c| c.ns.full().cmp(ns.full()))
            .ok()
            .map(|i| &self.collections[i])
    }

    pub fn chunks_of(&self, coll: &Collection) -> &[Chunk] {
        &self.chunks[coll.chunks.clone()]
    }

    /// Every shard holding a piece of `ns`, with its collection version.
    ///
    /// The `config` database always routes to the config shard; an
    /// unsharded collection routes to its database's primary shard.
    pub fn shards_of(&self, ns: &Namespace) -> Vec<VersionedShard> {
        if ns.db() == "config" {
            return vec![VersionedShard {
                shard: Arc::clone(&self.config_shard),
                version: ChunkVersion::ZERO,
            }];
        }

        if let Some(coll) = self.collection(ns) {
            let mut ret: Vec<VersionedShard> = Vec::new();
            for chunk in self.chunks_of(coll) {
                if !ret.iter().any(|vs| Arc::ptr_eq(&vs.shard, chunk.shard())) {
                    ret.push(VersionedShard {
                        shard: Arc::clone(chunk.shard()),
                        version: chunk.version(),
                    });
                }
            }
            return ret;
        }

        match self.database(ns.db()) {
            Some(db) => vec![VersionedShard {
                shard: Arc::clone(db.primary_shard()),
                version: ChunkVersion::ZERO,
            }],
            None => Vec::new(),
        }
    }

    /// Route `(namespace, criteria)` to the shards holding matching data.
    ///
    /// Criteria that pin every sharding-key field to a value (or one
    /// `$in` list) route precisely; anything looser falls back to the
    /// full shard set of the collection.
    pub fn find(&self, ns: &Namespace, criteria: &Doc) -> Result<Vec<VersionedShard>> {
        let Some(coll) = self.collection(ns) else {
            tracing::trace!(%ns, "collection not sharded");
            return Ok(self.shards_of(ns));
        };

        let mut head = Doc::new();
        let mut tail = Doc::new();
        let mut vector: Option<(&str, &[Value])> = None;

        for (field, _) in coll.sharding_key().iter() {
            let Some(value) = criteria.get(field) else {
                // Criteria under-constrain the key
                return Ok(self.shards_of(ns));
            };

            let operator = value
                .as_doc()
                .and_then(|d| d.front())
                .filter(|(name, _)| name.starts_with('$'));
            match operator {
                None => {
                    if vector.is_none() {
                        head.push(field, value.clone());
                    } else {
                        tail.push(field, value.clone());
                    }
                }
                Some(("$in", Value::Array(values))) if vector.is_none() => {
                    vector = Some((field, values.as_slice()));
                }
                Some(_) => return Ok(self.shards_of(ns)),
            }
        }

        let hashed = coll.hashed_field();
        let Some((vec_field, vec_values)) = vector else {
            return Ok(vec![self.lookup_chunk(ns, &head, hashed)?]);
        };

        let mut ret: Vec<VersionedShard> = Vec::new();
        for value in vec_values {
            let mut key = Doc::with_capacity(head.len() + tail.len() + 1);
            for (name, v) in head.iter() {
                key.push(name, v.clone());
            }
            key.push(vec_field, value.clone());
            for (name, v) in tail.iter() {
                key.push(name, v.clone());
            }
            let vs = self.lookup_chunk(ns, &key, hashed)?;
            if !ret.iter().any(|r| Arc::ptr_eq(&r.shard, &vs.shard)) {
                ret.push(vs);
            }
        }
        Ok(ret)
    }

    /// Find the chunk containing `key`: the predecessor of the upper
    /// bound in `(namespace, lower)` order must contain it.
    fn lookup_chunk(
        &self,
        ns: &Namespace,
        key: &Doc,
        hashed_field: Option<&str>,
    ) -> Result<VersionedShard> {
        let key = match hashed_field {
            Some(field) => {
                let value = key.get(field).cloned().unwrap_or(Value::Null);
                doc! { field => hashed_key(&value) }
            }
            None => key.clone(),
        };

        let pos = self.chunks.partition_point(|c| {
            (c.ns.full(), &c.min) <= (ns.full(), &key)
        });
        let chunk = pos
            .checked_sub(1)
            .map(|i| &self.chunks[i])
            .filter(|c| c.ns == *ns && c.contains(&key))
            .ok_or_else(|| {
                OpError::internal(format!("no chunk of {ns} contains {key}"))
            })?;

        tracing::trace!(
            %ns, lower = %chunk.lower_bound(), upper = %chunk.upper_bound(),
            "found chunk"
        );
        Ok(VersionedShard {
            shard: Arc::clone(chunk.shard()),
            version: chunk.version(),
        })
    }
}

fn parse_ns(obj: &Doc, field: &str) -> Result<Namespace> {
    let raw = obj
        .get_str(field)
        .ok_or_else(|| broken(format!("entry has no {field}")))?;
    Namespace::parse(raw).map_err(|e| broken(e.to_string()))
}

fn broken(msg: impl Into<String>) -> OpError {
    OpError::ShardConfigBroken(msg.into())
}

fn doc_array<'a>(raw: &'a Doc, field: &str) -> impl Iterator<Item = &'a Doc> {
    raw.get_array(field)
        .unwrap_or(&[])
        .iter()
        .filter_map(Value::as_doc)
}

fn chunk_range(chunks: &[Chunk], ns: &Namespace) -> std::ops::Range<usize> {
    let start = chunks.partition_point(|c| c.ns.full() < ns.full());
    let end = chunks.partition_point(|c| c.ns.full() <= ns.full());
    start..end
}

/// Adjacent chunks of one collection must share a boundary, and the two
/// outermost bounds must be open
fn check_cover(chunks: &[Chunk], ns: &Namespace) -> Result<()> {
    for pair in chunks.windows(2) {
        if pair[0].max != pair[1].min {
            return Err(broken(format!("gap in partition of collection {ns}")));
        }
    }
    Ok(())
}

/// Chunks of one `(namespace, shard)` group must agree on an epoch; the
/// group's version becomes the max stamp so every chunk presents the same
/// collection version outward
fn normalize_versions(chunks: &mut [Chunk]) -> Result<()> {
    // (ns, shard ptr) -> adopted version
    let mut groups: Vec<(String, *const Shard, ChunkVersion)> = Vec::new();

    for chunk in chunks.iter() {
        let key = (chunk.ns.full().to_owned(), Arc::as_ptr(chunk.shard()));
        match groups.iter_mut().find(|(ns, s, _)| *ns == key.0 && *s == key.1) {
            None => groups.push((key.0, key.1, chunk.version)),
            Some((_, _, adopted)) => {
                if !adopted.same_epoch(&chunk.version) {
                    return Err(broken(format!(
                        "chunk epochs differ for collection {} and shard {}",
                        chunk.ns,
                        chunk.shard().connection_string()
                    )));
                }
                if adopted.stamp() < chunk.version.stamp() {
                    *adopted = chunk.version;
                }
            }
        }
    }

    for chunk in chunks.iter_mut() {
        let key = (chunk.ns.full(), Arc::as_ptr(&chunk.shard));
        if let Some((_, _, adopted)) = groups
            .iter()
            .find(|(ns, s, _)| ns == key.0 && *s == key.1)
        {
            chunk.version = *adopted;
        }
    }
    Ok(())
}
