//! The snapshot file
//!
//! A single document `{version: 1, <key>: <doc>, ...}` holding the last
//! known cluster map (and credentials listing), written atomically with
//! owner-only permissions so the proxy restarts usable even when every
//! config server is down. An unknown version is silently ignored.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use bytes::BytesMut;
use keel_doc::{decode_doc, encode_doc, Doc, Value};
use parking_lot::Mutex;

const SNAPSHOT_VERSION: i64 = 1;

/// Durable cache of small named documents
pub struct SnapshotStore {
    path: Option<PathBuf>,
    data: Mutex<BTreeMap<String, Doc>>,
}

impl SnapshotStore {
    /// Load the store; a missing, unreadable or unversioned file is an
    /// empty store. `None` disables persistence entirely.
    pub fn open(path: Option<PathBuf>) -> Self {
        let data = path
            .as_ref()
            .and_then(|p| Self::load(p))
            .unwrap_or_default();
        Self {
            path,
            data: Mutex::new(data),
        }
    }

    fn load(path: &PathBuf) -> Option<BTreeMap<String, Doc>> {
        let raw = fs::read(path).ok()?;
        let doc = decode_doc(&raw).ok()?;
        if doc.get_i64("version") != Some(SNAPSHOT_VERSION) {
            return None;
        }

        let mut map = BTreeMap::new();
        for (name, value) in doc.iter() {
            if name == "version" {
                continue;
            }
            let Value::Doc(entry) = value else {
                // Corrupt entry poisons the whole file
                return None;
            };
            map.insert(name.to_owned(), entry.clone());
        }
        Some(map)
    }

    pub fn get(&self, key: &str) -> Option<Doc> {
        self.data.lock().get(key).cloned()
    }

    /// Store one entry and rewrite the file (write-tmp-then-rename, 0600)
    pub fn put(&self, key: &str, value: Doc) {
        let Some(path) = &self.path else {
            self.data.lock().insert(key.to_owned(), value);
            return;
        };

        let mut data = self.data.lock();
        data.insert(key.to_owned(), value);

        let mut doc = Doc::with_capacity(data.len() + 1);
        doc.push("version", SNAPSHOT_VERSION);
        for (name, entry) in data.iter() {
            doc.push(name.as_str(), entry.clone());
        }

        let mut buf = BytesMut::new();
        encode_doc(&doc, &mut buf);

        let tmp = path.with_extension("tmp");
        if let Err(e) = Self::write_private(&tmp, &buf) {
            tracing::warn!(path = %path.display(), error = %e, "cannot update snapshot");
            let _ = fs::remove_file(&tmp);
            return;
        }
        if let Err(e) = fs::rename(&tmp, path) {
            tracing::warn!(path = %path.display(), error = %e, "cannot move snapshot into place");
            let _ = fs::remove_file(&tmp);
        }
    }

    #[cfg(unix)]
    fn write_private(path: &std::path::Path, bytes: &[u8]) -> std::io::Result<()> {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;

        let mut f = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)?;
        f.write_all(bytes)?;
        f.flush()
    }

    #[cfg(not(unix))]
    fn write_private(path: &std::path::Path, bytes: &[u8]) -> std::io::Result<()> {
        fs::write(path, bytes)
    }
}

#[cfg(test)]
mod tests {
    use keel_doc::doc;

    use super::*;

    #[test]
    fn round_trips_through_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot.cache");

        let store = SnapshotStore::open(Some(path.clone()));
        assert!(store.get("shard_config").is_none());
        store.put("shard_config", doc! { "shards" => keel_doc::array![] });
        store.put("auth", doc! { "app" => keel_doc::array![] });

        let reloaded = SnapshotStore::open(Some(path.clone()));
        assert!(reloaded.get("shard_config").is_some());
        assert!(reloaded.get("auth").is_some());
        assert!(reloaded.get("other").is_none());
    }

    #[test]
    fn unknown_version_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot.cache");

        let mut buf = BytesMut::new();
        encode_doc(
            &doc! { "version" => 99, "shard_config" => doc! {} },
            &mut buf,
        );
        fs::write(&path, &buf).unwrap();

        let store = SnapshotStore::open(Some(path));
        assert!(store.get("shard_config").is_none());
    }

    #[test]
    fn garbage_file_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot.cache");
        fs::write(&path, b"not a document").unwrap();
        let store = SnapshotStore::open(Some(path));
        assert!(store.get("shard_config").is_none());
    }

    #[cfg(unix)]
    #[test]
    fn file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot.cache");
        let store = SnapshotStore::open(Some(path.clone()));
        store.put("shard_config", doc! {});

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn memory_only_when_no_path() {
        let store = SnapshotStore::open(None);
        store.put("k", doc! { "x" => 1 });
        assert_eq!(store.get("k").unwrap().get_i64("x"), Some(1));
    }
}
