//! Parsed snapshot of every database's stored users
//!
//! Keyed by `(db, user)`. The cache never fetches anything itself: the
//! owner of the read path feeds it raw per-database user listings (one
//! array per database name), both from live fetches and from the snapshot
//! file at startup.

use std::collections::HashMap;
use std::sync::Arc;

use keel_doc::{Doc, Value};
use parking_lot::Mutex;

type Map = HashMap<(String, String), Doc>;

/// Process-wide credentials snapshot
#[derive(Default)]
pub struct CredentialsCache {
    cache: Mutex<Option<Arc<Map>>>,
}

impl CredentialsCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored user document for `(db, user)`, if the snapshot has one
    pub fn find(&self, db: &str, user: &str) -> Option<Doc> {
        let map = self.cache.lock().clone()?;
        map.get(&(db.to_owned(), user.to_owned())).cloned()
    }

    /// True once any snapshot has been installed
    pub fn ready(&self) -> bool {
        self.cache.lock().is_some()
    }

    /// Replace the snapshot from a raw listing document:
    /// `{<db>: [<user doc>...], ...}`.
    ///
    /// Users listed under `admin` with a `db` field count for that
    /// database, and an `admin` entry wins over a same-named local one.
    pub fn install(&self, raw: &Doc) {
        let mut map = Map::new();
        for (db, users) in raw.iter() {
            let Value::Array(users) = users else { continue };
            for user in users {
                let Some(user) = user.as_doc() else { continue };
                let Some(name) = user.get_str("user") else { continue };

                let effective_db = if db == "admin" {
                    user.get_str("db").unwrap_or(db)
                } else {
                    db
                };

                let key = (effective_db.to_owned(), name.to_owned());
                if db == "admin" {
                    map.insert(key, user.clone());
                } else {
                    map.entry(key).or_insert_with(|| user.clone());
                }
            }
        }
        *self.cache.lock() = Some(Arc::new(map));
    }
}

#[cfg(test)]
mod tests {
    use keel_doc::{array, doc};

    use super::*;

    #[test]
    fn install_and_find() {
        let cache = CredentialsCache::new();
        assert!(!cache.ready());
        assert!(cache.find("app", "alice").is_none());

        cache.install(&doc! {
            "app" => array![doc! { "user" => "alice", "pwd" => "d1" }],
            "admin" => array![doc! { "user" => "root", "pwd" => "d2" }],
        });
        assert!(cache.ready());
        assert_eq!(
            cache.find("app", "alice").unwrap().get_str("pwd"),
            Some("d1")
        );
        assert_eq!(
            cache.find("admin", "root").unwrap().get_str("pwd"),
            Some("d2")
        );
        assert!(cache.find("app", "bob").is_none());
    }

    #[test]
    fn admin_entry_with_db_field_counts_for_that_db() {
        let cache = CredentialsCache::new();
        cache.install(&doc! {
            "app" => array![doc! { "user" => "alice", "pwd" => "local" }],
            "admin" => array![doc! { "user" => "alice", "db" => "app", "pwd" => "global" }],
        });
        assert_eq!(
            cache.find("app", "alice").unwrap().get_str("pwd"),
            Some("global")
        );
    }
}
