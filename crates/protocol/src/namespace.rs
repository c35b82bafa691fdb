//! `(database, collection)` pairs and their dotted string form

use std::fmt;

use crate::{ProtocolError, Result};

/// A namespace addresses one collection: `db.collection`. The collection
/// part may itself contain dots (`db.system.users`); only the first dot
/// splits.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Namespace {
    full: String,
    dot: usize,
}

impl Namespace {
    pub fn new(db: impl AsRef<str>, coll: impl AsRef<str>) -> Self {
        let db = db.as_ref();
        Self {
            full: format!("{}.{}", db, coll.as_ref()),
            dot: db.len(),
        }
    }

    /// Parse a dotted form; requires at least one dot
    pub fn parse(s: impl Into<String>) -> Result<Self> {
        let full = s.into();
        match full.find('.') {
            Some(dot) if dot > 0 && dot + 1 < full.len() => Ok(Self { full, dot }),
            _ => Err(ProtocolError::BadNamespace(full)),
        }
    }

    #[inline]
    pub fn db(&self) -> &str {
        &self.full[..self.dot]
    }

    #[inline]
    pub fn collection(&self) -> &str {
        &self.full[self.dot + 1..]
    }

    #[inline]
    pub fn full(&self) -> &str {
        &self.full
    }

    /// True for the `$cmd` pseudo-collection that carries commands
    pub fn is_command(&self) -> bool {
        self.collection() == "$cmd"
    }

    /// The `$cmd` namespace of this namespace's database
    pub fn cmd(&self) -> Namespace {
        Namespace::new(self.db(), "$cmd")
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full)
    }
}
