//! Cursor resolution
//!
//! A datasource that is not exhausted after a batch parks here under its
//! cursor id until the client continues or kills it. The id space is
//! per-session by default; `--global-cursors` makes every session share
//! one process-wide map, letting clients continue cursors across
//! connections (through a load balancer, say).

use std::collections::HashMap;
use std::sync::Arc;

use keel_engine::DataSource;
use parking_lot::Mutex;

/// Cursor-id to datasource map
#[derive(Default)]
pub struct CursorMap {
    map: Mutex<HashMap<u64, DataSource>>,
}

impl CursorMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park a live datasource under its id
    pub fn insert(&self, ds: DataSource) {
        self.map.lock().insert(ds.id(), ds);
    }

    /// Remove and return; the caller owns the datasource again
    pub fn take(&self, id: u64) -> Option<DataSource> {
        self.map.lock().remove(&id)
    }

    pub fn len(&self) -> usize {
        self.map.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.lock().is_empty()
    }
}

/// Which map a session parks its cursors in
pub enum CursorScope {
    /// Cursors die with the session
    Local(CursorMap),
    /// Cursors shared process-wide
    Global(Arc<CursorMap>),
}

impl CursorScope {
    pub fn map(&self) -> &CursorMap {
        match self {
            CursorScope::Local(m) => m,
            CursorScope::Global(m) => m,
        }
    }
}
