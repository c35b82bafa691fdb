use std::sync::Arc;

use keel_doc::doc;
use keel_engine::DataSource;

use crate::{CursorMap, CursorScope};

#[test]
fn insert_take_round_trip() {
    let map = CursorMap::new();
    let ds = DataSource::fixed(doc! { "x" => 1 });
    let id = ds.id();

    map.insert(ds);
    assert_eq!(map.len(), 1);

    let back = map.take(id).unwrap();
    assert_eq!(back.id(), id);
    assert!(map.is_empty());
    assert!(map.take(id).is_none());
}

#[test]
fn taking_an_unknown_id_is_none() {
    let map = CursorMap::new();
    assert!(map.take(42).is_none());
}

#[test]
fn global_scope_shares_one_map() {
    let shared = Arc::new(CursorMap::new());
    let a = CursorScope::Global(Arc::clone(&shared));
    let b = CursorScope::Global(Arc::clone(&shared));

    let ds = DataSource::fixed(doc! {});
    let id = ds.id();
    a.map().insert(ds);
    assert!(b.map().take(id).is_some());

    let local = CursorScope::Local(CursorMap::new());
    let ds = DataSource::fixed(doc! {});
    let id = ds.id();
    local.map().insert(ds);
    assert!(shared.take(id).is_none());
    assert!(local.map().take(id).is_some());
}
