//! Credentials refresh
//!
//! When auth is on, every database's `system.users` collection is pulled
//! through the regular read path on the config-server cadence and fed
//! into the credentials cache; a snapshot rides the cache file so
//! authentication works before the cluster answers.

use std::sync::Arc;

use keel_auth::Privileges;
use keel_doc::{doc, Doc, Value};
use keel_engine::Runtime;
use keel_protocol::{Namespace, Query};
use keel_topology::SNAPSHOT_AUTH;

use keel_backend::Result;

/// Pull the user listing of every known database
async fn fetch(rt: &Runtime) -> Result<Doc> {
    tracing::debug!("fetching credentials");
    let map = rt.topology.get()?;
    let opts = &rt.env.options;

    let read_pref = doc! {
        "mode" => "primaryPreferred",
        "timeoutMs" => opts.conf_timeout.as_millis() as i64,
        "retransmitMs" => opts.conf_retransmit.as_millis() as i64,
    };

    let mut out = Doc::new();
    let root = Privileges::root();
    for db in map.databases() {
        tracing::debug!(db = db.name(), "fetching credentials for database");
        let q = Query::synthetic(
            Namespace::new(db.name(), "system.users"),
            doc! {
                "$query" => doc! {},
                "$readPreference" => read_pref.clone(),
            },
        );

        let mut ds = keel_engine::query(rt, &q, &root).await?;
        let mut users: Vec<Value> = Vec::new();
        while let Some(user) = ds.get().cloned() {
            users.push(Value::Doc(user));
            ds.advance().await?;
        }
        ds.close().await;
        out.push(db.name(), users);
    }

    tracing::debug!("done fetching credentials");
    Ok(out)
}

/// One refresh: fetch, install, snapshot
pub async fn update_credentials(rt: &Runtime) -> Result<()> {
    let raw = fetch(rt).await?;
    rt.credentials.install(&raw);
    rt.snapshots.put(SNAPSHOT_AUTH, raw);
    Ok(())
}

/// Refresh forever on the config cadence; an immediate first pass when
/// no snapshot primed the cache
pub async fn keep_credentials_updated(rt: Arc<Runtime>) {
    if !rt.credentials.ready() {
        if let Err(e) = update_credentials(&rt).await {
            tracing::warn!(error = %e, "cannot fetch auth info");
        }
    }
    loop {
        tokio::time::sleep(rt.env.options.conf_interval).await;
        if let Err(e) = update_credentials(&rt).await {
            tracing::warn!(error = %e, "cannot fetch auth info");
        }
    }
}
