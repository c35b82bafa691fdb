//! Command dispatch
//!
//! Commands arrive as queries against `<db>.$cmd`; the first field names
//! the command. Most answer locally, the write shapes reuse the write
//! protection of the session, reads go through the engines.

use keel_auth::{mknonce, Privilege};
use keel_doc::{doc, Doc, Value};
use keel_engine::WriteOp;
use keel_protocol::{Delete, Insert, Query, Update};

use keel_backend::Result;

use crate::session::{Session, WriteMsg};

fn success() -> Doc {
    doc! { "ok" => 1 }
}

fn failure(code: i64, msg: impl Into<String>) -> Doc {
    doc! { "ok" => 0, "errmsg" => msg.into(), "code" => code }
}

/// Run one command and produce its reply document
pub(crate) async fn dispatch(session: &mut Session, q: &Query) -> Result<Doc> {
    let db = q.ns.db().to_owned();
    let cmd = q.query.clone();
    let (verb, _) = cmd.front().expect("caller checked for emptiness");
    let verb = verb.to_lowercase();

    match verb.as_str() {
        "ping" => {
            // A usable proxy has a topology
            session.runtime().topology.get()?;
            Ok(success())
        }

        "ismaster" => {
            let now_ms = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_millis() as i64)
                .unwrap_or(0);
            Ok(doc! {
                "ok" => 1,
                "ismaster" => true,
                "maxBsonObjectSize" => 16 * 1024 * 1024,
                "maxMessageSizeBytes" => 16 * 1024 * 1024,
                "localTime" => Value::DateTime(now_ms),
                "maxWireVersion" => 2,
                "minWireVersion" => 0,
            })
        }

        "getlasterror" => match session.last_write_mut() {
            Some(op) => op.acknowledge(&cmd).await,
            None => Ok(doc! { "err" => Value::Null, "ok" => 1, "n" => 0 }),
        },

        "getlog" => Ok(doc! { "ok" => 1, "log" => Vec::<Value>::new() }),

        "replsetgetstatus" => Ok(doc! {
            "ok" => 0,
            "errmsg" => "replSetGetStatus is not supported through keel",
            "info" => "keel",
        }),

        "getnonce" => {
            let nonce = mknonce();
            session.nonce = Some(nonce.clone());
            Ok(doc! { "ok" => 1, "nonce" => nonce })
        }

        "authenticate" => {
            let presented = cmd.get_str("nonce").unwrap_or_default();
            let expected = session.nonce.take();
            if expected.as_deref() != Some(presented) || presented.is_empty() {
                return Ok(failure(18, "nonce mismatch"));
            }

            let credentials = session.runtime().credentials.clone();
            if !session.privileges.auth(&db, &cmd, &credentials) {
                return Ok(failure(18, "invalid username/password"));
            }
            Ok(success())
        }

        "listdatabases" => {
            let map = session.runtime().topology.get()?;
            let databases: Vec<Value> = map
                .databases()
                .iter()
                .map(|d| {
                    Value::Doc(doc! {
                        "name" => d.name(),
                        "sizeOnDisk" => 1,
                        "empty" => false,
                    })
                })
                .collect();
            Ok(doc! { "ok" => 1, "databases" => databases })
        }

        "insert" => {
            let msg = Insert::from_command(&db, &cmd)?;
            run_command_write(session, WriteMsg::Insert(msg)).await
        }

        "update" => {
            let msg = Update::from_command(&db, &cmd)?;
            run_command_write(session, WriteMsg::Update(msg)).await
        }

        "delete" => {
            let msg = Delete::from_command(&db, &cmd)?;
            run_command_write(session, WriteMsg::Delete(msg)).await
        }

        "findandmodify" => {
            run_command_write(session, WriteMsg::FindAndModify { db, cmd }).await
        }

        "count" => keel_engine::count(session.runtime(), q, &session.privileges).await,

        "distinct" => keel_engine::distinct(session.runtime(), q, &session.privileges).await,

        "setloglevel" => {
            session.privileges.require("admin", Privilege::DbAdmin)?;
            let level = cmd.front().and_then(|(_, v)| v.as_i64()).unwrap_or(0);
            match &session.runtime().log_hook {
                Some(hook) => {
                    hook(level);
                    Ok(success())
                }
                None => Ok(failure(59, "log level is fixed for this process")),
            }
        }

        _ => Ok(doc! {
            "ok" => 0,
            "err" => "unknown command",
            "bad cmd" => cmd.clone(),
        }),
    }
}

/// Command-form writes go through the same stale-config protection as
/// wire-form ones, but their ack comes back inline and nothing is
/// retained for getLastError
async fn run_command_write(session: &mut Session, msg: WriteMsg) -> Result<Doc> {
    let mut op: WriteOp = session.run_write(&msg).await;
    let status = op.last_status();
    op.finish();
    Ok(status)
}
