//! Per-session privilege masks

use std::collections::HashMap;

use keel_doc::{Doc, Value};

use crate::cache::CredentialsCache;
use crate::secret::make_auth_key;
use crate::{AuthError, Result};

/// The capabilities a privilege check can demand
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Privilege {
    /// Execute queries and basic commands
    Read = 1,
    /// Execute inserts, updates and deletes
    Write = 2,
    /// Execute most commands
    DbAdmin = 3,
    /// Access `<db>.system.users` in any way
    UserAdmin = 4,
    /// Access replica set and sharding configuration
    ClusterAdmin = 5,
}

fn mask(p: Privilege) -> u32 {
    1 << (p as u32)
}

/// What one session is allowed to do, per database plus a global mask.
///
/// A non-enforcing instance (auth turned off, or internal operations)
/// authorizes everything.
#[derive(Debug, Clone)]
pub struct Privileges {
    enforcing: bool,
    global_mask: u32,
    masks: HashMap<String, u32>,
}

impl Privileges {
    /// A fresh unauthenticated session under `--auth`
    pub fn anonymous() -> Self {
        Self {
            enforcing: true,
            global_mask: 0,
            masks: HashMap::new(),
        }
    }

    /// Everything allowed; used when auth is off and for internal reads
    pub fn root() -> Self {
        Self {
            enforcing: false,
            global_mask: u32::MAX,
            masks: HashMap::new(),
        }
    }

    pub fn authorized(&self, db: &str, p: Privilege) -> bool {
        let bit = mask(p);
        self.global_mask & bit != 0 || self.masks.get(db).is_some_and(|m| m & bit != 0)
    }

    /// Fail with `Unauthorized` unless the session may do `p` on `db`
    pub fn require(&self, db: &str, p: Privilege) -> Result<()> {
        if self.enforcing && !self.authorized(db, p) {
            return Err(AuthError::Unauthorized);
        }
        Ok(())
    }

    /// Validate an `authenticate` command against the stored credentials
    /// and widen this session's masks on success.
    pub fn auth(&mut self, db: &str, cmd: &Doc, cache: &CredentialsCache) -> bool {
        if !self.enforcing {
            return true;
        }

        let Some(user) = cmd.get_str("user") else {
            return false;
        };
        let Some(stored) = cache.find(db, user) else {
            return false;
        };

        let key = stored
            .get_doc("credentials")
            .and_then(|c| c.get_str("KEEL-CR"))
            .or_else(|| stored.get_str("pwd"))
            .unwrap_or("");
        if key.is_empty() {
            return false;
        }

        let nonce = cmd.get_str("nonce").unwrap_or("");
        if cmd.get_str("key").unwrap_or("") != make_auth_key(nonce, user, key) {
            return false;
        }

        if let Some(roles) = stored.get_array("roles") {
            if let Err(e) = self.apply_roles(db, roles) {
                tracing::warn!(db, user, error = %e, "cannot apply roles");
                return false;
            }
        } else {
            // Legacy users: read always; write only with an explicit
            // readOnly: false marker
            let m = self.masks.entry(db.to_owned()).or_insert(0);
            *m |= mask(Privilege::Read);
            if stored.get("readOnly").is_some() && stored.get_i64("readOnly").unwrap_or(1) == 0 {
                *m |= mask(Privilege::Write);
            }
        }

        if let Some(other) = stored.get_doc("otherDBRoles") {
            for (other_db, roles) in other.iter() {
                if let Value::Array(roles) = roles {
                    if self.apply_roles(other_db, roles).is_err() {
                        return false;
                    }
                }
            }
        }

        true
    }

    fn apply_roles(&mut self, db: &str, roles: &[Value]) -> Result<()> {
        let mut new_mask = 0;
        let mut new_global = 0;
        let is_admin = db == "admin";

        for role in roles {
            let name = match role {
                Value::String(s) => s.as_str(),
                Value::Doc(d) => d.get_str("role").unwrap_or(""),
                other => {
                    tracing::warn!(role = %other, "cannot parse role definition");
                    continue;
                }
            };

            match name {
                "read" => new_mask |= mask(Privilege::Read),
                "readWrite" => new_mask |= mask(Privilege::Read) | mask(Privilege::Write),
                "dbAdmin" => new_mask |= mask(Privilege::DbAdmin),
                "userAdmin" => new_mask |= mask(Privilege::UserAdmin),
                "dbOwner" => {
                    new_mask |= mask(Privilege::Read)
                        | mask(Privilege::Write)
                        | mask(Privilege::DbAdmin)
                        | mask(Privilege::UserAdmin)
                }
                "clusterAdmin" if is_admin => new_global |= mask(Privilege::ClusterAdmin),
                "readAnyDatabase" if is_admin => new_global |= mask(Privilege::Read),
                "readWriteAnyDatabase" if is_admin => {
                    new_global |= mask(Privilege::Read) | mask(Privilege::Write)
                }
                "userAdminAnyDatabase" if is_admin => new_global |= mask(Privilege::UserAdmin),
                "dbAdminAnyDatabase" if is_admin => new_global |= mask(Privilege::DbAdmin),
                other => {
                    return Err(AuthError::UnknownRole {
                        role: other.to_owned(),
                        db: db.to_owned(),
                    })
                }
            }
        }

        *self.masks.entry(db.to_owned()).or_insert(0) |= new_mask;
        self.global_mask |= new_global;
        Ok(())
    }
}
