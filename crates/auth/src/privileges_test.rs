use keel_doc::{array, doc};

use crate::{make_auth_key, CredentialsCache, Privilege, Privileges};

#[test]
fn root_authorizes_everything() {
    let p = Privileges::root();
    assert!(p.require("anything", Privilege::ClusterAdmin).is_ok());
}

#[test]
fn anonymous_denies_until_authenticated() {
    let p = Privileges::anonymous();
    assert!(p.require("app", Privilege::Read).is_err());
    assert!(!p.authorized("app", Privilege::Write));
}

fn cache_with(db: &str, user: keel_doc::Doc) -> CredentialsCache {
    let cache = CredentialsCache::new();
    cache.install(&doc! { db => array![user] });
    cache
}

fn auth_cmd(db: &str, user: &str, digest: &str) -> keel_doc::Doc {
    let nonce = "0011223344556677";
    doc! {
        "authenticate" => 1,
        "user" => user,
        "nonce" => nonce,
        "key" => make_auth_key(nonce, user, digest),
    }
}

#[test]
fn successful_auth_applies_roles() {
    let cache = cache_with(
        "app",
        doc! {
            "user" => "alice",
            "pwd" => "digest-a",
            "roles" => array!["readWrite"],
        },
    );

    let mut p = Privileges::anonymous();
    assert!(p.auth("app", &auth_cmd("app", "alice", "digest-a"), &cache));
    assert!(p.authorized("app", Privilege::Read));
    assert!(p.authorized("app", Privilege::Write));
    assert!(!p.authorized("app", Privilege::UserAdmin));
    assert!(!p.authorized("other", Privilege::Read));
}

#[test]
fn wrong_key_is_rejected() {
    let cache = cache_with(
        "app",
        doc! { "user" => "alice", "pwd" => "digest-a", "roles" => array!["read"] },
    );
    let mut p = Privileges::anonymous();
    assert!(!p.auth("app", &auth_cmd("app", "alice", "wrong-digest"), &cache));
    assert!(!p.authorized("app", Privilege::Read));
}

#[test]
fn unknown_user_is_rejected() {
    let cache = cache_with("app", doc! { "user" => "alice", "pwd" => "d" });
    let mut p = Privileges::anonymous();
    assert!(!p.auth("app", &auth_cmd("app", "bob", "d"), &cache));
}

#[test]
fn legacy_user_gets_write_only_with_explicit_marker() {
    // No readOnly field at all: read only
    let cache = cache_with("app", doc! { "user" => "alice", "pwd" => "d" });
    let mut p = Privileges::anonymous();
    assert!(p.auth("app", &auth_cmd("app", "alice", "d"), &cache));
    assert!(p.authorized("app", Privilege::Read));
    assert!(!p.authorized("app", Privilege::Write));

    // readOnly: false grants write
    let cache = cache_with(
        "app",
        doc! { "user" => "alice", "pwd" => "d", "readOnly" => false },
    );
    let mut p = Privileges::anonymous();
    assert!(p.auth("app", &auth_cmd("app", "alice", "d"), &cache));
    assert!(p.authorized("app", Privilege::Write));

    // readOnly: true does not
    let cache = cache_with(
        "app",
        doc! { "user" => "alice", "pwd" => "d", "readOnly" => true },
    );
    let mut p = Privileges::anonymous();
    assert!(p.auth("app", &auth_cmd("app", "alice", "d"), &cache));
    assert!(!p.authorized("app", Privilege::Write));
}

#[test]
fn admin_wide_roles_are_global() {
    let cache = cache_with(
        "admin",
        doc! {
            "user" => "root",
            "pwd" => "d",
            "roles" => array!["readWriteAnyDatabase", "clusterAdmin"],
        },
    );
    let mut p = Privileges::anonymous();
    assert!(p.auth("admin", &auth_cmd("admin", "root", "d"), &cache));
    assert!(p.authorized("whatever", Privilege::Write));
    assert!(p.authorized("config", Privilege::ClusterAdmin));
}
