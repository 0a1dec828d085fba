//! Multi-namespace ACL scenarios driven through `Core::handle`.
//!
//! Each test builds a small namespace tree with KV mounts, policies and
//! tokens minted by `auth/token/create` or userpass logins, then checks
//! what every token can and cannot reach.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use common::{
    can_read, can_write, create_namespace, engine, fails, kv_with_secret, ok, put_policy,
    token_with, userpass_token,
};
use nsvault_core::{ErrorKind, Request};
use serde_json::json;

const MOUNT: &str = "mountPath";
const TITLE: &str = "mysecret";

/// Read-only access to a KV v2 mount at `path`.
fn kv_read_policy(path: &str) -> String {
    format!(
        r#"
path "{path}/config/*" {{ capabilities = ["read"] }}
path "{path}/metadata/*" {{ capabilities = ["read", "list"] }}
path "{path}/data/*" {{ capabilities = ["read"] }}
"#
    )
}

/// Read-write access to a KV v2 mount at `path`.
fn kv_write_policy(path: &str) -> String {
    format!(
        r#"
path "{path}/config/*" {{ capabilities = ["read"] }}
path "{path}/metadata/*" {{ capabilities = ["read", "list", "delete"] }}
path "{path}/data/*" {{ capabilities = ["create", "read", "update", "delete"] }}
"#
    )
}

/// `kv_read_policy` plus a rule reaching one namespace level down.
fn power_read_policy(path: &str) -> String {
    format!(
        "{}\npath \"+/{path}/data/*\" {{ capabilities = [\"read\"] }}\n",
        kv_read_policy(path)
    )
}

/// `kv_write_policy` plus a rule reaching one namespace level down.
fn power_write_policy(path: &str) -> String {
    format!(
        "{}\npath \"+/{path}/data/*\" {{ capabilities = [\"create\", \"read\", \"update\"] }}\n",
        kv_write_policy(path)
    )
}

// ── Single namespace ─────────────────────────────────────────────────

#[tokio::test]
async fn test_read_only_policy_reads_but_cannot_write() {
    let (core, root) = engine().await;
    kv_with_secret(&core, &root, "", "pfx", TITLE).await;
    put_policy(&core, &root, "", "pfx-read", &kv_read_policy("pfx")).await;
    let token = token_with(&core, &root, "", &["pfx-read"]).await;

    let data = can_read(&core, &token, "", "pfx", TITLE).await.unwrap();
    assert_eq!(data["username"], "myadmin");
    assert_eq!(
        can_write(&core, &token, "", "pfx", TITLE).await,
        Err(ErrorKind::PermissionDenied)
    );
}

#[tokio::test]
async fn test_write_policy_creates_and_updates() {
    let (core, root) = engine().await;
    kv_with_secret(&core, &root, "", "pfx", TITLE).await;
    put_policy(&core, &root, "", "pfx-write", &kv_write_policy("pfx")).await;
    let token = token_with(&core, &root, "", &["pfx-write"]).await;

    can_write(&core, &token, "", "pfx", TITLE).await.unwrap();
    can_write(&core, &token, "", "pfx", TITLE).await.unwrap();
    let meta = ok(
        &core,
        Request::read(format!("pfx/metadata/{TITLE}1")).token(&token),
    )
    .await;
    assert_eq!(meta.get("current_version"), Some(&json!(2)));
}

#[tokio::test]
async fn test_default_policy_alone_grants_no_secrets() {
    let (core, root) = engine().await;
    kv_with_secret(&core, &root, "", MOUNT, TITLE).await;
    let token = token_with(&core, &root, "", &["default"]).await;

    assert_eq!(
        can_read(&core, &token, "", MOUNT, TITLE).await,
        Err(ErrorKind::PermissionDenied)
    );
    let me = ok(&core, Request::read("auth/token/lookup-self").token(&token)).await;
    assert_eq!(me.get("policies"), Some(&json!(["default"])));
}

#[tokio::test]
async fn test_deleted_policy_degrades_to_no_access() {
    let (core, root) = engine().await;
    kv_with_secret(&core, &root, "", MOUNT, TITLE).await;
    put_policy(&core, &root, "", "reader", &kv_read_policy(MOUNT)).await;
    let token = token_with(&core, &root, "", &["reader"]).await;
    can_read(&core, &token, "", MOUNT, TITLE).await.unwrap();

    ok(&core, Request::delete("sys/policies/acl/reader").token(&root)).await;

    assert_eq!(
        can_read(&core, &token, "", MOUNT, TITLE).await,
        Err(ErrorKind::PermissionDenied)
    );
    // The token itself stays valid.
    ok(&core, Request::read("auth/token/lookup-self").token(&token)).await;
}

#[tokio::test]
async fn test_capabilities_self_reports_granted_set() {
    let (core, root) = engine().await;
    put_policy(&core, &root, "", "reader", &kv_read_policy(MOUNT)).await;
    let token = token_with(&core, &root, "", &["reader"]).await;

    let resp = ok(
        &core,
        Request::write("sys/capabilities-self")
            .token(&token)
            .data(json!({ "paths": [format!("{MOUNT}/data/x"), "sys/mounts"] })),
    )
    .await;
    assert_eq!(resp.get(&format!("{MOUNT}/data/x")), Some(&json!(["read"])));
    assert_eq!(resp.get("sys/mounts"), Some(&json!(["deny"])));

    let resp = ok(
        &core,
        Request::write("sys/capabilities-self")
            .token(&root)
            .data(json!({ "path": "anything" })),
    )
    .await;
    assert_eq!(resp.get("capabilities"), Some(&json!(["root"])));
}

// ── Sibling isolation ────────────────────────────────────────────────

/// Build `ns1` and `ns1/ns2`, each with a KV mount and a userpass mount
/// at the same path, and the read and write policies.
async fn mixed_tree(core: &nsvault_core::Core, root: &str) {
    create_namespace(core, root, "", "ns1").await;
    create_namespace(core, root, "ns1", "ns2").await;
    for ns in ["", "ns1", "ns1/ns2"] {
        kv_with_secret(core, root, ns, MOUNT, TITLE).await;
        put_policy(core, root, ns, "userread", &kv_read_policy(MOUNT)).await;
        put_policy(core, root, ns, "userwrite", &kv_write_policy(MOUNT)).await;
    }
}

#[tokio::test]
async fn test_mixed_tokens_act_only_in_their_own_namespace() {
    let (core, root) = engine().await;
    mixed_tree(&core, &root).await;

    let namespaces = ["", "ns1", "ns1/ns2"];
    let mut readers = Vec::new();
    let mut writers = Vec::new();
    for ns in namespaces {
        readers.push(userpass_token(&core, &root, ns, MOUNT, "reader", &["userread"]).await);
        writers.push(token_with(&core, &root, ns, &["userwrite"]).await);
    }

    for (i, home) in namespaces.iter().enumerate() {
        for (j, target) in namespaces.iter().enumerate() {
            let read = can_read(&core, &readers[i], target, MOUNT, TITLE).await;
            let write = can_write(&core, &writers[i], target, MOUNT, TITLE).await;
            if i == j {
                assert!(read.is_ok(), "reader from '{home}' in its own namespace");
                assert!(write.is_ok(), "writer from '{home}' in its own namespace");
                assert_eq!(
                    can_write(&core, &readers[i], target, MOUNT, TITLE).await,
                    Err(ErrorKind::PermissionDenied),
                    "reader from '{home}' must not write"
                );
            } else {
                assert_eq!(
                    read,
                    Err(ErrorKind::PermissionDenied),
                    "reader from '{home}' reached '{target}'"
                );
                assert_eq!(
                    write,
                    Err(ErrorKind::PermissionDenied),
                    "writer from '{home}' reached '{target}'"
                );
            }
        }
    }
}

#[tokio::test]
async fn test_mixed_tree_tears_down_bottom_up() {
    let (core, root) = engine().await;
    mixed_tree(&core, &root).await;

    for ns in ["ns1/ns2", "ns1", ""] {
        ok(&core, Request::delete(format!("sys/mounts/{MOUNT}")).namespace(ns).token(&root)).await;
    }
    assert_eq!(
        fails(&core, Request::delete("sys/namespaces/ns1").token(&root)).await,
        ErrorKind::NotEmpty
    );
    ok(&core, Request::delete("sys/namespaces/ns2").namespace("ns1").token(&root)).await;
    ok(&core, Request::delete("sys/namespaces/ns1").token(&root)).await;

    let listing = ok(&core, Request::list("sys/namespaces").token(&root)).await;
    assert!(listing.data.is_none());
    assert_eq!(
        fails(&core, Request::read("sys/policies/acl/userread").namespace("ns1").token(&root)).await,
        ErrorKind::NotFound
    );
}

// ── Power policies ───────────────────────────────────────────────────

#[tokio::test]
async fn test_power_policy_reaches_exactly_one_level_down() {
    let (core, root) = engine().await;
    create_namespace(&core, &root, "", "ns1").await;
    create_namespace(&core, &root, "ns1", "ns2").await;
    create_namespace(&core, &root, "ns1/ns2", "ns3").await;
    for ns in ["ns1", "ns1/ns2", "ns1/ns2/ns3"] {
        kv_with_secret(&core, &root, ns, MOUNT, TITLE).await;
    }
    put_policy(&core, &root, "ns1", "powerread", &power_read_policy(MOUNT)).await;
    put_policy(&core, &root, "ns1", "powerwrite", &power_write_policy(MOUNT)).await;
    let reader = token_with(&core, &root, "ns1", &["powerread"]).await;
    let writer = token_with(&core, &root, "ns1", &["powerwrite"]).await;

    can_read(&core, &reader, "ns1", MOUNT, TITLE).await.unwrap();
    can_read(&core, &reader, "ns1/ns2", MOUNT, TITLE).await.unwrap();
    assert_eq!(
        can_write(&core, &reader, "ns1/ns2", MOUNT, TITLE).await,
        Err(ErrorKind::PermissionDenied)
    );
    can_write(&core, &writer, "ns1/ns2", MOUNT, TITLE).await.unwrap();

    assert_eq!(
        can_read(&core, &reader, "ns1/ns2/ns3", MOUNT, TITLE).await,
        Err(ErrorKind::PermissionDenied)
    );
    assert_eq!(
        can_write(&core, &writer, "ns1/ns2/ns3", MOUNT, TITLE).await,
        Err(ErrorKind::PermissionDenied)
    );
    // Never upwards either.
    kv_with_secret(&core, &root, "", MOUNT, TITLE).await;
    assert_eq!(
        can_read(&core, &reader, "", MOUNT, TITLE).await,
        Err(ErrorKind::PermissionDenied)
    );
}

#[tokio::test]
async fn test_power_rule_does_not_leak_into_sibling_mounts() {
    let (core, root) = engine().await;
    create_namespace(&core, &root, "", "ns1").await;
    create_namespace(&core, &root, "ns1", "ns2").await;
    kv_with_secret(&core, &root, "ns1/ns2", MOUNT, TITLE).await;
    kv_with_secret(&core, &root, "ns1/ns2", "other", TITLE).await;
    put_policy(&core, &root, "ns1", "powerread", &power_read_policy(MOUNT)).await;
    let reader = token_with(&core, &root, "ns1", &["powerread"]).await;

    can_read(&core, &reader, "ns1/ns2", MOUNT, TITLE).await.unwrap();
    assert_eq!(
        can_read(&core, &reader, "ns1/ns2", "other", TITLE).await,
        Err(ErrorKind::PermissionDenied)
    );
    // Plain rules never apply across the boundary.
    assert_eq!(
        fails(
            &core,
            Request::read(format!("{MOUNT}/metadata/{TITLE}"))
                .namespace("ns1/ns2")
                .token(&reader)
        )
        .await,
        ErrorKind::PermissionDenied
    );
}

#[tokio::test]
async fn test_redeclared_power_policy_reaches_the_next_level() {
    let (core, root) = engine().await;
    create_namespace(&core, &root, "", "ns1").await;
    create_namespace(&core, &root, "ns1", "ns2").await;
    create_namespace(&core, &root, "ns1/ns2", "ns3").await;
    for ns in ["ns1", "ns1/ns2", "ns1/ns2/ns3"] {
        kv_with_secret(&core, &root, ns, MOUNT, TITLE).await;
    }
    put_policy(&core, &root, "ns1", "powerread", &power_read_policy(MOUNT)).await;
    put_policy(&core, &root, "ns1/ns2", "powerread", &power_read_policy(MOUNT)).await;
    let upper = token_with(&core, &root, "ns1", &["powerread"]).await;
    let lower = token_with(&core, &root, "ns1/ns2", &["powerread"]).await;

    can_read(&core, &lower, "ns1/ns2", MOUNT, TITLE).await.unwrap();
    can_read(&core, &lower, "ns1/ns2/ns3", MOUNT, TITLE).await.unwrap();
    assert_eq!(
        can_read(&core, &lower, "ns1", MOUNT, TITLE).await,
        Err(ErrorKind::PermissionDenied)
    );
    // The ns1 grant still stops at ns2.
    assert_eq!(
        can_read(&core, &upper, "ns1/ns2/ns3", MOUNT, TITLE).await,
        Err(ErrorKind::PermissionDenied)
    );
}

#[tokio::test]
async fn test_power_token_cannot_mint_tokens_below_its_namespace() {
    let (core, root) = engine().await;
    create_namespace(&core, &root, "", "ns1").await;
    create_namespace(&core, &root, "ns1", "ns2").await;
    kv_with_secret(&core, &root, "ns1/ns2", MOUNT, TITLE).await;
    put_policy(
        &core,
        &root,
        "ns1",
        "ops",
        r#"path "+/auth/token/create" { capabilities = ["create", "update"] }"#,
    )
    .await;
    // Same name, unrelated admin policy in the child.
    put_policy(
        &core,
        &root,
        "ns1/ns2",
        "ops",
        r#"path "*" { capabilities = ["create", "read", "update", "delete", "list"] }"#,
    )
    .await;
    let token = token_with(&core, &root, "ns1", &["ops"]).await;

    assert_eq!(
        can_read(&core, &token, "ns1/ns2", MOUNT, TITLE).await,
        Err(ErrorKind::PermissionDenied)
    );
    for body in [json!({}), json!({ "policies": ["ops"] })] {
        assert_eq!(
            fails(
                &core,
                Request::write("auth/token/create")
                    .namespace("ns1/ns2")
                    .token(&token)
                    .data(body)
            )
            .await,
            ErrorKind::PermissionDenied
        );
    }
}

// ── Root tokens ──────────────────────────────────────────────────────

#[tokio::test]
async fn test_root_token_reaches_every_descendant() {
    let (core, root) = engine().await;
    create_namespace(&core, &root, "", "ns1").await;
    create_namespace(&core, &root, "ns1", "ns2").await;
    kv_with_secret(&core, &root, "ns1/ns2", MOUNT, TITLE).await;
    can_read(&core, &root, "ns1/ns2", MOUNT, TITLE).await.unwrap();
}

#[tokio::test]
async fn test_child_root_token_is_not_valid_in_parent() {
    let (core, root) = engine().await;
    create_namespace(&core, &root, "", "ns1").await;
    create_namespace(&core, &root, "ns1", "ns2").await;
    kv_with_secret(&core, &root, "", MOUNT, TITLE).await;
    kv_with_secret(&core, &root, "ns1/ns2", MOUNT, TITLE).await;
    let child_root = token_with(&core, &root, "ns1", &["root"]).await;

    can_read(&core, &child_root, "ns1/ns2", MOUNT, TITLE).await.unwrap();
    assert_eq!(
        can_read(&core, &child_root, "", MOUNT, TITLE).await,
        Err(ErrorKind::PermissionDenied)
    );
    assert_eq!(
        fails(&core, Request::list("sys/namespaces").token(&child_root)).await,
        ErrorKind::PermissionDenied
    );
}
