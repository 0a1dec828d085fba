//! Shared helpers for `nsvault-core` integration tests.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;

use nsvault_core::{Core, CoreConfig, ErrorKind, Request, Response};
use nsvault_storage::MemoryBackend;
use serde_json::{Value, json};

/// A freshly initialized engine and its root token.
pub async fn engine() -> (Core, String) {
    Core::initialize(Arc::new(MemoryBackend::new()), CoreConfig::default())
        .await
        .expect("initialize engine")
}

/// Send a request, panicking on failure.
pub async fn ok(core: &Core, req: Request) -> Response {
    let desc = format!("{req:?}");
    match core.handle(req).await {
        Ok(resp) => resp,
        Err(e) => panic!("{desc} failed: {e}"),
    }
}

/// Send a request that must fail, returning the error kind.
pub async fn fails(core: &Core, req: Request) -> ErrorKind {
    let desc = format!("{req:?}");
    match core.handle(req).await {
        Ok(resp) => panic!("{desc} unexpectedly succeeded: {resp:?}"),
        Err(e) => e.kind(),
    }
}

/// Create namespace `name` under `parent` (`""` for root).
pub async fn create_namespace(core: &Core, root: &str, parent: &str, name: &str) {
    ok(
        core,
        Request::write(format!("sys/namespaces/{name}"))
            .namespace(parent)
            .token(root),
    )
    .await;
    let path = if parent.is_empty() {
        name.to_owned()
    } else {
        format!("{parent}/{name}")
    };
    core.wait_for_namespace(&path).await.unwrap();
}

/// Mount a KV v2 engine at `path` in `ns` and write `title` into it.
pub async fn kv_with_secret(core: &Core, root: &str, ns: &str, path: &str, title: &str) {
    ok(
        core,
        Request::write(format!("sys/mounts/{path}"))
            .namespace(ns)
            .token(root)
            .data(json!({ "type": "kv", "options": { "version": "2" } })),
    )
    .await;
    ok(
        core,
        Request::write(format!("{path}/data/{title}"))
            .namespace(ns)
            .token(root)
            .data(json!({ "data": { "username": "myadmin", "password": "123456" } })),
    )
    .await;
}

/// Write policy `name` in `ns`.
pub async fn put_policy(core: &Core, root: &str, ns: &str, name: &str, text: &str) {
    ok(
        core,
        Request::write(format!("sys/policies/acl/{name}"))
            .namespace(ns)
            .token(root)
            .data(json!({ "policy": text })),
    )
    .await;
}

/// Mint a token in `ns` through `auth/token/create`.
pub async fn token_with(core: &Core, root: &str, ns: &str, policies: &[&str]) -> String {
    ok(
        core,
        Request::write("auth/token/create")
            .namespace(ns)
            .token(root)
            .data(json!({ "policies": policies })),
    )
    .await
    .auth
    .expect("auth block")
    .client_token
}

/// Enable userpass at `mount` in `ns`, create `user` with `policies`, and
/// log in.
pub async fn userpass_token(
    core: &Core,
    root: &str,
    ns: &str,
    mount: &str,
    user: &str,
    policies: &[&str],
) -> String {
    let mounted = ok(core, Request::read("sys/auth").namespace(ns).token(root)).await;
    if mounted.get(&format!("{mount}/")).is_none() {
        ok(
            core,
            Request::write(format!("sys/auth/{mount}"))
                .namespace(ns)
                .token(root)
                .data(json!({ "type": "userpass" })),
        )
        .await;
    }
    ok(
        core,
        Request::write(format!("auth/{mount}/users/{user}"))
            .namespace(ns)
            .token(root)
            .data(json!({ "password": "secret-pw", "policies": policies })),
    )
    .await;
    ok(
        core,
        Request::write(format!("auth/{mount}/login/{user}"))
            .namespace(ns)
            .data(json!({ "password": "secret-pw" })),
    )
    .await
    .auth
    .expect("auth block")
    .client_token
}

/// Whether `token` can read `<path>/data/<title>` in `ns`.
pub async fn can_read(core: &Core, token: &str, ns: &str, path: &str, title: &str) -> Result<Value, ErrorKind> {
    core.handle(
        Request::read(format!("{path}/data/{title}"))
            .namespace(ns)
            .token(token),
    )
    .await
    .map(|resp| resp.get("data").cloned().unwrap_or(Value::Null))
    .map_err(|e| e.kind())
}

/// Whether `token` can write a new secret `<path>/data/<title>1` in `ns`.
pub async fn can_write(core: &Core, token: &str, ns: &str, path: &str, title: &str) -> Result<(), ErrorKind> {
    core.handle(
        Request::write(format!("{path}/data/{title}1"))
            .namespace(ns)
            .token(token)
            .data(json!({ "data": { "username": "other", "password": "654321" } })),
    )
    .await
    .map(drop)
    .map_err(|e| e.kind())
}
