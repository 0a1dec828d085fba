//! Integration tests for the `/v1` HTTP API.
//!
//! These tests drive the Axum router in-process with `oneshot`, over an
//! engine initialized on in-memory storage with a fixed root token.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;

use nsvault_core::{Core, CoreConfig};
use nsvault_server::routes;
use nsvault_server::state::AppState;
use nsvault_storage::MemoryBackend;

const ROOT: &str = "s.test-root";

/// Helper: a router over a fresh engine, plus the shared state.
async fn app() -> (Router, Arc<AppState>) {
    let (core, _) = Core::initialize_with_root_token(
        Arc::new(MemoryBackend::new()),
        CoreConfig::default(),
        ROOT,
    )
    .await
    .expect("initialize engine");
    let state = Arc::new(AppState::new(core));
    (routes::router(Arc::clone(&state), 16), state)
}

/// Helper: send one request and return (status, JSON body or `Null`).
async fn call(
    app: &Router,
    method: &str,
    uri: &str,
    token: Option<&str>,
    namespace: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header("X-Vault-Token", token);
    }
    if let Some(namespace) = namespace {
        builder = builder.header("X-Vault-Namespace", namespace);
    }
    let body = body.map_or_else(Body::empty, |v| Body::from(v.to_string()));
    let response = app
        .clone()
        .oneshot(builder.body(body).unwrap())
        .await
        .unwrap();

    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

// ── Health ───────────────────────────────────────────────────────────

#[tokio::test]
async fn test_health_needs_no_token() {
    let (app, _) = app().await;
    let (status, body) = call(&app, "GET", "/v1/sys/health", None, None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["initialized"], true);
    assert_eq!(body["sealed"], false);
}

#[tokio::test]
async fn test_shutdown_makes_everything_unavailable() {
    let (app, state) = app().await;
    state.core.shutdown();

    let (status, _) = call(&app, "GET", "/v1/sys/health", None, None, None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    let (status, body) = call(&app, "GET", "/v1/auth/token/lookup-self", Some(ROOT), None, None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"], "unavailable");
}

// ── Tokens ───────────────────────────────────────────────────────────

#[tokio::test]
async fn test_missing_token_is_unauthorized() {
    let (app, _) = app().await;
    let (status, body) = call(&app, "GET", "/v1/auth/token/lookup-self", None, None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "unauthenticated");
    assert!(body["message"].is_string());
}

#[tokio::test]
async fn test_lookup_self_returns_data() {
    let (app, _) = app().await;
    let (status, body) = call(&app, "GET", "/v1/auth/token/lookup-self", Some(ROOT), None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["policies"], json!(["root"]));
}

#[tokio::test]
async fn test_bearer_header_is_accepted() {
    let (app, _) = app().await;
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/v1/auth/token/lookup-self")
                .header("Authorization", format!("Bearer {ROOT}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("cache-control").unwrap(),
        "no-store"
    );
}

#[tokio::test]
async fn test_token_create_returns_auth_block() {
    let (app, _) = app().await;
    let (status, body) = call(
        &app,
        "POST",
        "/v1/auth/token/create",
        Some(ROOT),
        None,
        Some(json!({ "policies": ["default"] })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let token = body["auth"]["client_token"].as_str().unwrap().to_owned();
    assert_eq!(body["auth"]["policies"], json!(["default"]));

    let (status, _) = call(&app, "GET", "/v1/sys/mounts", Some(&token), None, None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

// ── Namespaces and secrets ───────────────────────────────────────────

#[tokio::test]
async fn test_namespace_header_scopes_requests() {
    let (app, state) = app().await;
    let (status, body) = call(&app, "POST", "/v1/sys/namespaces/ns1", Some(ROOT), None, None).await;
    assert!(status.is_success(), "{body}");
    state.core.wait_for_namespace("ns1").await.unwrap();

    let (status, _) = call(
        &app,
        "PUT",
        "/v1/sys/mounts/kv",
        Some(ROOT),
        Some("ns1"),
        Some(json!({ "type": "kv", "options": { "version": "2" } })),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = call(
        &app,
        "POST",
        "/v1/kv/data/app",
        Some(ROOT),
        Some("ns1/"),
        Some(json!({ "data": { "password": "hunter2" } })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = call(&app, "GET", "/v1/kv/data/app", Some(ROOT), Some("ns1"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["data"]["password"], "hunter2");

    // The root namespace has no such mount.
    let (status, _) = call(&app, "GET", "/v1/kv/data/app", Some(ROOT), None, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_list_method_and_query_agree() {
    let (app, state) = app().await;
    call(&app, "POST", "/v1/sys/namespaces/alpha", Some(ROOT), None, None).await;
    state.core.wait_for_namespace("alpha").await.unwrap();

    let (status, by_method) = call(&app, "LIST", "/v1/sys/namespaces", Some(ROOT), None, None).await;
    assert_eq!(status, StatusCode::OK);
    let (_, by_query) = call(&app, "GET", "/v1/sys/namespaces?list=true", Some(ROOT), None, None).await;
    assert_eq!(by_method["data"]["keys"], json!(["alpha/"]));
    assert_eq!(by_method["data"]["keys"], by_query["data"]["keys"]);
}

#[tokio::test]
async fn test_empty_listing_is_no_content() {
    let (app, _) = app().await;
    let (status, body) = call(&app, "LIST", "/v1/sys/namespaces", Some(ROOT), None, None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert!(body.is_null());
}

#[tokio::test]
async fn test_delete_non_empty_namespace_conflicts() {
    let (app, state) = app().await;
    call(&app, "POST", "/v1/sys/namespaces/ns1", Some(ROOT), None, None).await;
    state.core.wait_for_namespace("ns1").await.unwrap();
    call(&app, "POST", "/v1/sys/namespaces/ns2", Some(ROOT), Some("ns1"), None).await;
    state.core.wait_for_namespace("ns1/ns2").await.unwrap();

    let (status, body) = call(&app, "DELETE", "/v1/sys/namespaces/ns1", Some(ROOT), None, None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "not_empty");
}

// ── Malformed requests ───────────────────────────────────────────────

#[tokio::test]
async fn test_invalid_json_body_is_rejected() {
    let (app, _) = app().await;
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/sys/policies/acl/bad")
                .header("X-Vault-Token", ROOT)
                .body(Body::from("{not json"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_unsupported_method() {
    let (app, _) = app().await;
    let (status, body) = call(&app, "PATCH", "/v1/sys/mounts", Some(ROOT), None, None).await;
    assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(body["error"], "method_not_allowed");
}

#[tokio::test]
async fn test_malformed_policy_is_bad_request() {
    let (app, _) = app().await;
    let (status, body) = call(
        &app,
        "PUT",
        "/v1/sys/policies/acl/broken",
        Some(ROOT),
        None,
        Some(json!({ "policy": "path \"x\" { capabilities = [\"fly\"] }" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_policy");
}
