//! HTTP routes: `/v1/sys/health` and the catch-all `/v1/{*path}`.
//!
//! Every API path is forwarded to [`Core::handle`](nsvault_core::Core::handle)
//! as one [`Request`]. The HTTP method picks the operation:
//!
//! - `GET` reads, or lists with `?list=true`
//! - `LIST` lists
//! - `POST` / `PUT` write, with an optional JSON object body
//! - `DELETE` deletes
//!
//! The token travels in `X-Vault-Token` (or `Authorization: Bearer`), the
//! namespace in `X-Vault-Namespace`.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{Value, json};
use tower::limit::ConcurrencyLimitLayer;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use nsvault_core::{Operation, Request};

use crate::error::AppError;
use crate::state::AppState;

/// Header carrying the client token.
pub const TOKEN_HEADER: &str = "x-vault-token";
/// Header carrying the namespace path.
pub const NAMESPACE_HEADER: &str = "x-vault-namespace";

/// Query parameters accepted on every API path.
#[derive(Debug, Default, Deserialize)]
pub struct ApiQuery {
    /// `true` turns a `GET` into a list.
    #[serde(default)]
    list: Option<String>,
}

/// Build the Axum router with all routes and middleware.
pub fn router(state: Arc<AppState>, max_concurrent_requests: usize) -> Router {
    Router::new()
        .route("/v1/sys/health", get(health))
        .route("/v1/{*path}", any(handle))
        .layer(ConcurrencyLimitLayer::new(max_concurrent_requests))
        .layer(TraceLayer::new_for_http())
        .layer(SetResponseHeaderLayer::overriding(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-store"),
        ))
        .with_state(state)
}

/// `GET /v1/sys/health`, served without a token.
async fn health(State(state): State<Arc<AppState>>) -> Response {
    let closed = state.core.is_closed();
    let status = if closed {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    let body = json!({
        "initialized": true,
        "sealed": closed,
        "standby": false,
        "server_time_utc": Utc::now().timestamp(),
        "started_at": state.started_at.to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION"),
    });
    (status, Json(body)).into_response()
}

/// Forward one API call to the engine.
async fn handle(
    State(state): State<Arc<AppState>>,
    method: Method,
    Path(path): Path<String>,
    Query(query): Query<ApiQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let operation = operation_for(&method, query.list.as_deref())?;

    let mut req = Request::new(operation, path);
    if let Some(namespace) = header_str(&headers, NAMESPACE_HEADER)? {
        req = req.namespace(namespace.trim_matches('/'));
    }
    if let Some(token) = client_token(&headers)? {
        req = req.token(token);
    }
    if operation == Operation::Write || operation == Operation::Delete {
        req = req.data(parse_body(&body)?);
    }

    let resp = state.core.handle(req).await?;
    if resp.data.is_none() && resp.auth.is_none() {
        return Ok(StatusCode::NO_CONTENT.into_response());
    }
    Ok(Json(resp).into_response())
}

fn operation_for(method: &Method, list: Option<&str>) -> Result<Operation, AppError> {
    match method.as_str() {
        "GET" if list.is_some_and(|v| v.eq_ignore_ascii_case("true")) => Ok(Operation::List),
        "GET" => Ok(Operation::Read),
        "LIST" => Ok(Operation::List),
        "POST" | "PUT" => Ok(Operation::Write),
        "DELETE" => Ok(Operation::Delete),
        other => Err(AppError::MethodNotAllowed(other.to_owned())),
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Result<Option<&'a str>, AppError> {
    headers
        .get(name)
        .map(|value| {
            value
                .to_str()
                .map_err(|_| AppError::BadRequest(format!("header {name} is not valid text")))
        })
        .transpose()
        .map(|value| value.map(str::trim).filter(|v| !v.is_empty()))
}

fn client_token(headers: &HeaderMap) -> Result<Option<&str>, AppError> {
    if let Some(token) = header_str(headers, TOKEN_HEADER)? {
        return Ok(Some(token));
    }
    Ok(header_str(headers, header::AUTHORIZATION.as_str())?
        .and_then(|auth| auth.strip_prefix("Bearer "))
        .map(str::trim))
}

fn parse_body(body: &[u8]) -> Result<Value, AppError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(json!({}));
    }
    match serde_json::from_slice(body) {
        Ok(value @ Value::Object(_)) => Ok(value),
        Ok(_) => Err(AppError::BadRequest("request body must be a JSON object".to_owned())),
        Err(e) => Err(AppError::BadRequest(format!("invalid JSON body: {e}"))),
    }
}
