//! HTTP error types for the `nsvault` server.
//!
//! Maps engine errors from `nsvault-core` into HTTP responses. Every error
//! produces a JSON body with a machine-readable `error` field (the engine's
//! error kind) and a human-readable `message`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use nsvault_core::{ErrorKind, RequestError};

/// Application-level error returned from HTTP handlers.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// The engine rejected the request.
    #[error(transparent)]
    Engine(#[from] RequestError),
    /// The HTTP request itself is malformed (body, header or method).
    #[error("{0}")]
    BadRequest(String),
    /// The HTTP method has no engine operation.
    #[error("method {0} is not supported")]
    MethodNotAllowed(String),
}

/// JSON error response body.
#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

/// The status code an engine error kind is reported with.
#[must_use]
pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Conflict | ErrorKind::NotEmpty => StatusCode::CONFLICT,
        ErrorKind::InvalidPolicy | ErrorKind::Protected | ErrorKind::InvalidRequest => {
            StatusCode::BAD_REQUEST
        }
        ErrorKind::Unauthenticated | ErrorKind::InvalidCredentials => StatusCode::UNAUTHORIZED,
        ErrorKind::PermissionDenied => StatusCode::FORBIDDEN,
        ErrorKind::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_type) = match &self {
            Self::Engine(err) => (status_for(err.kind()), err.kind().as_str()),
            Self::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            Self::MethodNotAllowed(_) => (StatusCode::METHOD_NOT_ALLOWED, "method_not_allowed"),
        };

        // Storage failures may carry backend details.
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, "internal error serving request");
            "internal error".to_owned()
        } else {
            self.to_string()
        };

        let body = ErrorBody {
            error: error_type,
            message,
        };

        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_kind_has_a_client_or_server_status() {
        let kinds = [
            ErrorKind::NotFound,
            ErrorKind::Conflict,
            ErrorKind::NotEmpty,
            ErrorKind::InvalidPolicy,
            ErrorKind::Protected,
            ErrorKind::Unauthenticated,
            ErrorKind::PermissionDenied,
            ErrorKind::InvalidCredentials,
            ErrorKind::InvalidRequest,
            ErrorKind::Unavailable,
            ErrorKind::Internal,
        ];
        for kind in kinds {
            let status = status_for(kind);
            assert!(status.is_client_error() || status.is_server_error(), "{kind:?}");
        }
        assert_eq!(status_for(ErrorKind::PermissionDenied), StatusCode::FORBIDDEN);
        assert_eq!(status_for(ErrorKind::Unavailable), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn malformed_requests_are_bad_requests() {
        let resp = AppError::BadRequest("invalid JSON body".to_owned()).into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = AppError::MethodNotAllowed("PATCH".to_owned()).into_response();
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
    }
}
