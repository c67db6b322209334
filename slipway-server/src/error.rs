//! Unified server error type.
//!
//! Every handler returns `Result<T, ServerError>`, which implements
//! [`axum::response::IntoResponse`] so errors become a JSON body
//! `{"error": "..."}` with a matching status code.
//!
//! Internal errors (store, render, archive) are logged with full detail but
//! only a generic message is returned to the caller.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;
use tracing::error;

use slipway_core::bootaction::BootActionError;
use slipway_core::store::StoreError;

#[derive(Debug, Error)]
pub enum ServerError {
    /// The caller referenced a resource that does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The caller sent an invalid or malformed request.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// No credential was presented.
    #[error("unauthorised")]
    Unauthorized,

    /// A credential was presented but rejected.
    #[error("forbidden")]
    Forbidden,

    #[error("conflict: {0}")]
    Conflict(String),

    /// Propagated from the orchestration core.
    #[error(transparent)]
    Core(#[from] slipway_core::Error),

    #[error("database error: {0}")]
    Store(#[from] StoreError),

    /// An unclassified internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<BootActionError> for ServerError {
    fn from(e: BootActionError) -> Self {
        match e {
            BootActionError::Unauthenticated => ServerError::Unauthorized,
            BootActionError::Forbidden => ServerError::Forbidden,
            BootActionError::NotFound(m) => ServerError::NotFound(m),
            BootActionError::Conflict(m) => ServerError::Conflict(m),
            BootActionError::BadRequest(m) => ServerError::BadRequest(m),
            BootActionError::Internal(e) => ServerError::Core(e),
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        use slipway_core::Error as Core;

        let (status, client_message) = match &self {
            ServerError::NotFound(m) => (StatusCode::NOT_FOUND, m.clone()),
            ServerError::BadRequest(m) => (StatusCode::BAD_REQUEST, m.clone()),
            ServerError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorised".to_owned()),
            ServerError::Forbidden => (StatusCode::FORBIDDEN, "forbidden".to_owned()),
            ServerError::Conflict(m) => (StatusCode::CONFLICT, m.clone()),

            ServerError::Core(e) => match e {
                Core::Validation { .. } | Core::InvalidNodeFilter { .. } | Core::Design { .. } => {
                    (StatusCode::BAD_REQUEST, e.to_string())
                }
                Core::TaskNotFound { .. } => (StatusCode::NOT_FOUND, e.to_string()),
                Core::InvalidStateTransition { .. } => (StatusCode::CONFLICT, e.to_string()),
                Core::WaitTimeout { .. } => (StatusCode::REQUEST_TIMEOUT, e.to_string()),
                _ => {
                    error!(error = %e, "orchestration error");
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "internal server error".to_owned(),
                    )
                }
            },
            ServerError::Store(e) => {
                error!(error = %e, "database error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".to_owned(),
                )
            }
            ServerError::Internal(m) => {
                error!(message = %m, "internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".to_owned(),
                )
            }
        };
        (status, Json(json!({ "error": client_message }))).into_response()
    }
}

impl From<anyhow::Error> for ServerError {
    fn from(e: anyhow::Error) -> Self {
        error!(error = ?e, "converting anyhow error to ServerError::Internal");
        ServerError::Internal(e.to_string())
    }
}
