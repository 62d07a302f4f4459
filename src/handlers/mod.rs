//! HTTP handlers and response shaping.
//!
//! Every response uses the `{result, msg, error, data}` envelope; errors map
//! onto it through [`ApiError`].

pub mod batch;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};

use crate::error::Error;

/// Build the standard response envelope.
pub fn envelope(result: bool, msg: &str, error: &str, data: Value) -> Value {
    json!({
        "result": result,
        "msg": msg,
        "error": error,
        "data": data,
    })
}

/// API-level error, already shaped for the wire.
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    InvalidParameters { msg: String, data: Value },
    Cluster { msg: String, data: Value },
    Storage(String),
    Internal(String),
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, msg, data) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "DoesNotExist", msg, json!("")),
            ApiError::InvalidParameters { msg, data } => {
                (StatusCode::BAD_REQUEST, "InvalidParameters", msg, data)
            }
            ApiError::Cluster { msg, data } => {
                tracing::error!(error = %msg, "Cluster error surfaced to client");
                (StatusCode::INTERNAL_SERVER_ERROR, "ClusterError", msg, data)
            }
            ApiError::Storage(msg) => {
                tracing::error!(error = %msg, "Storage error surfaced to client");
                (StatusCode::INTERNAL_SERVER_ERROR, "StorageError", msg, json!(""))
            }
            ApiError::Internal(msg) => {
                tracing::error!(error = %msg, "Internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "InternalError",
                    "Internal server error".to_string(),
                    json!(""),
                )
            }
        };

        (status, Json(envelope(false, &msg, error, data))).into_response()
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        match err {
            Error::InvalidParameters { fields } => ApiError::InvalidParameters {
                msg: "One or more fields had invalid values".to_string(),
                data: serde_json::to_value(fields).unwrap_or_default(),
            },
            Error::InvalidState(msg) => ApiError::InvalidParameters {
                msg,
                data: json!(""),
            },
            Error::NotFound(what) => ApiError::NotFound(format!("{what} not found.")),
            Error::Cluster { message, response } => ApiError::Cluster {
                msg: message,
                data: response.unwrap_or_else(|| json!("")),
            },
            Error::Storage(msg) => ApiError::Storage(msg),
            Error::Database(e) => ApiError::Internal(format!("database error: {e}")),
            Error::Config(msg) => ApiError::Internal(msg),
        }
    }
}
