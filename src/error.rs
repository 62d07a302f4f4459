//! Error types for the batch job orchestrator.

use std::collections::BTreeMap;

use thiserror::Error;

/// Errors surfaced by the orchestrator.
///
/// `Cluster` carries the raw API response so callers can attach it to the
/// job record as a diagnostic payload.
#[derive(Debug, Error)]
pub enum Error {
    /// Client-side validation failure, with per-field messages.
    #[error("One or more fields had invalid values")]
    InvalidParameters { fields: BTreeMap<String, String> },

    /// Illegal lifecycle operation for the record's current status.
    #[error("{0}")]
    InvalidState(String),

    /// Kubernetes API failure.
    #[error("{message}")]
    Cluster {
        message: String,
        response: Option<serde_json::Value>,
    },

    /// Object store failure.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Unknown record or cluster object.
    #[error("{0} not found")]
    NotFound(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Single-field variant of `InvalidParameters`.
    pub fn invalid_field(field: &str, message: &str) -> Self {
        let mut fields = BTreeMap::new();
        fields.insert(field.to_string(), message.to_string());
        Error::InvalidParameters { fields }
    }

    /// Build a `Cluster` error out of a kube API failure, preserving the raw
    /// response where one exists.
    pub fn cluster(message: impl Into<String>, err: &kube::Error) -> Self {
        let response = match err {
            kube::Error::Api(api_err) => serde_json::to_value(api_err).ok(),
            other => Some(serde_json::Value::String(other.to_string())),
        };
        Error::Cluster {
            message: message.into(),
            response,
        }
    }

    /// The diagnostic payload to store as `last_pod_response`, if any.
    pub fn diagnostic(&self) -> Option<serde_json::Value> {
        match self {
            Error::Cluster { response, .. } => response.clone(),
            Error::Storage(msg) => Some(serde_json::Value::String(msg.clone())),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_field_carries_field_message() {
        let err = Error::invalid_field("docker_image", "Field is required");
        match err {
            Error::InvalidParameters { fields } => {
                assert_eq!(fields.get("docker_image").unwrap(), "Field is required");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn storage_error_has_diagnostic() {
        let err = Error::Storage("upload failed".into());
        assert_eq!(
            err.diagnostic(),
            Some(serde_json::Value::String("upload failed".into()))
        );
        assert!(Error::NotFound("x".into()).diagnostic().is_none());
    }
}
