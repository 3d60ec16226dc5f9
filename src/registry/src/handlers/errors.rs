use crate::error::{NotFoundKind, RegistryError};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// Registry error rendered as `{"errors":[{"code","message","detail"}]}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::new(StatusCode::METHOD_NOT_ALLOWED, "UNSUPPORTED", message)
    }

    pub fn not_implemented(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_IMPLEMENTED, "UNSUPPORTED", message)
    }

    pub fn unknown_route(path: &str) -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            "NAME_UNKNOWN",
            format!("no registry route for {}", path),
        )
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn code(&self) -> &'static str {
        self.code
    }
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        let (status, code) = match &err {
            RegistryError::NotFound { kind, .. } => (
                StatusCode::NOT_FOUND,
                match kind {
                    NotFoundKind::Blob => "BLOB_UNKNOWN",
                    NotFoundKind::Manifest => "MANIFEST_UNKNOWN",
                    NotFoundKind::Upload => "BLOB_UPLOAD_UNKNOWN",
                },
            ),
            RegistryError::DigestMismatch { .. } | RegistryError::InvalidDigest(_) => {
                (StatusCode::BAD_REQUEST, "DIGEST_INVALID")
            }
            RegistryError::RangeMismatch { .. } => {
                (StatusCode::RANGE_NOT_SATISFIABLE, "BLOB_UPLOAD_INVALID")
            }
            RegistryError::SessionBusy(_) | RegistryError::InvalidState { .. } => {
                (StatusCode::CONFLICT, "BLOB_UPLOAD_INVALID")
            }
            RegistryError::MissingReference(_) => (StatusCode::BAD_REQUEST, "MANIFEST_BLOB_UNKNOWN"),
            RegistryError::InvalidName(_) => (StatusCode::BAD_REQUEST, "NAME_INVALID"),
            RegistryError::ManifestInvalid(_) => (StatusCode::BAD_REQUEST, "MANIFEST_INVALID"),
            RegistryError::UpstreamUnavailable { .. } => (StatusCode::GATEWAY_TIMEOUT, "UNKNOWN"),
            RegistryError::UpstreamRejected { .. } | RegistryError::UpstreamIntegrity { .. } => {
                (StatusCode::BAD_GATEWAY, "UNKNOWN")
            }
            RegistryError::Io(_)
            | RegistryError::Http(_)
            | RegistryError::Serialization(_)
            | RegistryError::ConfigurationInvalid(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "UNKNOWN")
            }
        };

        if status.is_server_error() {
            tracing::error!(error = %err, status = status.as_u16(), "Request failed");
        } else {
            tracing::debug!(error = %err, status = status.as_u16(), "Request rejected");
        }

        Self::new(status, code, err.to_string())
    }
}

impl From<axum::http::Error> for ApiError {
    fn from(err: axum::http::Error) -> Self {
        tracing::error!(error = %err, "Failed to build response");
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "UNKNOWN", err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "errors": [{
                "code": self.code,
                "message": self.message,
                "detail": null,
            }]
        });
        (self.status, Json(body)).into_response()
    }
}
