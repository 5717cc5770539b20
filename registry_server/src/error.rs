//! Registry error taxonomy and its HTTP mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::services::credentials::AuthError;

pub type RegistryResult<T> = Result<T, RegistryError>;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Repository, build, tag or file is absent.
    #[error("{0}")]
    NotFound(String),

    /// Any credential failure. The inner kind is for logs and tests only.
    #[error("Unauthorized")]
    Unauthorized(#[from] AuthError),

    /// The CI source could not be reached or answered with an error.
    #[error("CI source unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("Storage failure: {0}")]
    StorageFailure(String),

    /// Malformed request: bad JSON, bad page index, bad multipart form.
    #[error("{0}")]
    InvalidInput(String),
}

impl RegistryError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn invalid(what: impl Into<String>) -> Self {
        Self::InvalidInput(what.into())
    }

    pub fn upstream(err: anyhow::Error) -> Self {
        Self::UpstreamUnavailable(format!("{err:#}"))
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::NotFound(_) | Self::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::UpstreamUnavailable(_) | Self::StorageFailure(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<std::io::Error> for RegistryError {
    fn from(err: std::io::Error) -> Self {
        Self::StorageFailure(err.to_string())
    }
}

impl From<serde_json::Error> for RegistryError {
    fn from(err: serde_json::Error) -> Self {
        Self::StorageFailure(format!("snapshot encoding: {err}"))
    }
}

impl IntoResponse for RegistryError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }
        let body = serde_json::json!({ "error": self.to_string() });
        (status, Json(body)).into_response()
    }
}
