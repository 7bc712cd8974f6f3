/**
 * ERRORS - Failure taxonomy of the registrar
 *
 * ROLE : one enum per concern. Backend failures never abort the process,
 * store failures are fatal only while restoring a snapshot at startup,
 * request failures are turned into HTTP client errors.
 */

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// Transport level failure: connection refused, timeout, DNS...
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("backend returned {status} on {operation}: {body}")]
    Status {
        operation: &'static str,
        status: u16,
        body: String,
    },
    #[error("invalid backend payload: {0}")]
    Decode(String),
    #[error("backend authentication failed: {0}")]
    Auth(String),
}

impl From<reqwest::Error> for BackendError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            BackendError::Decode(e.to_string())
        } else {
            BackendError::Unavailable(e.to_string())
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("snapshot {path} is corrupt, refusing to start over it: {source}")]
    CorruptSnapshot {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io { path: path.into(), source }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("unsupported content type: {0:?}")]
    UnsupportedContentType(String),
    #[error("malformed request: {0}")]
    Malformed(String),
    #[error("unauthorized")]
    Unauthorized,
}

impl IntoResponse for RequestError {
    fn into_response(self) -> Response {
        match self {
            RequestError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                [(header::WWW_AUTHENTICATE, "Basic realm=\"registrar\"")],
                self.to_string(),
            )
                .into_response(),
            RequestError::UnsupportedContentType(_) | RequestError::Malformed(_) => {
                (StatusCode::BAD_REQUEST, self.to_string()).into_response()
            }
        }
    }
}
