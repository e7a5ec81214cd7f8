//! Error types for the upload proxy

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use ferry_auth::TokenError;
use ferry_pki::PkiError;

use crate::readiness::ReadinessError;

/// Result type for upload proxy operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for upload proxy operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No Authorization header
    #[error("missing authorization header")]
    MissingAuthorization,

    /// Authorization header is not a bearer token
    #[error("malformed authorization header")]
    MalformedAuthorization,

    /// Token failed verification or policy
    #[error("token rejected: {0}")]
    Token(#[from] TokenError),

    /// Target never became ready, or cannot accept uploads
    #[error(transparent)]
    Readiness(#[from] ReadinessError),

    /// Target's content type has no upload path
    #[error("rejecting upload request for {name}: content type {content_type} is invalid")]
    InvalidContentType {
        /// Target claim name
        name: String,
        /// The unsupported content type
        content_type: String,
    },

    /// Backend request could not be completed
    #[error("upload server request failed: {0}")]
    Backend(String),

    /// Trust material could not be loaded
    #[error("trust material error: {0}")]
    Pki(#[from] PkiError),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// HTTP status returned to the client for this error
    pub fn status(&self) -> StatusCode {
        match self {
            Error::MissingAuthorization | Error::MalformedAuthorization => StatusCode::BAD_REQUEST,
            Error::Token(_) => StatusCode::UNAUTHORIZED,
            Error::Readiness(ReadinessError::AlreadyCompleted { .. }) => StatusCode::BAD_REQUEST,
            Error::Readiness(_) | Error::InvalidContentType { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Error::Backend(_) | Error::Pki(_) | Error::Config(_) | Error::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        (self.status(), self.to_string()).into_response()
    }
}
