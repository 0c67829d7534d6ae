use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crosswire_shared::{CryptoError, CrosswireError, IdentityError};
use crosswire_store::StoreError;
use crosswire_transport::TransportError;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Capacity exceeded: {0}")]
    Capacity(String),

    #[error("Rejected: {0}")]
    Policy(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Disabled: {0}")]
    Disabled(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, ServerError>;

impl From<CryptoError> for ServerError {
    fn from(e: CryptoError) -> Self {
        ServerError::Crypto(e.to_string())
    }
}

impl From<IdentityError> for ServerError {
    fn from(e: IdentityError) -> Self {
        ServerError::Crypto(e.to_string())
    }
}

impl From<CrosswireError> for ServerError {
    fn from(e: CrosswireError) -> Self {
        match e {
            CrosswireError::Crypto(e) => e.into(),
            CrosswireError::Identity(e) => e.into(),
            CrosswireError::Protocol(msg) => ServerError::Protocol(msg),
            CrosswireError::Serialization(e) => ServerError::Protocol(e.to_string()),
            CrosswireError::Io(e) => ServerError::Internal(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for ServerError {
    fn from(e: serde_json::Error) -> Self {
        ServerError::Protocol(e.to_string())
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ServerError::NotFound(_) | ServerError::Store(StoreError::NotFound) => {
                (StatusCode::NOT_FOUND, self.to_string())
            }
            ServerError::BadRequest(_) | ServerError::Protocol(_) => {
                (StatusCode::BAD_REQUEST, self.to_string())
            }
            ServerError::Forbidden(_) => (StatusCode::FORBIDDEN, self.to_string()),
            ServerError::Policy(_) => (StatusCode::CONFLICT, self.to_string()),
            ServerError::Capacity(_) => (StatusCode::SERVICE_UNAVAILABLE, self.to_string()),
            ServerError::Disabled(_) => (StatusCode::NOT_IMPLEMENTED, self.to_string()),
            ServerError::Store(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "Storage error".to_string())
            }
            ServerError::Crypto(_)
            | ServerError::Transport(_)
            | ServerError::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }
        };

        let body = serde_json::json!({
            "error": message,
        });

        (status, axum::Json(body)).into_response()
    }
}
