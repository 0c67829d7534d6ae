use thiserror::Error;

use crosswire_shared::{CryptoError, CrosswireError, IdentityError};
use crosswire_transport::TransportError;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Join rejected: {0}")]
    Rejected(String),

    #[error("Not joined to a channel")]
    NotJoined,

    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Admin API returned {status}: {message}")]
    Api { status: u16, message: String },
}

pub type Result<T> = std::result::Result<T, ClientError>;

impl From<CryptoError> for ClientError {
    fn from(e: CryptoError) -> Self {
        ClientError::Crypto(e.to_string())
    }
}

impl From<IdentityError> for ClientError {
    fn from(e: IdentityError) -> Self {
        ClientError::Crypto(e.to_string())
    }
}

impl From<CrosswireError> for ClientError {
    fn from(e: CrosswireError) -> Self {
        match e {
            CrosswireError::Crypto(e) => e.into(),
            CrosswireError::Identity(e) => e.into(),
            CrosswireError::Protocol(msg) => ClientError::Protocol(msg),
            CrosswireError::Serialization(e) => ClientError::Protocol(e.to_string()),
            CrosswireError::Io(e) => ClientError::Protocol(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(e: serde_json::Error) -> Self {
        ClientError::Protocol(e.to_string())
    }
}
