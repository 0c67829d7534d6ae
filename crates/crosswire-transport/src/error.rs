use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("Queue full")]
    QueueFull,

    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Transport closed")]
    Closed,

    #[error("DNS error: {0}")]
    Dns(String),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, TransportError>;

impl From<hickory_resolver::proto::error::ProtoError> for TransportError {
    fn from(e: hickory_resolver::proto::error::ProtoError) -> Self {
        TransportError::Dns(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        TransportError::WebSocket(e.to_string())
    }
}
