//! WebSocket backend. The server side listens with axum, the client side
//! dials with tokio-tungstenite. Both move one JSON [`TransportMessage`]
//! per binary frame.
//!
//! [`TransportMessage`]: crate::transport::TransportMessage

mod client;
mod server;

use std::time::Duration;

pub use client::WsClientTransport;
pub use server::WsServerTransport;

use crate::error::{Result, TransportError};

pub const PING_INTERVAL: Duration = Duration::from_secs(20);
/// A server connection silent for this long is dropped.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Map `ws://host:port/ws` to `http://host:port/info`.
pub fn info_url(ws_url: &str) -> Result<String> {
    let (scheme, rest) = ws_url
        .split_once("://")
        .ok_or_else(|| TransportError::InvalidAddress(ws_url.to_string()))?;
    let http = match scheme {
        "ws" | "http" => "http",
        "wss" | "https" => "https",
        _ => return Err(TransportError::InvalidAddress(ws_url.to_string())),
    };
    let authority = rest.split('/').next().unwrap_or_default();
    if authority.is_empty() {
        return Err(TransportError::InvalidAddress(ws_url.to_string()));
    }
    Ok(format!("{http}://{authority}/info"))
}
