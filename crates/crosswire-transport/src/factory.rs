use std::sync::Arc;

use crosswire_shared::types::TransportMode;
use tracing::info;

use crate::error::Result;
use crate::mdns::MdnsTransport;
use crate::raw::RawTransport;
use crate::transport::{Transport, TransportConfig};
use crate::ws::{WsClientTransport, WsServerTransport};

/// Build the backend named by `config.mode`. For `Https`, a configured
/// `url` selects the dialing client, otherwise the listening server.
pub fn build_transport(config: TransportConfig) -> Result<Arc<dyn Transport>> {
    info!(mode = %config.mode, "building transport");
    let transport: Arc<dyn Transport> = match config.mode {
        TransportMode::Arp => Arc::new(RawTransport::open(config)?),
        TransportMode::Mdns => Arc::new(MdnsTransport::new(config)),
        TransportMode::Https if config.url.is_some() => Arc::new(WsClientTransport::new(config)),
        TransportMode::Https => Arc::new(WsServerTransport::new(config)),
    };
    Ok(transport)
}
