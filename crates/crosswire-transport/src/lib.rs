//! Lossy-link transports for crosswire.
//!
//! Three backends share one [`Transport`] trait:
//!
//! - [`raw::RawTransport`] sends chunked frames straight onto an Ethernet
//!   segment under EtherType `0x88B5`.
//! - [`mdns::MdnsTransport`] smuggles payloads through ephemeral mDNS service
//!   instances on 224.0.0.251:5353.
//! - [`ws::WsServerTransport`] / [`ws::WsClientTransport`] carry the same
//!   envelope over WebSocket.
//!
//! Chunk reassembly ([`reassembly::Reassembler`]), duplicate suppression
//! ([`seen::SeenCache`]) and the ACK registry ([`ack::PendingAcks`]) are
//! shared building blocks.

pub mod ack;
pub mod codec;
pub mod error;
pub mod factory;
pub mod mdns;
pub mod raw;
pub mod reassembly;
pub mod seen;
pub mod transport;
pub mod ws;

pub use codec::{Frame, MacAddr};
pub use error::{Result, TransportError};
pub use factory::build_transport;
pub use transport::{
    PeerInfo, ServiceInfo, Transport, TransportConfig, TransportMessage, TransportStats,
};
