//! # crosswire-client
//!
//! The member side of the crosswire protocol: derive the channel key, join
//! through the signed handshake, send signed and encrypted messages to the
//! server, and accept only broadcasts that carry the server's signature.
//!
//! [`admin::AdminClient`] talks to the server's admin HTTP API.

pub mod admin;
pub mod client;
pub mod envelope;
pub mod error;

pub use client::{ChannelClient, ClientConfig, Incoming};
pub use error::{ClientError, Result};
