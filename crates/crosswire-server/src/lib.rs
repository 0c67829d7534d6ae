//! # crosswire-server
//!
//! The single authoritative broadcaster of a crosswire channel. Members send
//! signed, encrypted messages over one of the lossy transports; the server
//! authenticates them, applies the abuse controls, persists what it accepts
//! and rebroadcasts it encrypted and signed with its own key.

pub mod api;
pub mod auth;
pub mod broadcast;
pub mod channel;
pub mod config;
pub mod error;
pub mod events;
pub mod keyring;
pub mod offline;
pub mod rate_limit;
pub mod router;
pub mod server;
pub mod spam;

#[cfg(test)]
mod testing;

pub use config::ServerConfig;
pub use error::{Result, ServerError};
pub use server::{Server, ServerStats};
