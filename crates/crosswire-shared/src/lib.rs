//! # crosswire-shared
//!
//! Types and primitives shared by every crosswire crate: the crypto
//! contract (AES-256-GCM, Ed25519, Argon2id, SHA-256), the domain model,
//! and the JSON envelopes exchanged over every transport.

pub mod constants;
pub mod crypto;
pub mod error;
pub mod identity;
pub mod protocol;
pub mod types;

pub use error::{CryptoError, CrosswireError, IdentityError};
pub use identity::Identity;
